pub mod analysis;
pub mod bot_scorer;
pub mod clusterer;
pub mod graph_builder;
pub mod origin;
pub mod risk;

pub use analysis::{NarrativeAnalyzer, NarrativeSignals};
pub use bot_scorer::{AccountFeatures, BotScorer};
pub use clusterer::{Assignment, ClusterError, NarrativeClusterer, ReclusterReport};
pub use graph_builder::{GraphBuild, GraphBuilder, GraphError};
pub use origin::{trace_origin, OriginReport};
pub use risk::{assess, RiskInputs};
