pub mod ann;
pub mod graph;

pub use ann::{IndexError, SimilarityIndex};
pub use graph::InteractionGraph;
