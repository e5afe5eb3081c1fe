pub mod error;
pub mod params;
pub mod publisher;
pub mod service;
pub mod views;

pub use error::QueryError;
pub use params::{BotParams, GraphParams, NarrativeParams, ParamError, StatsParams};
pub use publisher::SnapshotPublisher;
pub use service::QueryService;
pub use views::{BotView, GraphView, NarrativeView, Projection, StatsView, UserView};
