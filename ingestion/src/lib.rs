pub mod embedding;
pub mod error;
pub mod normalizer;
pub mod processor;
pub mod urls;

pub use error::IngestionError;
pub use normalizer::{normalize, routing_key, NormalizedEvent, RawEvent};
pub use processor::{IngestOutcome, IngestionPipeline};
