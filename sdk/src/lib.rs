//! Embeddable detection engine: submit raw platform events, run the
//! periodic analysis, and read narratives, bots and communities back.

pub mod engine;
pub mod error;
pub mod runtime;

pub use engine::{
    AnalysisReport, DrainReport, Engine, EngineBuilder, IngestReport, ReplayReport,
};
pub use error::EngineError;
pub use runtime::EngineHandle;
