//! facematch-ingest — run configuration, the embedding engine thread and the
//! probe ingestion pipeline.

pub mod config;
pub mod engine;
pub mod pipeline;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use pipeline::{IngestReport, Pipeline, PipelineError, DEFAULT_EMBED_TIMEOUT};
