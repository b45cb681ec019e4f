//! Processing pipeline: engine access, packaging, supervision and retention.

pub mod archive;
pub mod engine;
pub mod engine_pool;
pub mod purge;
pub mod runner;
pub mod supervisor;

pub use archive::{ArchiveBuilder, ArchiveSummary, DEFAULT_MAX_ARCHIVE_BYTES};
pub use engine::{
    BlockingEngine, BlockingSeparator, CommandEngine, CommandEngineFactory, EngineError,
    EngineFactory, SeparationEngine,
};
pub use engine_pool::{EngineLease, EnginePool};
pub use purge::{JobPurgeService, PurgeConfig};
pub use runner::{JobPipeline, PipelineConfig, RunOutcome};
pub use supervisor::PipelineSupervisor;
