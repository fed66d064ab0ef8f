//! Resumable, fault-tolerant extraction engine for a portal that resists
//! automation. The engine executes named browser interactions from a step
//! catalog, clears transient interference before every step, retries with
//! escalating timeout tiers and checkpoints per-target progress so a
//! multi-hour run survives crashes and restarts.

pub mod config;
pub mod engine;
pub mod error;

pub use config::{load_harvest_config, Credentials, HarvestConfig};
pub use engine::{
    ArtifactStore, CheckpointStore, EngineError, EngineResult, InterferenceDetector,
    PortalLauncher, PortalPage, PortalSessionFactory, QueueStatus, RunLog, SessionController,
    SessionMetrics, StepCatalog, StepExecutor, StepRequest, Target,
};
pub use error::{ConfigError, Result};
