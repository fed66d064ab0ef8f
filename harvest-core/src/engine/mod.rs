pub mod artifacts;
pub mod catalog;
pub mod checkpoint;
mod csv;
pub mod error;
pub mod executor;
pub mod interference;
pub mod metrics;
pub mod page;
pub mod runlog;
pub mod session;
pub mod signal;
pub mod twofactor;

pub use artifacts::ArtifactStore;
pub use catalog::{ActionKind, Locator, LocatorStrategy, StepCatalog, StepDefinition};
pub use checkpoint::{CheckpointStore, QueueStatus, Target};
pub use error::{EngineError, EngineResult};
pub use executor::{StepExecutor, StepOutcome, StepRequest};
pub use interference::InterferenceDetector;
pub use metrics::SessionMetrics;
pub use page::{CdpPortalFactory, PortalLauncher, PortalPage, PortalSessionFactory};
pub use runlog::{RunEvent, RunEventKind, RunLog};
pub use session::SessionController;
pub use signal::{await_operator_cue, FileInbox, OperatorChannel, OperatorCue};
pub use twofactor::{CodeProvider, HttpSmsCodeProvider};
