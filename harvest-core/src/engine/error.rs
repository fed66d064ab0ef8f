use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("step '{step}' failed after {attempts} attempts")]
    StepFailed {
        step: String,
        attempts: usize,
        fatal: bool,
    },
    #[error("target {id} extraction failed: {reason}")]
    TargetExtraction { id: String, reason: String },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("operator signal error: {0}")]
    Signal(String),
    #[error("session aborted: {0}")]
    SessionAbort(String),
    #[error("operator cancelled the run")]
    Cancelled,
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl EngineError {
    /// Fatal errors terminate the browser session and hand control to the
    /// crash-recovery wait; everything else is absorbed by the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::StepFailed { fatal, .. } => *fatal,
            EngineError::Launch(_)
            | EngineError::Configuration(_)
            | EngineError::SessionAbort(_)
            | EngineError::Cancelled => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Unexpected(err.to_string())
    }
}

impl From<crate::error::ConfigError> for EngineError {
    fn from(err: crate::error::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}
