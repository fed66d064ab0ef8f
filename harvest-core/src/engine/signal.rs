use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::SignalSection;

use super::error::{EngineError, EngineResult};

/// What the operator told a paused session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCue {
    Resume,
    Cancel,
}

/// Two-way channel to a human operator. `poll_message` consumes the
/// message it returns, so a cue is acted on exactly once.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> EngineResult<()>;
    async fn poll_message(&self) -> EngineResult<Option<String>>;
}

/// Blocks until the operator answers or the ceiling passes. Unrecognized
/// messages are discarded and polling continues.
pub async fn await_operator_cue(
    channel: &dyn OperatorChannel,
    section: &SignalSection,
) -> EngineResult<OperatorCue> {
    let interval = Duration::from_secs(section.poll_interval_seconds.max(1));
    let ceiling = section.ceiling_seconds;
    let mut waited = 0u64;
    loop {
        match channel.poll_message().await? {
            Some(message) => match parse_cue(&message) {
                Some(cue) => {
                    info!(?cue, "operator cue received");
                    return Ok(cue);
                }
                None => warn!(message, "ignoring unrecognized operator message"),
            },
            None => {}
        }
        if waited >= ceiling {
            return Err(EngineError::Signal(format!(
                "no operator cue within {ceiling} seconds"
            )));
        }
        tokio::time::sleep(interval).await;
        waited = waited.saturating_add(interval.as_secs());
    }
}

/// Operators answer in prose, so the token is matched anywhere in the
/// body. A message carrying both tokens cancels.
fn parse_cue(message: &str) -> Option<OperatorCue> {
    let body = message.to_ascii_lowercase();
    if body.contains("cancel") {
        Some(OperatorCue::Cancel)
    } else if body.contains("start") {
        Some(OperatorCue::Resume)
    } else {
        None
    }
}

/// Filesystem transport: notifications land as timestamped files in the
/// outbox, operator replies are read and deleted from the inbox. Both
/// directories are expected to be synced by an external relay.
#[derive(Debug, Clone)]
pub struct FileInbox {
    inbox_dir: PathBuf,
    outbox_dir: PathBuf,
}

impl FileInbox {
    pub fn new(inbox_dir: impl AsRef<Path>, outbox_dir: impl AsRef<Path>) -> Self {
        Self {
            inbox_dir: inbox_dir.as_ref().to_path_buf(),
            outbox_dir: outbox_dir.as_ref().to_path_buf(),
        }
    }

    fn oldest_inbox_file(&self) -> EngineResult<Option<PathBuf>> {
        if !self.inbox_dir.exists() {
            return Ok(None);
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.inbox_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files.into_iter().next())
    }
}

#[async_trait]
impl OperatorChannel for FileInbox {
    async fn notify(&self, subject: &str, body: &str) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.outbox_dir).await?;
        let name = format!("{}.txt", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let message = format!("{subject}\n\n{body}");
        tokio::fs::write(self.outbox_dir.join(name), message).await?;
        Ok(())
    }

    async fn poll_message(&self) -> EngineResult<Option<String>> {
        let Some(path) = self.oldest_inbox_file()? else {
            return Ok(None);
        };
        let message = tokio::fs::read_to_string(&path).await?;
        tokio::fs::remove_file(&path).await?;
        Ok(Some(message))
    }
}
