use serde::Serialize;

use harvest_core::CheckpointStore;

use crate::{AppContext, DisplayFallback, Result};

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub queues: Vec<QueueEntry>,
}

#[derive(Debug, Serialize)]
pub struct QueueEntry {
    pub name: String,
    pub status: String,
    pub completed: usize,
    pub total: usize,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        if self.queues.is_empty() {
            return "no checkpoints yet".to_string();
        }
        let mut out = String::new();
        for entry in &self.queues {
            out.push_str(&format!(
                "{:<24} {:<10} {}/{} targets\n",
                entry.name, entry.status, entry.completed, entry.total
            ));
        }
        out.trim_end().to_string()
    }
}

pub fn gather(context: &AppContext) -> Result<StatusReport> {
    let checkpoint_dir = context.checkpoint_dir();
    let store = CheckpointStore::new(&checkpoint_dir);
    if !checkpoint_dir.join("progress.json").exists() {
        return Ok(StatusReport { queues: Vec::new() });
    }
    let progress = store.load_progress()?;

    let mut queues = Vec::new();
    // Config order, not progress-file order.
    for name in &context.config.portal.queues {
        let Some(status) = progress.get(name) else {
            continue;
        };
        let targets = store.load_queue(name)?;
        queues.push(QueueEntry {
            name: name.clone(),
            status: status.as_str().to_string(),
            completed: targets.iter().filter(|t| t.completed).count(),
            total: targets.len(),
        });
    }
    Ok(StatusReport { queues })
}
