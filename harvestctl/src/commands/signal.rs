use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::{AppContext, AppError, DisplayFallback, Result, SignalSendArgs};

#[derive(Debug, Serialize)]
pub struct SendReceipt {
    pub cue: String,
    pub path: String,
}

impl DisplayFallback for SendReceipt {
    fn display(&self) -> String {
        format!("cue '{}' written to {}", self.cue, self.path)
    }
}

pub fn send(context: &AppContext, args: &SignalSendArgs) -> Result<SendReceipt> {
    let cue = args.cue.trim().to_ascii_lowercase();
    if cue != "start" && cue != "cancel" {
        return Err(AppError::MissingResource(format!(
            "unknown cue '{}', expected 'start' or 'cancel'",
            args.cue
        )));
    }
    let inbox = context.inbox_dir();
    fs::create_dir_all(&inbox)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let path = inbox.join(format!("{stamp}.txt"));
    fs::write(&path, &cue)?;
    Ok(SendReceipt {
        cue,
        path: path.display().to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct OutboxListing {
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Serialize)]
pub struct Notification {
    pub file: String,
    pub message: String,
}

impl DisplayFallback for OutboxListing {
    fn display(&self) -> String {
        if self.notifications.is_empty() {
            return "outbox empty".to_string();
        }
        let mut out = String::new();
        for entry in &self.notifications {
            out.push_str(&format!("{}: {}\n", entry.file, entry.message));
        }
        out.trim_end().to_string()
    }
}

pub fn outbox(context: &AppContext) -> Result<OutboxListing> {
    let outbox = context.outbox_dir();
    let mut notifications = Vec::new();
    if outbox.exists() {
        let mut paths: Vec<_> = fs::read_dir(&outbox)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let message = fs::read_to_string(&path)?;
            notifications.push(Notification {
                file: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                message: message.trim().to_string(),
            });
        }
    }
    Ok(OutboxListing { notifications })
}
