use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::csv;
use super::error::{EngineError, EngineResult};

/// One extraction unit: a record discovered in a queue's baseline export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub address: String,
    pub building: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Done,
    Oversized,
}

impl QueueStatus {
    pub fn code(&self) -> i8 {
        match self {
            QueueStatus::Pending => 0,
            QueueStatus::Done => 1,
            QueueStatus::Oversized => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Done => "done",
            QueueStatus::Oversized => "oversized",
        }
    }

    pub fn from_code(code: i8) -> EngineResult<Self> {
        match code {
            0 => Ok(QueueStatus::Pending),
            1 => Ok(QueueStatus::Done),
            -1 => Ok(QueueStatus::Oversized),
            other => Err(EngineError::Checkpoint(format!(
                "invalid queue status code: {other}"
            ))),
        }
    }
}

const CHECKPOINT_HEADER: [&str; 4] = ["Address", "Building", "ID", "Complete"];

/// Persists per-target completion and per-queue status so a run can be
/// killed at any point and resumed without losing or repeating work.
/// Queue checkpoints are CSV, fully rewritten through a temp-file rename
/// so a crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
    progress_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(checkpoint_dir: impl AsRef<Path>) -> Self {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        let progress_path = checkpoint_dir.join("progress.json");
        Self {
            checkpoint_dir,
            progress_path,
        }
    }

    pub fn queue_path(&self, queue: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{queue}.csv"))
    }

    /// Creates the progress file and empty queue checkpoints on first run;
    /// leaves existing state untouched on resume.
    pub fn initialize(&self, queues: &[String]) -> EngineResult<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        if !self.progress_path.exists() {
            let progress: BTreeMap<&str, i8> =
                queues.iter().map(|name| (name.as_str(), 0)).collect();
            self.write_progress_map(&progress)?;
            info!(queues = queues.len(), "initialized session progress");
        }
        for queue in queues {
            let path = self.queue_path(queue);
            if !path.exists() {
                self.write_queue(queue, &[])?;
            }
        }
        Ok(())
    }

    pub fn load_queue(&self, queue: &str) -> EngineResult<Vec<Target>> {
        let path = self.queue_path(queue);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut records = csv::read_records(&content).into_iter();
        match records.next() {
            Some(header) if header == CHECKPOINT_HEADER => {}
            Some(header) => {
                return Err(EngineError::Checkpoint(format!(
                    "checkpoint {queue}: unexpected header {header:?}"
                )))
            }
            None => return Ok(Vec::new()),
        }
        let mut targets = Vec::new();
        for record in records {
            if record.len() != 4 {
                return Err(EngineError::Checkpoint(format!(
                    "checkpoint {queue}: malformed row {record:?}"
                )));
            }
            let completed = match record[3].as_str() {
                "true" => true,
                "false" => false,
                other => {
                    return Err(EngineError::Checkpoint(format!(
                        "checkpoint {queue}: invalid Complete value '{other}'"
                    )))
                }
            };
            targets.push(Target {
                address: record[0].clone(),
                building: record[1].clone(),
                id: record[2].clone(),
                completed,
            });
        }
        Ok(targets)
    }

    /// Full rewrite; target order is preserved exactly as given.
    pub fn write_queue(&self, queue: &str, targets: &[Target]) -> EngineResult<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let mut content = csv::write_record(&CHECKPOINT_HEADER);
        for target in targets {
            content.push_str(&csv::write_record(&[
                &target.address,
                &target.building,
                &target.id,
                if target.completed { "true" } else { "false" },
            ]));
        }
        self.atomic_write(&self.queue_path(queue), content.as_bytes())?;
        debug!(queue, targets = targets.len(), "checkpoint rewritten");
        Ok(())
    }

    pub fn load_progress(&self) -> EngineResult<BTreeMap<String, QueueStatus>> {
        let content = std::fs::read_to_string(&self.progress_path)?;
        let raw: BTreeMap<String, i8> = serde_json::from_str(&content)
            .map_err(|err| EngineError::Checkpoint(format!("progress file malformed: {err}")))?;
        let mut progress = BTreeMap::new();
        for (queue, code) in raw {
            progress.insert(queue, QueueStatus::from_code(code)?);
        }
        Ok(progress)
    }

    pub fn set_status(&self, queue: &str, status: QueueStatus) -> EngineResult<()> {
        let mut progress: BTreeMap<String, i8> = self
            .load_progress()?
            .into_iter()
            .map(|(name, status)| (name, status.code()))
            .collect();
        progress.insert(queue.to_string(), status.code());
        let progress: BTreeMap<&str, i8> = progress
            .iter()
            .map(|(name, code)| (name.as_str(), *code))
            .collect();
        self.write_progress_map(&progress)
    }

    fn write_progress_map(&self, progress: &BTreeMap<&str, i8>) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(progress)
            .map_err(|err| EngineError::Checkpoint(err.to_string()))?;
        self.atomic_write(&self.progress_path, json.as_bytes())
    }

    /// Reads the baseline export's ID, address and name columns and seeds
    /// the queue checkpoint with every target not yet attempted.
    pub fn populate_from_baseline(
        &self,
        queue: &str,
        baseline_path: &Path,
    ) -> EngineResult<Vec<Target>> {
        let content = std::fs::read_to_string(baseline_path)?;
        let mut records = csv::read_records(&content).into_iter();
        let header = records.next().ok_or_else(|| {
            EngineError::Checkpoint(format!("baseline export for {queue} is empty"))
        })?;
        let id_col = column_index(&header, "PropertyID", queue)?;
        let address_col = column_index(&header, "Property Address", queue)?;
        let name_col = column_index(&header, "Property Name", queue)?;

        let mut targets = Vec::new();
        for record in records {
            let field = |idx: usize| record.get(idx).cloned().unwrap_or_default();
            let id = field(id_col);
            if id.is_empty() {
                continue;
            }
            targets.push(Target {
                id,
                address: field(address_col),
                building: field(name_col),
                completed: false,
            });
        }
        self.write_queue(queue, &targets)?;
        info!(queue, targets = targets.len(), "queue populated from baseline export");
        Ok(targets)
    }

    /// Appends blank augmentation columns to the baseline export for the
    /// downstream cleaning pipeline, rewriting the file in place.
    pub fn augment_baseline(&self, baseline_path: &Path, columns: &[String]) -> EngineResult<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let content = std::fs::read_to_string(baseline_path)?;
        let records = csv::read_records(&content);
        let mut rewritten = String::new();
        for (idx, record) in records.iter().enumerate() {
            let mut fields: Vec<&str> = record.iter().map(String::as_str).collect();
            if idx == 0 {
                fields.extend(columns.iter().map(String::as_str));
            } else {
                fields.extend(std::iter::repeat("").take(columns.len()));
            }
            rewritten.push_str(&csv::write_record(&fields));
        }
        self.atomic_write(baseline_path, rewritten.as_bytes())
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> EngineResult<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn column_index(header: &[String], name: &str, queue: &str) -> EngineResult<usize> {
    header
        .iter()
        .position(|column| column == name)
        .ok_or_else(|| {
            EngineError::Checkpoint(format!(
                "baseline export for {queue} is missing column '{name}'"
            ))
        })
}
