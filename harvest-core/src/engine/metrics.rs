use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub steps_executed: u64,
    pub step_failures: u64,
    pub interferences_cleared: u64,
    pub reloads_forced: u64,
    pub targets_completed: u64,
    pub targets_failed: u64,
    pub targets_skipped: u64,
    pub artifacts_relocated: u64,
    pub images_stored: u64,
}

impl SessionMetrics {
    pub fn record_step(&mut self) {
        self.steps_executed = self.steps_executed.saturating_add(1);
    }

    pub fn record_step_failure(&mut self) {
        self.step_failures = self.step_failures.saturating_add(1);
    }

    pub fn record_interference(&mut self) {
        self.interferences_cleared = self.interferences_cleared.saturating_add(1);
    }

    pub fn record_reload(&mut self) {
        self.reloads_forced = self.reloads_forced.saturating_add(1);
    }

    pub fn record_target_completed(&mut self) {
        self.targets_completed = self.targets_completed.saturating_add(1);
    }

    pub fn record_target_failed(&mut self) {
        self.targets_failed = self.targets_failed.saturating_add(1);
    }

    pub fn record_target_skipped(&mut self) {
        self.targets_skipped = self.targets_skipped.saturating_add(1);
    }

    pub fn record_artifact(&mut self) {
        self.artifacts_relocated = self.artifacts_relocated.saturating_add(1);
    }

    pub fn record_image(&mut self) {
        self.images_stored = self.images_stored.saturating_add(1);
    }
}
