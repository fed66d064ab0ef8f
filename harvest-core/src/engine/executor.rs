use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetrySection;

use super::catalog::{ActionKind, Locator, StepCatalog};
use super::error::{EngineError, EngineResult};
use super::interference::InterferenceDetector;
use super::page::PortalPage;
use super::runlog::{RunEventKind, RunLog};

/// One step invocation. The catalog carries the default locator and keys;
/// a request can override both and declares how failures are treated.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub name: String,
    pub locator_override: Option<Locator>,
    pub keys_override: Option<String>,
    /// Failing a required step aborts the session; an optional step's
    /// failure is logged and skipped.
    pub required: bool,
    /// Unstable steps get a single generous attempt instead of the
    /// escalating tiers; retrying them would re-trigger side effects.
    pub unstable: bool,
    /// When set, the executor forces navigation back to this URL before
    /// attempting the step.
    pub expected_url: Option<String>,
    /// Pacing delay before the first attempt. The portal rate-limits
    /// aggressively; most steps carry a second or two of slack.
    pub wait_before: Option<Duration>,
}

impl StepRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator_override: None,
            keys_override: None,
            required: false,
            unstable: false,
            expected_url: None,
            wait_before: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unstable(mut self) -> Self {
        self.unstable = true;
        self
    }

    pub fn with_keys(mut self, keys: impl Into<String>) -> Self {
        self.keys_override = Some(keys.into());
        self
    }

    pub fn with_locator(mut self, locator: Locator) -> Self {
        self.locator_override = Some(locator);
        self
    }

    pub fn expect_url(mut self, url: impl Into<String>) -> Self {
        self.expected_url = Some(url.into());
        self
    }

    pub fn pause_secs(mut self, seconds: u64) -> Self {
        self.wait_before = Some(Duration::from_secs(seconds));
        self
    }
}

/// What a successful step cost, for the session's metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOutcome {
    pub attempts: usize,
    pub interferences_cleared: usize,
    pub reloads: usize,
}

/// Drives catalog steps against a portal page with escalating retry
/// tiers. Between tiers the page is swept for interference and reloaded,
/// which clears most transient portal states without human help.
pub struct StepExecutor {
    catalog: Arc<StepCatalog>,
    detector: Arc<InterferenceDetector>,
    run_log: Arc<RunLog>,
    retry: RetrySection,
}

impl StepExecutor {
    pub fn new(
        catalog: Arc<StepCatalog>,
        detector: Arc<InterferenceDetector>,
        run_log: Arc<RunLog>,
        retry: RetrySection,
    ) -> Self {
        Self {
            catalog,
            detector,
            run_log,
            retry,
        }
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub async fn run(
        &self,
        page: &mut dyn PortalPage,
        request: &StepRequest,
    ) -> EngineResult<StepOutcome> {
        let definition = self.catalog.lookup(&request.name)?;
        let locator = request
            .locator_override
            .as_ref()
            .unwrap_or(&definition.locator);
        let keys = request
            .keys_override
            .as_deref()
            .or(definition.default_keys.as_deref());
        let mut outcome = StepOutcome::default();

        if let Some(pause) = request.wait_before {
            tokio::time::sleep(pause).await;
        }
        if let Some(expected) = &request.expected_url {
            let current = page.current_url().await?;
            if !current.starts_with(expected.as_str()) {
                debug!(step = %request.name, expected, current, "forcing navigation");
                page.goto(expected).await?;
                outcome.reloads += 1;
            }
        }
        outcome.interferences_cleared += self.detector.sweep(page, &request.name).await?;

        let tiers: Vec<u64> = if request.unstable {
            vec![self.retry.unstable_tier_seconds]
        } else {
            self.retry.tiers_seconds.clone()
        };
        let total = tiers.len().max(1);

        for (attempt, tier) in tiers.iter().copied().enumerate() {
            outcome.attempts = attempt + 1;
            let timeout = Duration::from_secs(tier);
            match self.attempt(page, definition.action, locator, keys, timeout).await {
                Ok(()) => {
                    debug!(step = %request.name, attempt = outcome.attempts, "step completed");
                    return Ok(outcome);
                }
                Err(EngineError::Timeout(detail)) => {
                    warn!(
                        step = %request.name,
                        attempt = outcome.attempts,
                        tier,
                        detail,
                        "step attempt timed out"
                    );
                    self.run_log.record(
                        RunEventKind::StepRetry,
                        None,
                        None,
                        Some(&request.name),
                        format!("attempt {} of {total} timed out after {tier}s", outcome.attempts),
                    )?;
                    if outcome.attempts < total {
                        // The reload itself can provoke interference (a
                        // dropped session redirect, a fresh-load popup),
                        // so the sweep runs after it, not before.
                        page.reload().await?;
                        outcome.reloads += 1;
                        tokio::time::sleep(Duration::from_secs(self.retry.reload_wait_seconds))
                            .await;
                        outcome.interferences_cleared +=
                            self.detector.sweep(page, &request.name).await?;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        self.run_log.record(
            RunEventKind::StepFailure,
            None,
            None,
            Some(&request.name),
            format!("all {total} attempts exhausted"),
        )?;
        if request.required {
            // A dead session must not linger; the operator restarts from
            // the checkpoint.
            page.close().await?;
        }
        Err(EngineError::StepFailed {
            step: request.name.clone(),
            attempts: total,
            fatal: request.required,
        })
    }

    async fn attempt(
        &self,
        page: &mut dyn PortalPage,
        action: ActionKind,
        locator: &Locator,
        keys: Option<&str>,
        timeout: Duration,
    ) -> EngineResult<()> {
        match action {
            ActionKind::Click => page.click(locator, timeout).await,
            ActionKind::Type => {
                let keys = keys.ok_or_else(|| {
                    EngineError::Configuration(format!("type step without keys: {locator}"))
                })?;
                page.type_keys(locator, keys, timeout).await
            }
        }
    }
}
