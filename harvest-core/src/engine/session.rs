use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{error, info, warn};

use crate::config::{Credentials, HarvestConfig};

use super::artifacts::ArtifactStore;
use super::catalog::{step_names, Locator, LocatorStrategy, StepCatalog};
use super::checkpoint::{CheckpointStore, QueueStatus, Target};
use super::error::{EngineError, EngineResult};
use super::executor::{StepExecutor, StepRequest};
use super::interference::InterferenceDetector;
use super::metrics::SessionMetrics;
use super::page::{PortalPage, PortalSessionFactory};
use super::runlog::{RunEventKind, RunLog};
use super::signal::{await_operator_cue, OperatorChannel, OperatorCue};
use super::twofactor::{wait_for_code, CodeProvider};

/// Top-level state machine: login, queue selection, per-target extraction,
/// checkpointing, queue advancement. Exactly one browser session at a
/// time; every wait in here is a bounded poll.
pub struct SessionController {
    config: Arc<HarvestConfig>,
    executor: StepExecutor,
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
    run_log: Arc<RunLog>,
    code_provider: Option<Arc<dyn CodeProvider>>,
    credentials: Credentials,
    count_pattern: Regex,
    metrics: SessionMetrics,
}

impl SessionController {
    pub fn new(
        config: Arc<HarvestConfig>,
        catalog: Arc<StepCatalog>,
        credentials: Credentials,
        code_provider: Option<Arc<dyn CodeProvider>>,
        run_log: Arc<RunLog>,
    ) -> EngineResult<Self> {
        let detector = Arc::new(InterferenceDetector::new(
            &config,
            &catalog,
            credentials.clone(),
            code_provider.clone(),
            run_log.clone(),
        )?);
        let executor = StepExecutor::new(
            catalog,
            detector,
            run_log.clone(),
            config.retry.clone(),
        );
        let checkpoints = CheckpointStore::new(config.resolve_path(&config.paths.checkpoint_dir));
        let artifacts = ArtifactStore::new(
            config.resolve_path(&config.paths.staging_dir),
            config.resolve_path(&config.paths.data_dir),
            config.resolve_path(&config.paths.image_dir),
            Duration::from_secs(config.limits.download_poll_interval_seconds.max(1)),
        );
        let count_pattern =
            Regex::new(r"\d[\d,]*").map_err(|err| EngineError::Unexpected(err.to_string()))?;
        Ok(Self {
            config,
            executor,
            checkpoints,
            artifacts,
            run_log,
            code_provider,
            credentials,
            count_pattern,
            metrics: SessionMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// One full pass over every pending queue. The page is closed before
    /// returning on the success path; on a fatal step failure the
    /// executor has already torn it down.
    pub async fn run(&mut self, factory: &dyn PortalSessionFactory) -> EngineResult<SessionMetrics> {
        self.checkpoints.initialize(&self.config.portal.queues)?;
        let mut page = factory.create().await?;
        let outcome = self.drive(page.as_mut()).await;
        match outcome {
            Ok(()) => {
                page.close().await?;
                self.run_log
                    .record(RunEventKind::Session, None, None, None, "run complete")?;
                Ok(self.metrics.clone())
            }
            Err(err) => {
                // A fatal required step already tore the browser down;
                // every other failure closes it here.
                if !matches!(err, EngineError::StepFailed { fatal: true, .. }) {
                    page.close().await?;
                }
                self.run_log.record(
                    RunEventKind::Session,
                    None,
                    None,
                    None,
                    format!("run failed: {err}"),
                )?;
                Err(err)
            }
        }
    }

    /// Runs sessions until completion or an operator cancel. Each fatal
    /// abort notifies the operator and blocks on the signal channel; a
    /// resume cue starts a fresh session that rehydrates from the
    /// checkpoints.
    pub async fn run_with_recovery(
        &mut self,
        factory: &dyn PortalSessionFactory,
        channel: &dyn OperatorChannel,
    ) -> EngineResult<SessionMetrics> {
        loop {
            match self.run(factory).await {
                Ok(metrics) => return Ok(metrics),
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "session aborted, awaiting operator");
                    channel
                        .notify(
                            "extraction session aborted",
                            &format!("{err}. Reply 'start' to resume or 'cancel' to stop."),
                        )
                        .await?;
                    self.run_log.record(
                        RunEventKind::Notification,
                        None,
                        None,
                        None,
                        format!("operator notified after abort: {err}"),
                    )?;
                    match await_operator_cue(channel, &self.config.signal).await? {
                        OperatorCue::Resume => {
                            self.run_log.record(
                                RunEventKind::OperatorCue,
                                None,
                                None,
                                None,
                                "resume",
                            )?;
                            continue;
                        }
                        OperatorCue::Cancel => {
                            self.run_log.record(
                                RunEventKind::OperatorCue,
                                None,
                                None,
                                None,
                                "cancel",
                            )?;
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn drive(&mut self, page: &mut dyn PortalPage) -> EngineResult<()> {
        self.login(page).await?;
        let progress = self.checkpoints.load_progress()?;
        // Queue order comes from the config and never changes on resume.
        for queue in self.config.portal.queues.clone() {
            match progress.get(&queue) {
                Some(QueueStatus::Done) => {
                    info!(queue, "queue already done, skipping");
                }
                Some(QueueStatus::Oversized) => {
                    warn!(queue, "queue flagged oversized, skipping until split");
                }
                _ => self.process_queue(page, &queue).await?,
            }
        }
        Ok(())
    }

    async fn login(&mut self, page: &mut dyn PortalPage) -> EngineResult<()> {
        info!("logging in");
        page.goto(&self.config.portal.login_url).await?;
        let username = self.credentials.username.clone();
        let password = self.credentials.password.clone();
        self.step(
            page,
            StepRequest::new(step_names::FILL_USERNAME)
                .required()
                .with_keys(username),
        )
        .await?;
        self.step(
            page,
            StepRequest::new(step_names::FILL_PASSWORD)
                .required()
                .with_keys(password),
        )
        .await?;
        self.step(
            page,
            StepRequest::new(step_names::SUBMIT_LOGIN)
                .required()
                .pause_secs(1),
        )
        .await?;

        if self.config.two_factor.enabled {
            self.complete_two_factor(page).await?;
        }
        Ok(())
    }

    async fn complete_two_factor(&mut self, page: &mut dyn PortalPage) -> EngineResult<()> {
        // A remembered device goes straight through; the challenge only
        // matters when the prompt actually appears.
        if !page.exists(&self.config.markers.code_field).await? {
            info!("no two-factor challenge presented");
            return Ok(());
        }
        let Some(provider) = self.code_provider.clone() else {
            return Err(EngineError::Configuration(
                "two-factor enabled but no code provider wired".to_string(),
            ));
        };
        let section = &self.config.two_factor;
        tokio::time::sleep(Duration::from_secs(section.initial_wait_seconds)).await;
        let code = wait_for_code(
            provider.as_ref(),
            section.poll_attempts,
            Duration::from_secs(section.poll_interval_seconds),
        )
        .await?;
        match code {
            Some(code) => {
                self.step(
                    page,
                    StepRequest::new(step_names::FILL_CODE)
                        .required()
                        .unstable()
                        .with_keys(code),
                )
                .await?;
                self.step(
                    page,
                    StepRequest::new(step_names::SUBMIT_CODE).required().unstable(),
                )
                .await?;
            }
            None => {
                // Proceed anyway; the next required step will fail and
                // surface through the normal failure path.
                warn!("no verification code arrived before the ceiling");
                self.run_log.record(
                    RunEventKind::Notification,
                    None,
                    None,
                    None,
                    "two-factor code never arrived",
                )?;
            }
        }
        Ok(())
    }

    async fn process_queue(&mut self, page: &mut dyn PortalPage, queue: &str) -> EngineResult<()> {
        let existing = self.checkpoints.load_queue(queue)?;
        let mut targets = if existing.is_empty() {
            match self.select_queue(page, queue).await? {
                Some(targets) => targets,
                // Oversized: the operator has to split the queue first.
                None => return Ok(()),
            }
        } else {
            info!(
                queue,
                completed = existing.iter().filter(|t| t.completed).count(),
                total = existing.len(),
                "resuming queue from checkpoint"
            );
            existing
        };

        for index in 0..targets.len() {
            if targets[index].completed {
                self.metrics.record_target_skipped();
                continue;
            }
            let target = targets[index].clone();
            match self.extract_target(page, queue, &target).await {
                Ok(()) => {
                    targets[index].completed = true;
                    self.metrics.record_target_completed();
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(queue, target = %target.id, error = %err, "target left incomplete");
                    self.run_log.record(
                        RunEventKind::TargetError,
                        Some(queue),
                        Some(&target.id),
                        None,
                        err.to_string(),
                    )?;
                    self.metrics.record_target_failed();
                }
            }
            // Completion lands on disk before we advance to the next
            // target; a crash here either finds the target checkpointed
            // or not attempted.
            self.checkpoints.write_queue(queue, &targets)?;
        }

        if targets.iter().all(|t| t.completed) {
            self.checkpoints.set_status(queue, QueueStatus::Done)?;
            info!(queue, "queue complete");
        } else {
            info!(queue, "queue left resumable with incomplete targets");
        }
        Ok(())
    }

    /// Navigates to the saved queue, verifies the result count against the
    /// ceilings and produces the baseline export. Returns `None` when the
    /// queue is oversized.
    async fn select_queue(
        &mut self,
        page: &mut dyn PortalPage,
        queue: &str,
    ) -> EngineResult<Option<Vec<Target>>> {
        info!(queue, "selecting queue");
        page.goto(&self.config.portal.home_url).await?;
        self.step(page, StepRequest::new(step_names::OPEN_SAVED_QUEUES).required())
            .await?;
        self.step(page, StepRequest::new(step_names::OPEN_ALL_QUEUES).required())
            .await?;
        self.step(
            page,
            StepRequest::new(step_names::SEARCH_QUEUE)
                .required()
                .with_keys(queue)
                .pause_secs(1),
        )
        .await?;
        // The catalog row holds a placeholder; the real link text is the
        // queue name itself.
        self.step(
            page,
            StepRequest::new(step_names::SELECT_QUEUE)
                .required()
                .unstable()
                .with_locator(Locator::new(LocatorStrategy::LinkText, queue))
                .pause_secs(2),
        )
        .await?;
        let list_view = self.config.portal.list_view_url.clone();
        self.step(
            page,
            StepRequest::new(step_names::SWITCH_LIST_VIEW)
                .required()
                .expect_url(list_view)
                .pause_secs(2),
        )
        .await?;

        let count = self.poll_result_count(page, queue).await?;
        let limits = &self.config.limits;
        if count > limits.result_hard_ceiling {
            warn!(queue, count, ceiling = limits.result_hard_ceiling, "queue oversized");
            self.checkpoints.set_status(queue, QueueStatus::Oversized)?;
            self.run_log.record(
                RunEventKind::QueueOversized,
                Some(queue),
                None,
                None,
                format!("{count} results exceed ceiling {}", limits.result_hard_ceiling),
            )?;
            return Ok(None);
        }
        if count > limits.result_soft_ceiling {
            warn!(queue, count, threshold = limits.result_soft_ceiling, "queue near ceiling");
            self.run_log.record(
                RunEventKind::Notification,
                Some(queue),
                None,
                None,
                format!("{count} results approach ceiling, consider splitting"),
            )?;
        }

        let baseline_name = format!("{queue}.csv");
        let baseline_path = self.artifacts.data_path(&baseline_name);
        if !baseline_path.exists() {
            self.export_baseline(page, queue, &baseline_name).await?;
        }
        let targets = self.checkpoints.populate_from_baseline(queue, &baseline_path)?;
        Ok(Some(targets))
    }

    async fn export_baseline(
        &mut self,
        page: &mut dyn PortalPage,
        queue: &str,
        baseline_name: &str,
    ) -> EngineResult<()> {
        info!(queue, "producing baseline export");
        self.step(
            page,
            StepRequest::new(step_names::OPEN_MORE_MENU).required().pause_secs(1),
        )
        .await?;
        self.step(
            page,
            StepRequest::new(step_names::CLICK_EXPORT).required().pause_secs(1),
        )
        .await?;
        self.step(
            page,
            StepRequest::new(step_names::OPEN_EXPORT_FORMATS).required().pause_secs(1),
        )
        .await?;
        self.step(
            page,
            StepRequest::new(step_names::SELECT_EXPORT_FORMAT).required().pause_secs(1),
        )
        .await?;
        self.step(
            page,
            StepRequest::new(step_names::START_EXPORT).required().pause_secs(1),
        )
        .await?;

        let staged = self
            .artifacts
            .wait_for(
                &self.config.exports.baseline_filename,
                Duration::from_secs(self.config.limits.baseline_export_timeout_seconds),
            )
            .await?;
        let baseline_path = self.artifacts.claim(&staged, baseline_name)?;
        self.metrics.record_artifact();
        self.checkpoints
            .augment_baseline(&baseline_path, &self.config.exports.augment_columns)?;
        Ok(())
    }

    async fn poll_result_count(
        &mut self,
        page: &mut dyn PortalPage,
        queue: &str,
    ) -> EngineResult<u32> {
        let limits = &self.config.limits;
        let ceiling = Duration::from_secs(limits.count_poll_seconds);
        let interval = Duration::from_secs(limits.count_poll_interval_seconds.max(1));
        let probe_timeout = interval.min(Duration::from_secs(5));
        let mut waited = Duration::ZERO;
        loop {
            if let Ok(text) = page.read_text(&self.config.markers.result_count, probe_timeout).await
            {
                if let Some(count) = self.parse_count(&text) {
                    info!(queue, count, "result count read");
                    return Ok(count);
                }
            }
            if waited >= ceiling {
                // Without a count we cannot enforce the ceilings, so the
                // session stops rather than exporting blind.
                return Err(EngineError::SessionAbort(format!(
                    "result count never appeared for queue {queue}"
                )));
            }
            page.reload().await?;
            self.metrics.record_reload();
            tokio::time::sleep(interval).await;
            waited += interval;
        }
    }

    fn parse_count(&self, text: &str) -> Option<u32> {
        // Indicators read like "1 - 25 of 342"; the last number is the
        // total.
        let raw = self.count_pattern.find_iter(text).last()?.as_str();
        raw.replace(',', "").parse().ok()
    }

    /// Resolves one target: optional image fetch, then detail-history
    /// export with a bounded number of whole-target attempts. `Ok` means
    /// the target is finished, including the explicit no-data case.
    async fn extract_target(
        &mut self,
        page: &mut dyn PortalPage,
        queue: &str,
        target: &Target,
    ) -> EngineResult<()> {
        info!(queue, target = %target.id, address = %target.address, "extracting target");
        if !self.artifacts.has_image(&target.id) {
            if let Err(err) = self.fetch_image(page, target).await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(target = %target.id, error = %err, "image fetch skipped");
            }
        }

        let attempts = self.config.limits.target_attempts.max(1);
        let detail_url = self.config.portal.detail_history_url(&target.id);
        for attempt in 1..=attempts {
            page.goto(&detail_url).await?;
            if page.exists(&self.config.markers.no_data).await? {
                info!(target = %target.id, "no data available, completing with empty payload");
                self.run_log.record(
                    RunEventKind::NoData,
                    Some(queue),
                    Some(&target.id),
                    None,
                    "no data available",
                )?;
                return Ok(());
            }

            self.step(page, StepRequest::new(step_names::OPEN_DATA_TAB).pause_secs(1))
                .await?;
            self.step(
                page,
                StepRequest::new(step_names::EXPORT_DETAIL_HISTORY).pause_secs(1),
            )
            .await?;

            let wait = self
                .artifacts
                .wait_for(
                    &self.config.exports.detail_filename,
                    Duration::from_secs(self.config.limits.detail_export_timeout_seconds),
                )
                .await;
            match wait {
                Ok(staged) => {
                    self.artifacts
                        .claim(&staged, &format!("{queue}/{}.csv", target.id))?;
                    self.metrics.record_artifact();
                    return Ok(());
                }
                Err(EngineError::Timeout(detail)) => {
                    warn!(target = %target.id, attempt, detail, "detail export timed out");
                    self.run_log.record(
                        RunEventKind::TargetError,
                        Some(queue),
                        Some(&target.id),
                        None,
                        format!("attempt {attempt} of {attempts}: export timed out"),
                    )?;
                }
                Err(other) => return Err(other),
            }
        }
        Err(EngineError::TargetExtraction {
            id: target.id.clone(),
            reason: format!("export did not materialize in {attempts} attempts"),
        })
    }

    /// Best-effort auxiliary artifact; a missing photo never fails the
    /// target.
    async fn fetch_image(&mut self, page: &mut dyn PortalPage, target: &Target) -> EngineResult<()> {
        self.artifacts.clear_staging_images()?;
        page.goto(&self.config.portal.detail_summary_url(&target.id))
            .await?;
        let markers = self.config.markers.clone();
        if !page.exists(&markers.image_thumbnail).await? {
            return Ok(());
        }
        let timeout = Duration::from_secs(self.config.retry.tiers_seconds.first().copied().unwrap_or(5));
        page.click(&markers.image_thumbnail, timeout).await?;
        page.click(&markers.image_download, timeout).await?;
        let staged = self
            .artifacts
            .wait_for_image(Duration::from_secs(
                self.config.limits.detail_export_timeout_seconds,
            ))
            .await?;
        self.artifacts.standardize_image(&staged, &target.id)?;
        self.metrics.record_image();
        Ok(())
    }

    async fn step(&mut self, page: &mut dyn PortalPage, request: StepRequest) -> EngineResult<()> {
        match self.executor.run(page, &request).await {
            Ok(outcome) => {
                self.metrics.record_step();
                self.metrics.interferences_cleared = self
                    .metrics
                    .interferences_cleared
                    .saturating_add(outcome.interferences_cleared as u64);
                self.metrics.reloads_forced =
                    self.metrics.reloads_forced.saturating_add(outcome.reloads as u64);
                Ok(())
            }
            Err(err) => {
                self.metrics.record_step_failure();
                Err(err)
            }
        }
    }
}
