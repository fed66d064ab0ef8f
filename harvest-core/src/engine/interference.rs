use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Credentials, HarvestConfig, MarkerSection};

use super::catalog::{step_names, Locator, StepCatalog};
use super::error::EngineResult;
use super::page::PortalPage;
use super::runlog::{RunEventKind, RunLog};
use super::twofactor::{wait_for_code, CodeProvider};

/// One recovery the sweep performed, for the caller's telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interference {
    AuthRedirect,
    HomepageRedirect,
    TosDialog,
    GuideDialog,
    PromoDialog,
    ActivityDialog,
}

impl Interference {
    fn label(&self) -> &'static str {
        match self {
            Interference::AuthRedirect => "auth redirect",
            Interference::HomepageRedirect => "homepage redirect",
            Interference::TosDialog => "terms-of-service dialog",
            Interference::GuideDialog => "guide dialog",
            Interference::PromoDialog => "promo dialog",
            Interference::ActivityDialog => "activity dialog",
        }
    }
}

/// Scans for the known ways the portal derails a step and undoes each one
/// in a fixed order, most disruptive first. Recoveries are best effort: a
/// failed recovery is logged and the sweep moves on, leaving the retry
/// tiers of the step itself to deal with whatever remains.
pub struct InterferenceDetector {
    login_url: String,
    home_url: String,
    markers: MarkerSection,
    credentials: Credentials,
    username: Locator,
    password: Locator,
    submit: Locator,
    code_submit: Option<Locator>,
    code_provider: Option<Arc<dyn CodeProvider>>,
    code_initial_wait: Duration,
    code_poll_attempts: usize,
    code_poll_interval: Duration,
    element_timeout: Duration,
    settle: Duration,
    exempt: HashSet<&'static str>,
    homepage_exempt: HashSet<&'static str>,
    run_log: Arc<RunLog>,
}

impl InterferenceDetector {
    pub fn new(
        config: &HarvestConfig,
        catalog: &StepCatalog,
        credentials: Credentials,
        code_provider: Option<Arc<dyn CodeProvider>>,
        run_log: Arc<RunLog>,
    ) -> EngineResult<Self> {
        let username = catalog.lookup(step_names::FILL_USERNAME)?.locator.clone();
        let password = catalog.lookup(step_names::FILL_PASSWORD)?.locator.clone();
        let submit = catalog.lookup(step_names::SUBMIT_LOGIN)?.locator.clone();
        let code_submit = if code_provider.is_some() {
            Some(catalog.lookup(step_names::SUBMIT_CODE)?.locator.clone())
        } else {
            None
        };
        let element_timeout = Duration::from_secs(
            config.retry.tiers_seconds.first().copied().unwrap_or(5),
        );
        Ok(Self {
            login_url: config.portal.login_url.clone(),
            home_url: config.portal.home_url.trim_end_matches('/').to_string(),
            markers: config.markers.clone(),
            credentials,
            username,
            password,
            submit,
            code_submit,
            code_provider,
            code_initial_wait: Duration::from_secs(config.two_factor.initial_wait_seconds),
            code_poll_attempts: config.two_factor.poll_attempts,
            code_poll_interval: Duration::from_secs(config.two_factor.poll_interval_seconds),
            element_timeout,
            settle: Duration::from_secs(config.retry.settle_seconds),
            exempt: step_names::LOGIN_FLOW.into_iter().collect(),
            // Queue selection starts from the homepage on purpose; the
            // redirect rule must not undo it.
            homepage_exempt: [
                step_names::OPEN_SAVED_QUEUES,
                step_names::OPEN_ALL_QUEUES,
                step_names::SEARCH_QUEUE,
                step_names::SELECT_QUEUE,
                step_names::SWITCH_LIST_VIEW,
            ]
            .into_iter()
            .collect(),
            run_log,
        })
    }

    pub fn is_exempt(&self, step: &str) -> bool {
        self.exempt.contains(step)
    }

    /// Runs one full sweep around `step`. Returns the number of
    /// interferences cleared; zero means the page looked clean.
    pub async fn sweep(&self, page: &mut dyn PortalPage, step: &str) -> EngineResult<usize> {
        if self.is_exempt(step) {
            return Ok(0);
        }
        let mut cleared = 0;

        let url = page.current_url().await?;
        if url.starts_with(&self.login_url) {
            self.recover(page, step, Interference::AuthRedirect).await?;
            cleared += 1;
        } else if url.trim_end_matches('/') == self.home_url && !self.homepage_exempt.contains(step)
        {
            self.recover(page, step, Interference::HomepageRedirect)
                .await?;
            cleared += 1;
        }

        let dialogs = [
            (Interference::TosDialog, self.markers.tos_dialog.clone()),
            (Interference::GuideDialog, self.markers.guide_dialog.clone()),
            (Interference::PromoDialog, self.markers.promo_dialog.clone()),
            (
                Interference::ActivityDialog,
                self.markers.activity_dialog.clone(),
            ),
        ];
        for (kind, marker) in dialogs {
            if page.exists(&marker).await? {
                self.recover_dialog(page, step, kind, &marker).await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn recover(
        &self,
        page: &mut dyn PortalPage,
        step: &str,
        kind: Interference,
    ) -> EngineResult<()> {
        info!(step, interference = kind.label(), "clearing interference");
        let outcome = match kind {
            Interference::AuthRedirect => self.relogin(page).await,
            Interference::HomepageRedirect => page.back().await,
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            warn!(step, interference = kind.label(), error = %err, "recovery failed");
        }
        self.run_log
            .record(
                RunEventKind::Interference,
                None,
                None,
                Some(step),
                kind.label(),
            )?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn recover_dialog(
        &self,
        page: &mut dyn PortalPage,
        step: &str,
        kind: Interference,
        marker: &Locator,
    ) -> EngineResult<()> {
        info!(step, interference = kind.label(), "dismissing dialog");
        if let Err(err) = page.click(marker, self.element_timeout).await {
            warn!(step, interference = kind.label(), error = %err, "dismissal failed");
        }
        self.run_log
            .record(
                RunEventKind::Interference,
                None,
                None,
                Some(step),
                kind.label(),
            )?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// The portal dropped the session mid-run; sign back in on the page it
    /// redirected us to.
    async fn relogin(&self, page: &mut dyn PortalPage) -> EngineResult<()> {
        page.type_keys(&self.username, &self.credentials.username, self.element_timeout)
            .await?;
        page.type_keys(&self.password, &self.credentials.password, self.element_timeout)
            .await?;
        page.click(&self.submit, self.element_timeout).await?;

        if let (Some(provider), Some(code_submit)) = (&self.code_provider, &self.code_submit) {
            // Same as the login flow: only a visible prompt means a
            // challenge was issued.
            if !page.exists(&self.markers.code_field).await? {
                return Ok(());
            }
            tokio::time::sleep(self.code_initial_wait).await;
            let code = wait_for_code(
                provider.as_ref(),
                self.code_poll_attempts,
                self.code_poll_interval,
            )
            .await?;
            if let Some(code) = code {
                page.type_keys(&self.markers.code_field, &code, self.element_timeout)
                    .await?;
                page.click(code_submit, self.element_timeout).await?;
            } else {
                warn!("re-login proceeded without a verification code");
            }
        }
        Ok(())
    }
}
