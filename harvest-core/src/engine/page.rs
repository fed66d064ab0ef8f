use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::HarvestConfig;

use super::catalog::{ElementQuery, Locator};
use super::error::{EngineError, EngineResult};

/// The seam between the step engine and the real browser. Everything the
/// engine does to a page goes through this trait, so tests can script a
/// portal without Chromium.
#[async_trait(?Send)]
pub trait PortalPage {
    async fn current_url(&mut self) -> EngineResult<String>;
    async fn goto(&mut self, url: &str) -> EngineResult<()>;
    async fn back(&mut self) -> EngineResult<()>;
    async fn reload(&mut self) -> EngineResult<()>;
    async fn exists(&mut self, locator: &Locator) -> EngineResult<bool>;
    async fn click(&mut self, locator: &Locator, timeout: Duration) -> EngineResult<()>;
    async fn type_keys(
        &mut self,
        locator: &Locator,
        keys: &str,
        timeout: Duration,
    ) -> EngineResult<()>;
    async fn read_text(&mut self, locator: &Locator, timeout: Duration) -> EngineResult<String>;
    /// Tears down the whole browser session, not just the tab.
    async fn close(&mut self) -> EngineResult<()>;
}

#[async_trait(?Send)]
pub trait PortalSessionFactory {
    async fn create(&self) -> EngineResult<Box<dyn PortalPage>>;
}

/// Launches Chromium with the staging directory wired up as the download
/// sink, one instance per session.
#[derive(Debug, Clone)]
pub struct PortalLauncher {
    config: Arc<HarvestConfig>,
    staging_dir: PathBuf,
    headless_override: Option<bool>,
}

impl PortalLauncher {
    pub fn new(config: Arc<HarvestConfig>) -> Self {
        let staging_dir = config.resolve_path(&config.paths.staging_dir);
        Self {
            config,
            staging_dir,
            headless_override: None,
        }
    }

    pub fn with_headless(mut self, headless: Option<bool>) -> Self {
        self.headless_override = headless;
        self
    }

    pub async fn launch(&self) -> EngineResult<CdpPortal> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let chromium = &self.config.chromium;
        let headless = self.headless_override.unwrap_or(chromium.headless);
        let [width, height] = chromium.window_size;

        let mut builder = ChromiumConfig::builder().chrome_executable(&chromium.executable_path);
        if !headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = chromium.tab_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }
        builder = builder.args(vec![
            format!("--window-size={width},{height}"),
            "--disable-background-timer-throttling".to_string(),
            "--password-store=basic".to_string(),
        ]);
        let chromium_config = builder.build().map_err(EngineError::Configuration)?;

        info!(headless, width, height, "launching chromium instance");
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| EngineError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        let download_params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(self.staging_dir.display().to_string())
            .build()
            .map_err(EngineError::Configuration)?;
        page.execute(download_params).await?;

        Ok(CdpPortal {
            browser: Some(browser),
            handler_task: Some(handler_task),
            page,
            element_poll: Duration::from_millis(self.config.retry.element_poll_ms),
        })
    }
}

pub struct CdpPortal {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Page,
    element_poll: Duration,
}

impl CdpPortal {
    async fn query_exists(&self, query: &ElementQuery) -> EngineResult<bool> {
        match query {
            ElementQuery::Css(selector) => Ok(self.page.find_element(selector.clone()).await.is_ok()),
            ElementQuery::XPath(xpath) => {
                let script = format!(
                    "document.evaluate({xp}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue !== null",
                    xp = serde_json::to_string(xpath).unwrap_or_default()
                );
                let found: bool = self
                    .page
                    .evaluate(script)
                    .await?
                    .into_value()
                    .map_err(|err| EngineError::Unexpected(err.to_string()))?;
                Ok(found)
            }
        }
    }

    async fn attempt_click(&self, query: &ElementQuery) -> EngineResult<bool> {
        match query {
            ElementQuery::Css(selector) => match self.page.find_element(selector.clone()).await {
                Ok(element) => {
                    element.click().await?;
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            ElementQuery::XPath(xpath) => {
                let script = format!(
                    "(() => {{ const el = document.evaluate({xp}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue; if (!el) return false; el.click(); return true; }})()",
                    xp = serde_json::to_string(xpath).unwrap_or_default()
                );
                let clicked: bool = self
                    .page
                    .evaluate(script)
                    .await?
                    .into_value()
                    .map_err(|err| EngineError::Unexpected(err.to_string()))?;
                Ok(clicked)
            }
        }
    }

    async fn attempt_type(&self, query: &ElementQuery, keys: &str) -> EngineResult<bool> {
        match query {
            ElementQuery::Css(selector) => match self.page.find_element(selector.clone()).await {
                Ok(element) => {
                    element.focus().await?;
                    element.type_str(keys).await?;
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            ElementQuery::XPath(xpath) => {
                let script = format!(
                    "(() => {{ const el = document.evaluate({xp}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue; if (!el) return false; el.focus(); el.value = {keys}; el.dispatchEvent(new Event('input', {{ bubbles: true }})); el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
                    xp = serde_json::to_string(xpath).unwrap_or_default(),
                    keys = serde_json::to_string(keys).unwrap_or_default()
                );
                let typed: bool = self
                    .page
                    .evaluate(script)
                    .await?
                    .into_value()
                    .map_err(|err| EngineError::Unexpected(err.to_string()))?;
                Ok(typed)
            }
        }
    }

    async fn attempt_read(&self, query: &ElementQuery) -> EngineResult<Option<String>> {
        match query {
            ElementQuery::Css(selector) => match self.page.find_element(selector.clone()).await {
                Ok(element) => Ok(element.inner_text().await?),
                Err(_) => Ok(None),
            },
            ElementQuery::XPath(xpath) => {
                let script = format!(
                    "(() => {{ const el = document.evaluate({xp}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue; return el ? (el.innerText || el.textContent) : null; }})()",
                    xp = serde_json::to_string(xpath).unwrap_or_default()
                );
                let text: Option<String> = self
                    .page
                    .evaluate(script)
                    .await?
                    .into_value()
                    .map_err(|err| EngineError::Unexpected(err.to_string()))?;
                Ok(text)
            }
        }
    }
}

#[async_trait(?Send)]
impl PortalPage for CdpPortal {
    async fn current_url(&mut self) -> EngineResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn goto(&mut self, url: &str) -> EngineResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(EngineError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn back(&mut self) -> EngineResult<()> {
        self.page.evaluate("history.back()").await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn reload(&mut self) -> EngineResult<()> {
        self.page.reload().await?;
        Ok(())
    }

    async fn exists(&mut self, locator: &Locator) -> EngineResult<bool> {
        self.query_exists(&locator.to_query()).await
    }

    async fn click(&mut self, locator: &Locator, timeout: Duration) -> EngineResult<()> {
        let query = locator.to_query();
        let deadline = Instant::now() + timeout;
        loop {
            if self.attempt_click(&query).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!("element {locator}")));
            }
            sleep(self.element_poll).await;
        }
    }

    async fn type_keys(
        &mut self,
        locator: &Locator,
        keys: &str,
        timeout: Duration,
    ) -> EngineResult<()> {
        let query = locator.to_query();
        let deadline = Instant::now() + timeout;
        loop {
            if self.attempt_type(&query, keys).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!("element {locator}")));
            }
            sleep(self.element_poll).await;
        }
    }

    async fn read_text(&mut self, locator: &Locator, timeout: Duration) -> EngineResult<String> {
        let query = locator.to_query();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(text) = self.attempt_read(&query).await? {
                return Ok(text);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!("text of {locator}")));
            }
            sleep(self.element_poll).await;
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if let Some(mut browser) = self.browser.take() {
            info!("shutting down chromium instance");
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser gracefully");
            }
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for CdpPortal {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!("portal session dropped without explicit close");
        }
    }
}

pub struct CdpPortalFactory {
    launcher: PortalLauncher,
}

impl CdpPortalFactory {
    pub fn new(launcher: PortalLauncher) -> Self {
        Self { launcher }
    }
}

#[async_trait(?Send)]
impl PortalSessionFactory for CdpPortalFactory {
    async fn create(&self) -> EngineResult<Box<dyn PortalPage>> {
        let portal = self.launcher.launch().await?;
        Ok(Box::new(portal))
    }
}
