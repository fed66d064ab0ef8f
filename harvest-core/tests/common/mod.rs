#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use harvest_core::config::{
    ChromiumSection, ExportSection, LimitsSection, MarkerSection, ObservabilitySection,
    PathsSection, PortalSection, RetrySection, SignalSection, TwoFactorSection,
};
use harvest_core::engine::{
    CodeProvider, EngineError, EngineResult, Locator, LocatorStrategy, PortalPage,
    PortalSessionFactory, RunLog, SessionController, StepCatalog,
};
use harvest_core::{Credentials, HarvestConfig};

pub const CATALOG: &str = "\
description,strategy,value,keys,action
fill username,id,username,,type
fill password,id,password,,type
click login button,id,login-submit,,click
fill two-factor code,id,code,,type
confirm two-factor code,id,code-submit,,click
open saved queue menu,id,saved-queues,,click
open full queue menu,id,all-queues,,click
search for queue,id,queue-search,,type
select queue,link_text,placeholder,,click
switch to list view,id,list-view,,click
open more menu,id,more-menu,,click
click export button,id,export-btn,,click
open export formats menu,id,export-formats,,click
select export format,id,format-csv,,click
start export,id,start-export,,click
open data tab,id,data-tab,,click
export detail history,id,export-history,,click
";

fn marker(value: &str) -> Locator {
    Locator::new(LocatorStrategy::Id, value)
}

pub fn test_config(root: &Path, queues: &[&str]) -> HarvestConfig {
    HarvestConfig {
        portal: PortalSection {
            login_url: "https://portal.test/login".to_string(),
            home_url: "https://portal.test/home".to_string(),
            list_view_url: "https://portal.test/search/list".to_string(),
            detail_summary_url: "https://portal.test/detail/{id}/summary".to_string(),
            detail_history_url: "https://portal.test/detail/{id}/history".to_string(),
            queues: queues.iter().map(|q| q.to_string()).collect(),
            username_env: "HARVEST_TEST_USER".to_string(),
            password_env: "HARVEST_TEST_PASSWORD".to_string(),
        },
        paths: PathsSection {
            base_dir: root.display().to_string(),
            staging_dir: "staging".to_string(),
            data_dir: "data".to_string(),
            image_dir: "images".to_string(),
            checkpoint_dir: "checkpoints".to_string(),
            inbox_dir: "signal/inbox".to_string(),
            outbox_dir: "signal/outbox".to_string(),
        },
        limits: LimitsSection {
            result_hard_ceiling: 499,
            result_soft_ceiling: 450,
            count_poll_seconds: 10,
            count_poll_interval_seconds: 1,
            baseline_export_timeout_seconds: 5,
            detail_export_timeout_seconds: 3,
            download_poll_interval_seconds: 1,
            target_attempts: 2,
        },
        retry: RetrySection {
            tiers_seconds: vec![5, 10, 15],
            unstable_tier_seconds: 10,
            settle_seconds: 1,
            reload_wait_seconds: 1,
            element_poll_ms: 100,
        },
        markers: MarkerSection {
            code_field: marker("code"),
            result_count: marker("result-count"),
            no_data: marker("no-data"),
            tos_dialog: marker("tos-dialog"),
            guide_dialog: marker("guide-dialog"),
            promo_dialog: marker("promo-dialog"),
            activity_dialog: marker("activity-dialog"),
            image_thumbnail: marker("image-thumb"),
            image_download: marker("image-dl"),
        },
        exports: ExportSection {
            baseline_filename: "SearchExport.csv".to_string(),
            detail_filename: "HistoryExport.csv".to_string(),
            augment_columns: vec!["Property Class".to_string(), "Rent".to_string()],
        },
        two_factor: TwoFactorSection {
            enabled: false,
            token_url: "https://sms.test/oauth/token".to_string(),
            messages_url: "https://sms.test/v2/sms_histories".to_string(),
            account_id_env: "HARVEST_TEST_SMS_ACCOUNT".to_string(),
            client_id_env: "HARVEST_TEST_SMS_ID".to_string(),
            client_secret_env: "HARVEST_TEST_SMS_SECRET".to_string(),
            initial_wait_seconds: 1,
            poll_attempts: 2,
            poll_interval_seconds: 1,
        },
        signal: SignalSection {
            poll_interval_seconds: 1,
            ceiling_seconds: 5,
        },
        observability: ObservabilitySection {
            run_log: "logs/run.jsonl".to_string(),
            events_db: "logs/events.sqlite".to_string(),
        },
        chromium: ChromiumSection {
            executable_path: "/usr/bin/chromium".to_string(),
            headless: true,
            sandbox: false,
            window_size: [1920, 1080],
            tab_timeout_seconds: None,
        },
    }
}

/// Provider that always answers the same thing, for login-flow tests.
pub struct FixedCodeProvider {
    pub code: Option<String>,
}

#[async_trait]
impl CodeProvider for FixedCodeProvider {
    async fn fetch_code(&self) -> EngineResult<Option<String>> {
        Ok(self.code.clone())
    }
}

pub fn build_controller(config: Arc<HarvestConfig>) -> (SessionController, Arc<RunLog>) {
    build_controller_with_provider(config, None)
}

pub fn build_controller_with_provider(
    config: Arc<HarvestConfig>,
    code_provider: Option<Arc<dyn CodeProvider>>,
) -> (SessionController, Arc<RunLog>) {
    let catalog = Arc::new(StepCatalog::from_csv(CATALOG).expect("catalog fixture"));
    let run_log = Arc::new(
        RunLog::new(
            config.resolve_path(&config.observability.run_log),
            config.resolve_path(&config.observability.events_db),
        )
        .expect("run log"),
    );
    let credentials = Credentials {
        username: "agent".to_string(),
        password: "hunter2".to_string(),
    };
    let controller = SessionController::new(
        config.clone(),
        catalog,
        credentials,
        code_provider,
        run_log.clone(),
    )
    .expect("controller");
    (controller, run_log)
}

pub fn build_executor_parts(
    root: &Path,
) -> (
    Arc<StepCatalog>,
    Arc<harvest_core::engine::InterferenceDetector>,
    Arc<RunLog>,
    HarvestConfig,
) {
    let config = test_config(root, &["Q"]);
    let catalog = Arc::new(StepCatalog::from_csv(CATALOG).expect("catalog fixture"));
    let run_log = Arc::new(
        RunLog::new(root.join("logs/run.jsonl"), root.join("logs/events.sqlite"))
            .expect("run log"),
    );
    let credentials = Credentials {
        username: "agent".to_string(),
        password: "hunter2".to_string(),
    };
    let detector = Arc::new(
        harvest_core::engine::InterferenceDetector::new(
            &config,
            &catalog,
            credentials,
            None,
            run_log.clone(),
        )
        .expect("detector"),
    );
    (catalog, detector, run_log, config)
}

/// Scripted stand-in for a browser page. Element locators are matched by
/// their locator value; clicks can dismiss markers and drop files into
/// the staging directory the way a real download would.
pub struct FakePortal {
    url: String,
    history: Vec<String>,
    pub log: Rc<RefCell<Vec<String>>>,
    pub closes: Rc<RefCell<usize>>,
    pub present: Rc<RefCell<HashSet<String>>>,
    fail_values: HashSet<String>,
    fail_times: HashMap<String, usize>,
    present_when: Vec<(String, String)>,
    appear_on_reload: Vec<String>,
    count_text: Option<String>,
    downloads: HashMap<String, (PathBuf, Vec<u8>)>,
}

impl FakePortal {
    pub fn new(start_url: &str) -> Self {
        Self {
            url: start_url.to_string(),
            history: Vec::new(),
            log: Rc::new(RefCell::new(Vec::new())),
            closes: Rc::new(RefCell::new(0)),
            present: Rc::new(RefCell::new(HashSet::new())),
            fail_values: HashSet::new(),
            fail_times: HashMap::new(),
            present_when: Vec::new(),
            appear_on_reload: Vec::new(),
            count_text: None,
            downloads: HashMap::new(),
        }
    }

    /// Element that never materializes; clicks and typing time out.
    pub fn with_failing(mut self, value: &str) -> Self {
        self.fail_values.insert(value.to_string());
        self
    }

    /// Element that times out for the first `times` interactions and
    /// behaves normally afterwards.
    pub fn with_failing_times(mut self, value: &str, times: usize) -> Self {
        self.fail_times.insert(value.to_string(), times);
        self
    }

    /// Marker that materializes on every page reload, like a fresh-load
    /// popup.
    pub fn with_dialog_on_reload(mut self, value: &str) -> Self {
        self.appear_on_reload.push(value.to_string());
        self
    }

    /// Marker present until something clicks it away.
    pub fn with_dialog(self, value: &str) -> Self {
        self.present.borrow_mut().insert(value.to_string());
        self
    }

    /// Marker present only while the URL contains `url_part`.
    pub fn with_marker_when(mut self, url_part: &str, value: &str) -> Self {
        self.present_when
            .push((url_part.to_string(), value.to_string()));
        self
    }

    pub fn with_count_text(mut self, text: &str) -> Self {
        self.count_text = Some(text.to_string());
        self
    }

    /// Clicking `value` writes `bytes` to `path`, like a finished
    /// browser download.
    pub fn with_download(mut self, value: &str, path: PathBuf, bytes: Vec<u8>) -> Self {
        self.downloads.insert(value.to_string(), (path, bytes));
        self
    }

    pub fn handles(&self) -> (Rc<RefCell<Vec<String>>>, Rc<RefCell<usize>>) {
        (self.log.clone(), self.closes.clone())
    }

    fn note(&self, entry: String) {
        self.log.borrow_mut().push(entry);
    }
}

#[async_trait(?Send)]
impl PortalPage for FakePortal {
    async fn current_url(&mut self) -> EngineResult<String> {
        Ok(self.url.clone())
    }

    async fn goto(&mut self, url: &str) -> EngineResult<()> {
        self.history.push(self.url.clone());
        self.url = url.to_string();
        self.note(format!("goto:{url}"));
        Ok(())
    }

    async fn back(&mut self) -> EngineResult<()> {
        if let Some(previous) = self.history.pop() {
            self.url = previous;
        }
        self.note("back".to_string());
        Ok(())
    }

    async fn reload(&mut self) -> EngineResult<()> {
        self.note("reload".to_string());
        for value in &self.appear_on_reload {
            self.present.borrow_mut().insert(value.clone());
        }
        Ok(())
    }

    async fn exists(&mut self, locator: &Locator) -> EngineResult<bool> {
        let value = locator.value.as_str();
        if self.present.borrow().contains(value) {
            return Ok(true);
        }
        Ok(self
            .present_when
            .iter()
            .any(|(part, marker)| marker == value && self.url.contains(part)))
    }

    async fn click(&mut self, locator: &Locator, _timeout: Duration) -> EngineResult<()> {
        let value = locator.value.clone();
        if self.fail_values.contains(&value) {
            return Err(EngineError::Timeout(format!("element {value}")));
        }
        if let Some(remaining) = self.fail_times.get_mut(&value) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Timeout(format!("element {value}")));
            }
        }
        self.note(format!("click:{value}"));
        self.present.borrow_mut().remove(&value);
        if let Some((path, bytes)) = self.downloads.get(&value) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    async fn type_keys(
        &mut self,
        locator: &Locator,
        keys: &str,
        _timeout: Duration,
    ) -> EngineResult<()> {
        let value = locator.value.clone();
        if self.fail_values.contains(&value) {
            return Err(EngineError::Timeout(format!("element {value}")));
        }
        if let Some(remaining) = self.fail_times.get_mut(&value) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Timeout(format!("element {value}")));
            }
        }
        self.note(format!("type:{value}:{keys}"));
        Ok(())
    }

    async fn read_text(&mut self, locator: &Locator, _timeout: Duration) -> EngineResult<String> {
        if locator.value == "result-count" {
            if let Some(text) = &self.count_text {
                return Ok(text.clone());
            }
        }
        Err(EngineError::Timeout(format!("text of {locator}")))
    }

    async fn close(&mut self) -> EngineResult<()> {
        *self.closes.borrow_mut() += 1;
        self.note("close".to_string());
        Ok(())
    }
}

pub struct FakeFactory {
    portals: RefCell<Vec<FakePortal>>,
}

impl FakeFactory {
    pub fn new(mut portals: Vec<FakePortal>) -> Self {
        portals.reverse();
        Self {
            portals: RefCell::new(portals),
        }
    }
}

#[async_trait(?Send)]
impl PortalSessionFactory for FakeFactory {
    async fn create(&self) -> EngineResult<Box<dyn PortalPage>> {
        self.portals
            .borrow_mut()
            .pop()
            .map(|portal| Box::new(portal) as Box<dyn PortalPage>)
            .ok_or_else(|| EngineError::Launch("no scripted portal left".to_string()))
    }
}
