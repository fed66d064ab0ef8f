use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::engine::catalog::Locator;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HarvestConfig {
    pub portal: PortalSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub retry: RetrySection,
    pub markers: MarkerSection,
    pub exports: ExportSection,
    pub two_factor: TwoFactorSection,
    pub signal: SignalSection,
    pub observability: ObservabilitySection,
    pub chromium: ChromiumSection,
}

impl HarvestConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSection {
    pub login_url: String,
    pub home_url: String,
    pub list_view_url: String,
    /// Templates with an `{id}` placeholder.
    pub detail_summary_url: String,
    pub detail_history_url: String,
    pub queues: Vec<String>,
    pub username_env: String,
    pub password_env: String,
}

impl PortalSection {
    pub fn detail_summary_url(&self, id: &str) -> String {
        self.detail_summary_url.replace("{id}", id)
    }

    pub fn detail_history_url(&self, id: &str) -> String {
        self.detail_history_url.replace("{id}", id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub staging_dir: String,
    pub data_dir: String,
    pub image_dir: String,
    pub checkpoint_dir: String,
    pub inbox_dir: String,
    pub outbox_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub result_hard_ceiling: u32,
    pub result_soft_ceiling: u32,
    pub count_poll_seconds: u64,
    pub count_poll_interval_seconds: u64,
    pub baseline_export_timeout_seconds: u64,
    pub detail_export_timeout_seconds: u64,
    pub download_poll_interval_seconds: u64,
    pub target_attempts: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub tiers_seconds: Vec<u64>,
    pub unstable_tier_seconds: u64,
    pub settle_seconds: u64,
    pub reload_wait_seconds: u64,
    pub element_poll_ms: u64,
}

/// Page-state probes that are not catalog steps: the two-factor prompt,
/// dialog buttons, the result-count indicator and the no-data banner.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkerSection {
    pub code_field: Locator,
    pub result_count: Locator,
    pub no_data: Locator,
    pub tos_dialog: Locator,
    pub guide_dialog: Locator,
    pub promo_dialog: Locator,
    pub activity_dialog: Locator,
    pub image_thumbnail: Locator,
    pub image_download: Locator,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportSection {
    /// File names the portal writes into the staging directory.
    pub baseline_filename: String,
    pub detail_filename: String,
    /// Blank columns appended to the baseline export for the cleaning
    /// pipeline to fill.
    pub augment_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwoFactorSection {
    pub enabled: bool,
    pub token_url: String,
    pub messages_url: String,
    pub account_id_env: String,
    pub client_id_env: String,
    pub client_secret_env: String,
    pub initial_wait_seconds: u64,
    pub poll_attempts: usize,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalSection {
    pub poll_interval_seconds: u64,
    pub ceiling_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub run_log: String,
    pub events_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub window_size: [u32; 2],
    pub tab_timeout_seconds: Option<u64>,
}

/// Portal credentials are never stored in the config file; the config
/// names the environment variables that carry them.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env(portal: &PortalSection) -> Result<Self> {
        let username = std::env::var(&portal.username_env)
            .map_err(|_| ConfigError::MissingEnv(portal.username_env.clone()))?;
        let password = std::env::var(&portal.password_env)
            .map_err(|_| ConfigError::MissingEnv(portal.password_env.clone()))?;
        Ok(Self { username, password })
    }
}

pub fn load_harvest_config<P: AsRef<Path>>(path: P) -> Result<HarvestConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
