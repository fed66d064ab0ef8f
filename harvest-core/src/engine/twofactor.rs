use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::TwoFactorSection;
use crate::error::ConfigError;

use super::error::{EngineError, EngineResult};

/// External source of the short-lived login code. `None` means the ceiling
/// passed without a code; the caller proceeds and lets the next step fail
/// as an ordinary step failure.
#[async_trait]
pub trait CodeProvider: Send + Sync {
    async fn fetch_code(&self) -> EngineResult<Option<String>>;
}

/// Polls the provider at a fixed interval up to `attempts` times.
pub async fn wait_for_code(
    provider: &dyn CodeProvider,
    attempts: usize,
    interval: Duration,
) -> EngineResult<Option<String>> {
    for attempt in 0..attempts.max(1) {
        match provider.fetch_code().await {
            Ok(Some(code)) => return Ok(Some(code)),
            Ok(None) => debug!(attempt, "no verification code yet"),
            Err(err) => warn!(attempt, error = %err, "code provider poll failed"),
        }
        if attempt + 1 < attempts {
            sleep(interval).await;
        }
    }
    Ok(None)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Fetches the latest message from an SMS relay behind an OAuth2
/// client-credentials flow and extracts the first digit run.
pub struct HttpSmsCodeProvider {
    http: reqwest::Client,
    token_url: String,
    messages_url: String,
    account_id: String,
    basic_credentials: String,
    code_pattern: Regex,
}

impl HttpSmsCodeProvider {
    pub fn from_config(section: &TwoFactorSection) -> EngineResult<Self> {
        let account_id = require_env(&section.account_id_env)?;
        let client_id = require_env(&section.client_id_env)?;
        let client_secret = require_env(&section.client_secret_env)?;
        let basic_credentials = BASE64.encode(format!("{client_id}:{client_secret}"));
        let code_pattern = Regex::new(r"\d{4,8}")
            .map_err(|err| EngineError::Unexpected(err.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            token_url: section.token_url.clone(),
            messages_url: section.messages_url.clone(),
            account_id,
            basic_credentials,
            code_pattern,
        })
    }

    async fn access_token(&self) -> EngineResult<String> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Authorization", format!("Basic {}", self.basic_credentials))
            .form(&[
                ("grant_type", "account_credentials"),
                ("account_id", self.account_id.as_str()),
            ])
            .send()
            .await
            .map_err(|err| EngineError::Signal(format!("token request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Signal(format!(
                "token request returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| EngineError::Signal(format!("token response malformed: {err}")))?;
        Ok(token.access_token)
    }

    fn extract_code(&self, body: &serde_json::Value) -> Option<String> {
        let message = body
            .get("sms_histories")
            .and_then(|histories| histories.as_array())
            .and_then(|histories| histories.last())
            .and_then(|last| last.get("message"))
            .and_then(|message| message.as_str())?;
        self.code_pattern
            .find(message)
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl CodeProvider for HttpSmsCodeProvider {
    async fn fetch_code(&self) -> EngineResult<Option<String>> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(&self.messages_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| EngineError::Signal(format!("message fetch failed: {err}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Signal(format!(
                "message fetch returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| EngineError::Signal(format!("message payload malformed: {err}")))?;
        Ok(self.extract_code(&body))
    }
}

fn require_env(name: &str) -> EngineResult<String> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()).into())
}
