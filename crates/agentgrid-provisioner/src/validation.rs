//! Bot-token validation against the Telegram Bot API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Identity of the bot a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    /// The dependency answered and refused the token. Not retryable.
    #[error("bot token rejected: {0}")]
    Rejected(String),

    /// The dependency could not give an answer.
    #[error("token validation unavailable: {0}")]
    Unavailable(String),
}

impl ValidationFailure {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ValidationFailure::Unavailable(_))
    }
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<BotInfo, ValidationFailure>;
}

#[derive(Debug, Deserialize)]
struct GetMeResponse {
    ok: bool,
    #[serde(default)]
    result: Option<BotInfo>,
    #[serde(default)]
    description: Option<String>,
}

/// Calls `GET <api_base>/bot<token>/getMe`.
#[derive(Debug, Clone)]
pub struct TelegramValidator {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramValidator {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, ValidationFailure> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ValidationFailure::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenValidator for TelegramValidator {
    async fn validate(&self, token: &str) -> Result<BotInfo, ValidationFailure> {
        if token.trim().is_empty() {
            return Err(ValidationFailure::Rejected("empty token".into()));
        }

        let url = format!("{}/bot{}/getMe", self.api_base, token);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            // The URL carries the token; never echo it back.
            .map_err(|e| ValidationFailure::Unavailable(e.without_url().to_string()))?;

        let status = resp.status();
        debug!(%status, "telegram getMe answered");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ValidationFailure::Unavailable(format!(
                "telegram returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ValidationFailure::Rejected(format!(
                "telegram returned {status}"
            )));
        }

        let body: GetMeResponse = resp
            .json()
            .await
            .map_err(|e| ValidationFailure::Unavailable(e.without_url().to_string()))?;
        if !body.ok {
            return Err(ValidationFailure::Rejected(
                body.description.unwrap_or_else(|| "invalid bot token".into()),
            ));
        }
        match body.result {
            Some(info) if info.is_bot => Ok(info),
            Some(_) => Err(ValidationFailure::Rejected(
                "token does not belong to a bot".into(),
            )),
            None => Err(ValidationFailure::Unavailable(
                "telegram response missing result".into(),
            )),
        }
    }
}
