//! Award API client.
//!
//! Assigns the welcome sticker through the service's own HTTP API, so the
//! duplicate check and the `StickerAssignedToUser` publish happen in one place.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{telemetry, Headers};
use crate::config::AwardsConfig;
use crate::handlers::{AssignError, WelcomeStickerAssigner};

/// Assignment collection, relative to the award API base URL.
pub const ASSIGNMENTS_PATH: &str = "/api/awards/v1/assignments";

/// Backoff for transient award API failures.
///
/// - Min delay: 100ms
/// - Max delay: 2s
/// - Max attempts: 3
/// - Jitter enabled
pub fn assignment_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssignStickerRequest<'a> {
    sticker_id: &'a str,
    reason: &'a str,
}

pub struct HttpWelcomeStickerAssigner {
    http: reqwest::Client,
    config: AwardsConfig,
    backoff: ExponentialBuilder,
}

impl HttpWelcomeStickerAssigner {
    pub fn new(config: AwardsConfig) -> Result<Self, AssignError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            config,
            backoff: assignment_backoff(),
        })
    }

    /// Replace the retry policy.
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn assignment_url(&self, account_id: &str) -> String {
        format!(
            "{}{}/{}",
            self.config.base_url.trim_end_matches('/'),
            ASSIGNMENTS_PATH,
            account_id
        )
    }

    async fn post_assignment(&self, url: &str) -> Result<(), AssignError> {
        let mut request = self.http.post(url).json(&AssignStickerRequest {
            sticker_id: &self.config.welcome_sticker_id,
            reason: &self.config.welcome_reason,
        });

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let mut trace_headers = Headers::new();
        telemetry::inject_context(&mut trace_headers);
        for (key, value) in &trace_headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Welcome sticker assigned");
            return Ok(());
        }
        if status == StatusCode::CONFLICT {
            info!(url = %url, "User already has the welcome sticker");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(AssignError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Transport failures, throttling and server errors are worth another attempt.
pub(crate) fn is_retryable(err: &AssignError) -> bool {
    match err {
        AssignError::Transport(_) => true,
        AssignError::Rejected { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        AssignError::Other(_) => false,
    }
}

#[async_trait]
impl WelcomeStickerAssigner for HttpWelcomeStickerAssigner {
    async fn assign_welcome_sticker(&self, account_id: &str) -> Result<(), AssignError> {
        if account_id.is_empty() {
            return Err(AssignError::Other("account ID is required".to_string()));
        }
        let url = self.assignment_url(account_id);

        (|| async { self.post_assignment(&url).await })
            .retry(self.backoff)
            .when(is_retryable)
            .notify(|err: &AssignError, dur: Duration| {
                warn!(account_id = %account_id, error = %err, delay = ?dur, "Award API call failed, retrying");
            })
            .await
    }
}
