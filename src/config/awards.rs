//! Award API client configuration.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwardsConfig {
    /// Base URL of the award service HTTP API.
    pub base_url: String,
    pub welcome_sticker_id: String,
    pub welcome_reason: String,
    /// Bearer token for service-to-service calls.
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AwardsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            welcome_sticker_id: "sticker-001".to_string(),
            welcome_reason: "Welcome to Stickerlandia!".to_string(),
            auth_token: None,
            timeout_secs: 10,
        }
    }
}

impl AwardsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
