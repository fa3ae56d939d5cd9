//! Downstream processing service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::result::AppResult;

/// Downstream HTTP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Base URL of the processing service. Mandatory.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Hard timeout of a single forward request in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl DownstreamConfig {
    /// The configured base URL, or a configuration error when unset or
    /// not an absolute http(s) URL.
    pub fn require_base_url(&self) -> AppResult<&str> {
        let base_url = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                AppError::configuration(
                    "Downstream base URL is not set (AGENT_BASE_URL or downstream.base_url)",
                )
            })?;

        let parsed = Url::parse(base_url).map_err(|e| {
            AppError::configuration(format!("Downstream base URL '{base_url}' is invalid: {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::configuration(format!(
                "Downstream base URL '{base_url}' must use http or https"
            )));
        }

        Ok(base_url)
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    60_000
}
