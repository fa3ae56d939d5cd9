//! Queue broker connection configuration and target resolution.

use std::fmt;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, ErrorKind};
use crate::result::AppResult;

/// Port used when neither the URL nor the discrete fields carry one.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Hostname fragments of managed Redis providers that require TLS.
const MANAGED_TLS_HOST_FRAGMENTS: &[&str] = &["upstash", "rediscloud"];

/// Broker connection and tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker backend: `"redis"` or `"memory"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Full connection URL (`redis://` or `rediss://`). Highest priority.
    #[serde(default)]
    pub url: Option<String>,
    /// Discrete hostname, used when no URL is configured.
    #[serde(default)]
    pub host: Option<String>,
    /// Discrete port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Discrete username.
    #[serde(default)]
    pub username: Option<String>,
    /// Discrete password.
    #[serde(default)]
    pub password: Option<String>,
    /// Prefix of every queue key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// How long a fetched delivery stays locked to this worker.
    #[serde(default = "default_lock_duration")]
    pub lock_duration_ms: u64,
    /// Interval between stalled-delivery sweeps.
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_seconds: u64,
    /// Interval between connection health probes.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            host: None,
            port: None,
            username: None,
            password: None,
            key_prefix: default_key_prefix(),
            lock_duration_ms: default_lock_duration(),
            stalled_interval_seconds: default_stalled_interval(),
            health_check_interval_seconds: default_health_check_interval(),
        }
    }
}

/// Which configuration rule produced a [`ConnectionTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSource {
    /// A single connection URL.
    Url,
    /// Discrete host/port/username/password fields.
    Discrete,
    /// Nothing configured; local development default.
    LocalFallback,
}

impl fmt::Display for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => write!(f, "url"),
            Self::Discrete => write!(f, "discrete"),
            Self::LocalFallback => write!(f, "local-fallback"),
        }
    }
}

/// A fully resolved broker endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Hostname or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Username, percent-decoded.
    pub username: Option<String>,
    /// Password, percent-decoded.
    pub password: Option<String>,
    /// Whether the connection must negotiate TLS.
    pub tls: bool,
    /// The rule that produced this target.
    pub source: ConnectionSource,
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("tls", &self.tls)
            .field("source", &self.source)
            .finish()
    }
}

impl ConnectionTarget {
    /// Render the target as a connection URL, re-encoding credentials.
    pub fn to_url(&self) -> AppResult<String> {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}", self.host, self.port)).map_err(
            |e| AppError::with_source(ErrorKind::Configuration, "Invalid broker host", e),
        )?;

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|()| AppError::configuration("Broker URL cannot carry a username"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|()| AppError::configuration("Broker URL cannot carry a password"))?;
        }

        Ok(url.to_string())
    }
}

impl BrokerConfig {
    /// Resolve the broker endpoint: URL first, then discrete fields, then
    /// `localhost` with a warning.
    pub fn resolve(&self) -> AppResult<ConnectionTarget> {
        if let Some(raw) = non_empty(self.url.as_deref()) {
            return parse_connection_url(raw);
        }

        if let Some(host) = non_empty(self.host.as_deref()) {
            return Ok(ConnectionTarget {
                host: host.to_string(),
                port: self.port.unwrap_or(DEFAULT_REDIS_PORT),
                username: non_empty(self.username.as_deref()).map(str::to_string),
                password: non_empty(self.password.as_deref()).map(str::to_string),
                tls: is_managed_tls_host(host),
                source: ConnectionSource::Discrete,
            });
        }

        tracing::warn!(
            "No broker configuration found (REDIS_URL / REDIS_HOST), using localhost:{}",
            DEFAULT_REDIS_PORT
        );
        Ok(ConnectionTarget {
            host: "localhost".to_string(),
            port: DEFAULT_REDIS_PORT,
            username: None,
            password: None,
            tls: false,
            source: ConnectionSource::LocalFallback,
        })
    }
}

/// Parse a `redis://` / `rediss://` URL into a target.
fn parse_connection_url(raw: &str) -> AppResult<ConnectionTarget> {
    let cleaned = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    let url = Url::parse(cleaned).map_err(|e| {
        AppError::with_source(ErrorKind::Configuration, "Invalid broker URL", e)
    })?;

    let tls = match url.scheme() {
        "rediss" => true,
        "redis" => false,
        other => {
            return Err(AppError::configuration(format!(
                "Unsupported broker URL scheme '{other}'. Supported: redis, rediss"
            )));
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::configuration("Broker URL has no host"))?;

    Ok(ConnectionTarget {
        host: host.to_string(),
        port: url.port().unwrap_or(DEFAULT_REDIS_PORT),
        username: non_empty(Some(url.username())).map(decode_component),
        password: non_empty(url.password()).map(decode_component),
        tls,
        source: ConnectionSource::Url,
    })
}

fn decode_component(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn is_managed_tls_host(host: &str) -> bool {
    MANAGED_TLS_HOST_FRAGMENTS
        .iter()
        .any(|fragment| host.contains(fragment))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn default_provider() -> String {
    "redis".to_string()
}

fn default_key_prefix() -> String {
    "bull".to_string()
}

fn default_lock_duration() -> u64 {
    90_000
}

fn default_stalled_interval() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    5
}
