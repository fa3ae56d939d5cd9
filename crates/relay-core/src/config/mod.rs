//! Application configuration schemas.
//!
//! The configuration is built once at startup from, in increasing
//! precedence: `config/default.toml`, `config/{env}.toml`, `RELAY__`
//! prefixed environment variables, and the plain variables of existing
//! deployments (`REDIS_URL`, `REDIS_HOST`, ..., `AGENT_BASE_URL`). It is then
//! validated and handed to constructors; nothing reads the environment
//! after that.

pub mod broker;
pub mod downstream;
pub mod logging;
pub mod retention;
pub mod worker;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use self::broker::{BrokerConfig, ConnectionSource, ConnectionTarget};
pub use self::downstream::DownstreamConfig;
pub use self::logging::LoggingConfig;
pub use self::retention::RetentionConfig;
pub use self::worker::WorkerConfig;

use crate::error::AppError;
use crate::result::AppResult;

/// Plain environment variables and the keys they override. Later entries
/// win when both are set.
const PLAIN_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("REDIS_URL", "broker.url"),
    ("REDIS_HOST", "broker.host"),
    ("REDIS_USERNAME", "broker.username"),
    ("REDIS_PASSWORD", "broker.password"),
    ("AGENT_PYTHON_URL", "downstream.base_url"),
    ("AGENT_BASE_URL", "downstream.base_url"),
];

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Queue broker connection settings.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Downstream processing service settings.
    #[serde(default)]
    pub downstream: DownstreamConfig,
    /// Job dispatcher settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Completed/failed retention bounds.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from files and the process environment.
    pub fn load(env: &str) -> AppResult<Self> {
        Self::load_from(env, std::env::vars().collect())
    }

    /// Load configuration from files and the given variables.
    pub fn load_from(env: &str, vars: HashMap<String, String>) -> AppResult<Self> {
        let prefixed: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(prefixed)),
            );

        for (var, key) in PLAIN_ENV_OVERRIDES {
            builder = builder.set_override_option(*key, plain_var(&vars, var))?;
        }

        if let Some(port) = plain_var(&vars, "REDIS_PORT") {
            let port: u16 = port.parse().map_err(|_| {
                AppError::configuration(format!("REDIS_PORT '{port}' is not a valid port"))
            })?;
            builder = builder.set_override("broker.port", i64::from(port))?;
        }

        let config = builder
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))
    }

    /// Check the settings that must hold before any broker connection is
    /// attempted.
    pub fn validate(&self) -> AppResult<()> {
        self.downstream.require_base_url()?;

        if self.worker.concurrency == 0 {
            return Err(AppError::configuration(
                "worker.concurrency must be at least 1",
            ));
        }
        if self.worker.queue.trim().is_empty() {
            return Err(AppError::configuration("worker.queue must not be empty"));
        }

        Ok(())
    }
}

fn plain_var(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_any_source() {
        let config = AppConfig::load_from("test", HashMap::new()).unwrap();
        assert_eq!(config.worker.queue, "process-inbound-message");
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.downstream.timeout_ms, 60_000);
        assert_eq!(config.retention.completed_count, 100);
        assert_eq!(config.retention.completed_age_seconds, 86_400);
        assert_eq!(config.retention.failed_count, 1000);
        assert_eq!(config.broker.provider, "redis");
        assert!(config.broker.url.is_none());
    }

    #[test]
    fn test_missing_downstream_url_fails_validation() {
        let config = AppConfig::load_from("test", HashMap::new()).unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn test_plain_variables_are_applied() {
        let config = AppConfig::load_from(
            "test",
            vars(&[
                ("REDIS_HOST", "redis-12345.rediscloud.com"),
                ("REDIS_PORT", "12345"),
                ("REDIS_PASSWORD", "pw"),
                ("AGENT_BASE_URL", "http://agent:8000"),
            ]),
        )
        .unwrap();
        assert_eq!(config.broker.host.as_deref(), Some("redis-12345.rediscloud.com"));
        assert_eq!(config.broker.port, Some(12345));
        assert_eq!(config.downstream.base_url.as_deref(), Some("http://agent:8000"));
        config.validate().unwrap();

        let target = config.broker.resolve().unwrap();
        assert!(target.tls);
        assert_eq!(target.port, 12345);
    }

    #[test]
    fn test_legacy_agent_variable_is_accepted() {
        let config =
            AppConfig::load_from("test", vars(&[("AGENT_PYTHON_URL", "http://legacy:9000")]))
                .unwrap();
        assert_eq!(config.downstream.require_base_url().unwrap(), "http://legacy:9000");
    }

    #[test]
    fn test_prefixed_variables_override_defaults() {
        let config = AppConfig::load_from(
            "test",
            vars(&[
                ("RELAY__WORKER__CONCURRENCY", "12"),
                ("RELAY__DOWNSTREAM__BASE_URL", "https://agent.example.com"),
            ]),
        )
        .unwrap();
        assert_eq!(config.worker.concurrency, 12);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_port_is_configuration_error() {
        let err = AppConfig::load_from("test", vars(&[("REDIS_PORT", "not-a-port")]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn test_empty_plain_variable_counts_as_absent() {
        let config = AppConfig::load_from("test", vars(&[("REDIS_URL", "  ")])).unwrap();
        assert!(config.broker.url.is_none());
    }

    #[test]
    fn test_non_http_downstream_url_is_rejected() {
        let config = AppConfig {
            downstream: DownstreamConfig {
                base_url: Some("ftp://agent".to_string()),
                ..DownstreamConfig::default()
            },
            ..AppConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind, ErrorKind::Configuration);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut config = AppConfig::default();
        config.downstream.base_url = Some("http://agent:8000".to_string());
        config.worker.concurrency = 0;
        assert_eq!(config.validate().unwrap_err().kind, ErrorKind::Configuration);
    }
}
