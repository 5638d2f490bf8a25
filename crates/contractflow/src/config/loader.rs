use std::path::Path;

use crate::config::schema::{Config, RetryPolicySettings};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

pub(crate) fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.data_directory.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "data_directory must not be empty".to_string(),
        });
    }

    if config.workers.count == 0 {
        return Err(ConfigError::Validation {
            message: "workers.count must be greater than 0".to_string(),
        });
    }

    if config.workers.lease_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "workers.lease_timeout_secs must be greater than 0".to_string(),
        });
    }

    if config.resilience.failure_threshold == 0 {
        return Err(ConfigError::Validation {
            message: "resilience.failure_threshold must be greater than 0".to_string(),
        });
    }

    if config.queue.backoff_max_ms < config.queue.backoff_base_ms {
        return Err(ConfigError::Validation {
            message: "queue.backoff_max_ms must not be below queue.backoff_base_ms".to_string(),
        });
    }

    let retry = &config.resilience.retry;
    for (name, policy) in [
        ("network", &retry.network),
        ("database", &retry.database),
        ("unknown", &retry.unknown),
    ] {
        validate_retry_policy(name, policy)?;
    }

    if config.broadcast.capacity == 0 {
        return Err(ConfigError::Validation {
            message: "broadcast.capacity must be greater than 0".to_string(),
        });
    }

    Ok(())
}

fn validate_retry_policy(name: &str, policy: &RetryPolicySettings) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: format!("resilience.retry.{}.max_attempts must be at least 1", name),
        });
    }
    if policy.max_delay_ms < policy.base_delay_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "resilience.retry.{}.max_delay_ms must not be below base_delay_ms",
                name
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackoffCurve, Environment};

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config =
            load_config_from_str(r#"{"version": "1.0", "data_directory": "/var/lib/cf"}"#)
                .unwrap();
        assert_eq!(config.queue.default_priority, 50);
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.resilience.failure_threshold, 5);
        assert_eq!(config.resilience.cooldown_secs, 30);
        assert_eq!(config.mirror.grace_period_secs, 10);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.resilience.retry.network.max_attempts, 3);
        assert_eq!(
            config.resilience.retry.network.backoff,
            BackoffCurve::Exponential
        );
        assert!(config.database_path().ends_with("contractflow.db"));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = load_config_from_str(
            r#"{
                "version": "1.0",
                "data_directory": "/tmp/cf",
                "environment": "development",
                "workers": {"count": 2, "poll_interval_ms": 10},
                "resilience": {"failure_threshold": 2, "retry": {"network": {"max_attempts": 5, "base_delay_ms": 0, "max_delay_ms": 0}}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.workers.count, 2);
        assert_eq!(config.workers.lease_timeout_secs, 300);
        assert_eq!(config.resilience.failure_threshold, 2);
        assert_eq!(config.resilience.retry.network.max_attempts, 5);
        assert_eq!(config.resilience.retry.database.max_attempts, 3);
        assert!(config.environment.exposes_error_detail());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let err = load_config_from_str(r#"{"version": "2.0", "data_directory": "/tmp"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("version") || err.to_string().contains("2.0"));
    }

    #[test]
    fn test_missing_data_directory_fails_schema() {
        let err = load_config_from_str(r#"{"version": "1.0"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = load_config_from_str(
            r#"{"version": "1.0", "data_directory": "/tmp", "resilience": {"failure_threshold": 0}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::SchemaValidation { .. } | ConfigError::Validation { .. }
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::with_data_directory("/tmp/cf");
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
