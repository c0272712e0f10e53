//! Engine configuration loaded from TOML
//!
//! ```toml
//! [storage]
//! path = "data/license-ledger"
//! flush_on_commit = true
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 25
//! max_delay_ms = 400
//! write_timeout_ms = 2000
//!
//! [concurrency]
//! mode = "wait"
//! wait_timeout_ms = 250
//!
//! [logging]
//! filter = "info"
//! ```
//!
//! An optional `[policy]` table holds the bootstrap policy document.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::error::ConfigError;
use crate::locks::LockMode;
use crate::policy::PolicyDocument;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub flush_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            flush_on_commit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentionMode {
    #[default]
    Wait,
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    #[serde(default)]
    pub mode: ContentionMode,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            mode: ContentionMode::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/license-ledger")
}
fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    25
}
fn default_max_delay_ms() -> u64 {
    400
}
fn default_write_timeout_ms() -> u64 {
    2_000
}
fn default_wait_timeout_ms() -> u64 {
    250
}
fn default_filter() -> String {
    "info".to_string()
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.write_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "retry.write_timeout_ms must be positive".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if let Some(policy) = &self.policy {
            policy
                .validate()
                .map_err(|e| ConfigError::Validation(format!("policy: {e}")))?;
        }
        Ok(())
    }

    pub fn settings(&self) -> EngineSettings {
        let lock_mode = match self.concurrency.mode {
            ContentionMode::FailFast => LockMode::FailFast,
            ContentionMode::Wait => LockMode::Wait(Duration::from_millis(self.concurrency.wait_timeout_ms)),
        };

        EngineSettings {
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                write_timeout: Duration::from_millis(self.retry.write_timeout_ms),
            },
            lock_mode,
            flush_on_commit: self.storage.flush_on_commit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        let settings = config.settings();

        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.lock_mode, LockMode::default());
        assert!(settings.flush_on_commit);
        assert_eq!(config.logging.filter, "info");
        assert!(config.policy.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [storage]
            path = "/tmp/ledger"
            flush_on_commit = false

            [retry]
            max_attempts = 2

            [concurrency]
            mode = "fail-fast"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.path, PathBuf::from("/tmp/ledger"));
        let settings = config.settings();
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(25));
        assert_eq!(settings.lock_mode, LockMode::FailFast);
        assert!(!settings.flush_on_commit);
    }

    #[test]
    fn embedded_policy_is_parsed_and_validated() {
        let config = EngineConfig::from_toml(
            r#"
            [policy]
            governance_roles = ["emperor"]

            [[policy.modules]]
            id = "inventory"
            operations = [{ id = "view", read_only = true }]

            [[policy.roles]]
            role = "viewer"
            level = 1
            operations = ["view"]

            [[policy.rules]]
            kind = "issue"
            approving_roles = ["governor"]
            fee = { type = "flat", amount = "100.00" }
            "#,
        )
        .unwrap();

        let policy = config.policy.unwrap();
        assert_eq!(policy.billing_period_days, 30);
        assert_eq!(policy.modules.len(), 1);
        assert_eq!(policy.rules.len(), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml("[retry]\nmax_attempts = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("[retry]\nwrite_timeout_ms = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("[concurrency]\nmode = \"sometimes\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("[policy]\ngovernance_roles = []"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn config_survives_a_toml_roundtrip() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = EngineConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.settings().retry, config.settings().retry);
    }
}
