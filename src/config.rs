//! Configuration loading using Figment for layered config merging.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. `/etc/donorflow/donorflow.toml` (system-wide)
//! 3. `~/.config/donorflow/donorflow.toml` (user XDG config)
//! 4. `./donorflow.toml` (local directory)
//! 5. `DONORFLOW_*` environment variables

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest a pending appointment request may live (90 days).
pub const MAX_REQUEST_EXPIRY_HOURS: i64 = 24 * 90;

/// Longest accepted gap between donations (three years).
pub const MAX_DONATION_INTERVAL_DAYS: i64 = 3 * 365;

pub const MAX_LOCK_RETRIES: u32 = 1_000;

pub const MAX_LOCK_BACKOFF_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    #[serde(default)]
    pub eligibility: EligibilityConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulingConfig {
    /// Capacity assumed for a slot nobody configured.
    #[serde(default = "default_slot_capacity")]
    pub default_slot_capacity: u32,

    /// How long a pending appointment request lives before expiring.
    #[serde(default = "default_request_expiry_hours")]
    pub request_expiry_hours: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_slot_capacity: default_slot_capacity(),
            request_expiry_hours: default_request_expiry_hours(),
        }
    }
}

fn default_slot_capacity() -> u32 {
    10
}

fn default_request_expiry_hours() -> i64 {
    72
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EligibilityConfig {
    /// Minimum days between two donations by the same donor.
    #[serde(default = "default_min_donation_interval_days")]
    pub min_donation_interval_days: i64,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_donation_interval_days: default_min_donation_interval_days(),
        }
    }
}

fn default_min_donation_interval_days() -> i64 {
    90
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    /// Try to fulfill new workflows straight from stock.
    #[serde(default = "default_true")]
    pub auto_match_on_create: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            auto_match_on_create: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Lock attempts before a contended write surfaces as a conflict.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,

    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_retries: default_lock_retries(),
            lock_backoff_ms: default_lock_backoff_ms(),
        }
    }
}

fn default_lock_retries() -> u32 {
    5
}

fn default_lock_backoff_ms() -> u64 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Reject values that parse but make no sense.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_REQUEST_EXPIRY_HOURS).contains(&self.scheduling.request_expiry_hours) {
            return Err(ConfigError::Invalid(format!(
                "scheduling.request_expiry_hours must be between 1 and {MAX_REQUEST_EXPIRY_HOURS}"
            )));
        }
        if !(1..=MAX_DONATION_INTERVAL_DAYS).contains(&self.eligibility.min_donation_interval_days) {
            return Err(ConfigError::Invalid(format!(
                "eligibility.min_donation_interval_days must be between 1 and {MAX_DONATION_INTERVAL_DAYS}"
            )));
        }
        if self.store.lock_retries > MAX_LOCK_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "store.lock_retries must be at most {MAX_LOCK_RETRIES}"
            )));
        }
        if self.store.lock_backoff_ms > MAX_LOCK_BACKOFF_MS {
            return Err(ConfigError::Invalid(format!(
                "store.lock_backoff_ms must be at most {MAX_LOCK_BACKOFF_MS}"
            )));
        }
        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of trace, debug, info, warn, error (got '{}')",
                self.logging.level
            )));
        }
        Ok(())
    }
}

/// Load configuration from the standard hierarchy with env var overrides.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = build_figment().extract()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML string only. Used for tests.
pub fn load_config_from_str(toml_content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = Figment::new()
        .merge(Serialized::defaults(EngineConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = Figment::new()
        .merge(Serialized::defaults(EngineConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()?;
    config.validate()?;
    Ok(config)
}

pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(EngineConfig::default()))
        .merge(Toml::file("/etc/donorflow/donorflow.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("donorflow/donorflow.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("donorflow.toml"))
        .merge(env_provider())
}

/// Map `DONORFLOW_SECTION_KEY` onto `section.key`.
///
/// Uses `Env::map()` rather than `split("_")` because keys themselves
/// contain underscores (`DONORFLOW_STORE_LOCK_RETRIES` is `store.lock_retries`).
fn env_provider() -> Env {
    Env::prefixed("DONORFLOW_").map(|key| {
        key.as_str()
            .replacen("scheduling_", "scheduling.", 1)
            .replacen("eligibility_", "eligibility.", 1)
            .replacen("inventory_", "inventory.", 1)
            .replacen("store_", "store.", 1)
            .replacen("logging_", "logging.", 1)
            .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.scheduling.default_slot_capacity, 10);
        assert_eq!(config.eligibility.min_donation_interval_days, 90);
        assert!(config.inventory.auto_match_on_create);
    }

    #[test]
    fn sections_override_defaults() {
        let config = load_config_from_str(
            r#"
[scheduling]
default_slot_capacity = 4
request_expiry_hours = 24

[store]
lock_retries = 9

[logging]
level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.scheduling.default_slot_capacity, 4);
        assert_eq!(config.scheduling.request_expiry_hours, 24);
        assert_eq!(config.store.lock_retries, 9);
        assert_eq!(config.store.lock_backoff_ms, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = load_config_from_str(
            r#"
[scheduling]
default_slot_capcity = 4
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("unknown field") || msg.contains("default_slot_capcity"),
            "got: {msg}"
        );
    }

    #[test]
    fn nonsensical_values_fail_validation() {
        let err = load_config_from_str(
            r#"
[eligibility]
min_donation_interval_days = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = load_config_from_str(
            r#"
[logging]
level = "loud"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn oversized_durations_fail_validation() {
        for toml in [
            "[eligibility]\nmin_donation_interval_days = 200000000\n",
            "[scheduling]\nrequest_expiry_hours = 9223372036854775807\n",
            "[store]\nlock_backoff_ms = 60000\n",
            "[store]\nlock_retries = 4000000000\n",
        ] {
            let err = load_config_from_str(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "accepted: {toml}");
        }

        let edge = format!(
            "[eligibility]\nmin_donation_interval_days = {MAX_DONATION_INTERVAL_DAYS}\n"
        );
        assert!(load_config_from_str(&edge).is_ok());
    }

    #[test]
    fn env_vars_map_onto_sections() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "donorflow.toml",
                r#"
[scheduling]
default_slot_capacity = 3
"#,
            )?;
            jail.set_env("DONORFLOW_STORE_LOCK_RETRIES", "11");
            jail.set_env("DONORFLOW_SCHEDULING_DEFAULT_SLOT_CAPACITY", "6");

            let config = load_config_from_path(Path::new("donorflow.toml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.store.lock_retries, 11);
            assert_eq!(config.scheduling.default_slot_capacity, 6);
            Ok(())
        });
    }
}
