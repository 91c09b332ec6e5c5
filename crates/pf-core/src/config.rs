//! Core configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! [certificates]
//! validity_days = 365
//!
//! [pairing]
//! session_ttl_secs = 300
//! pin_digits = 6
//! max_pin_attempts = 3
//!
//! [rate_limit.global]
//! max_requests = 1000
//! window_ms = 60000
//!
//! [rate_limit.device]
//! max_requests = 120
//! window_ms = 60000
//!
//! [rate_limit.actions."pairing.join"]
//! max_requests = 10
//! window_ms = 60000
//! block_ms = 300000
//!
//! [maintenance]
//! sweep_interval_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use pf_crypto::random::{MAX_PIN_DIGITS, MIN_PIN_DIGITS};
use serde::{Deserialize, Serialize};

use crate::certificate::DEFAULT_VALIDITY_DAYS;
use crate::errors::{CoreError, Result};
use crate::rate_limit::{RateLimitConfig, RateRule, ACTION_PAIRING_PIN};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub certificates: CertificateConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateConfig {
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            validity_days: default_validity_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Fixed lifetime of a pairing session.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_pin_digits")]
    pub pin_digits: u32,
    /// Wrong PIN proofs tolerated per peer before the session is cancelled.
    #[serde(default = "default_max_pin_attempts")]
    pub max_pin_attempts: u32,
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_pin_digits() -> u32 {
    6
}

fn default_max_pin_attempts() -> u32 {
    3
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            pin_digits: default_pin_digits(),
            max_pin_attempts: default_max_pin_attempts(),
        }
    }
}

impl PairingConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// A rate rule as written in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_ms: Option<u64>,
}

impl From<RuleConfig> for RateRule {
    fn from(rule: RuleConfig) -> Self {
        RateRule {
            max_requests: rule.max_requests,
            window: Duration::from_millis(rule.window_ms),
            block_duration: rule.block_ms.map(Duration::from_millis),
        }
    }
}

impl From<RateRule> for RuleConfig {
    fn from(rule: RateRule) -> Self {
        RuleConfig {
            max_requests: rule.max_requests,
            window_ms: rule.window.as_millis() as u64,
            block_ms: rule.block_duration.map(|d| d.as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<RuleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<RuleConfig>,
    #[serde(default)]
    pub actions: HashMap<String, RuleConfig>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            global: defaults.global.map(RuleConfig::from),
            device: defaults.device.map(RuleConfig::from),
            actions: defaults
                .actions
                .into_iter()
                .map(|(action, rule)| (action, rule.into()))
                .collect(),
        }
    }
}

impl RateLimitSection {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            global: self.global.map(RateRule::from),
            device: self.device.map(RateRule::from),
            actions: self
                .actions
                .iter()
                .map(|(action, rule)| (action.clone(), RateRule::from(*rule)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "error", "warn", "info", "debug" or "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

fn check_rule(name: &str, rule: &RuleConfig) -> Result<()> {
    if rule.max_requests == 0 {
        return Err(CoreError::Config(format!("{name}: max_requests must be greater than 0")));
    }
    if rule.window_ms == 0 {
        return Err(CoreError::Config(format!("{name}: window_ms must be greater than 0")));
    }
    if rule.block_ms == Some(0) {
        return Err(CoreError::Config(format!("{name}: block_ms must be greater than 0")));
    }
    Ok(())
}

impl CoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CoreConfig =
            toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Limiter rules including the PIN attempt budget, which is always
    /// `max_pin_attempts` per peer over one session lifetime.
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let mut limits = self.rate_limit.to_rate_limit_config();
        limits.actions.insert(
            ACTION_PAIRING_PIN.to_string(),
            RateRule::new(self.pairing.max_pin_attempts, self.pairing.session_ttl()),
        );
        limits
    }

    pub fn validate(&self) -> Result<()> {
        if self.certificates.validity_days == 0 {
            return Err(CoreError::Config("validity_days must be greater than 0".into()));
        }
        if self.pairing.session_ttl_secs == 0 {
            return Err(CoreError::Config("session_ttl_secs must be greater than 0".into()));
        }
        if !(MIN_PIN_DIGITS..=MAX_PIN_DIGITS).contains(&self.pairing.pin_digits) {
            return Err(CoreError::Config(format!(
                "pin_digits must be within {MIN_PIN_DIGITS}..={MAX_PIN_DIGITS}"
            )));
        }
        if self.pairing.max_pin_attempts == 0 {
            return Err(CoreError::Config("max_pin_attempts must be greater than 0".into()));
        }
        if let Some(rule) = &self.rate_limit.global {
            check_rule("rate_limit.global", rule)?;
        }
        if let Some(rule) = &self.rate_limit.device {
            check_rule("rate_limit.device", rule)?;
        }
        for (action, rule) in &self.rate_limit.actions {
            check_rule(&format!("rate_limit.actions.{action}"), rule)?;
        }
        if self.maintenance.sweep_interval_secs == 0 {
            return Err(CoreError::Config("sweep_interval_secs must be greater than 0".into()));
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(CoreError::Config(format!(
                "invalid log level '{}'. Valid values: {:?}",
                self.logging.level, VALID_LOG_LEVELS
            )));
        }
        Ok(())
    }
}
