//! Core configuration.
//!
//! Every section is `#[serde(default)]`, so a partial JSON document only
//! overrides the fields it names.

use crate::model::recovery::FallbackStrategy;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const DEFAULT_SAVE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_KEY_PREFIX: &str = "slidesafe_autosave_";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid core config: {err}"),
            Self::Invalid(details) => write!(f, "invalid core config: {details}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Top-level configuration for an [`EditingSession`](crate::EditingSession).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub save: SaveConfig,
    pub recovery: RecoveryConfig,
}

/// Save scheduler defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Debounce quiet period before a remote save fires.
    pub delay_ms: u64,
    /// Namespace prepended to document ids in the local store.
    pub key_prefix: String,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_SAVE_DELAY_MS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl SaveConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Slide recovery defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts allowed before the fallback strategy takes over. `0` falls back at once.
    pub max_retries: u32,
    /// Base back-off; attempt `k` waits `retry_delay_ms * k`.
    pub retry_delay_ms: u64,
    pub fallback_strategy: FallbackStrategy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            fallback_strategy: FallbackStrategy::default(),
        }
    }
}

impl CoreConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save.key_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("save.key_prefix cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig, DEFAULT_KEY_PREFIX};
    use crate::model::recovery::FallbackStrategy;
    use std::time::Duration;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.save.delay(), Duration::from_secs(5));
        assert_eq!(config.save.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(
            config.recovery.fallback_strategy,
            FallbackStrategy::Placeholder
        );
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = CoreConfig::from_json_str(
            r#"{"save": {"delay_ms": 250}, "recovery": {"fallback_strategy": "previous"}}"#,
        )
        .unwrap();
        assert_eq!(config.save.delay_ms, 250);
        assert_eq!(config.save.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.recovery.retry_delay_ms, 1_000);
        assert_eq!(config.recovery.fallback_strategy, FallbackStrategy::Previous);
    }

    #[test]
    fn rejects_blank_key_prefix_and_unknown_strategy() {
        let blank = CoreConfig::from_json_str(r#"{"save": {"key_prefix": "  "}}"#).unwrap_err();
        assert!(matches!(blank, ConfigError::Invalid(_)));

        let unknown =
            CoreConfig::from_json_str(r#"{"recovery": {"fallback_strategy": "retry_forever"}}"#)
                .unwrap_err();
        assert!(matches!(unknown, ConfigError::Parse(_)));
    }
}
