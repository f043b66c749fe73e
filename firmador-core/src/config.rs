//! Engine configuration.
use chrono::{FixedOffset, Offset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const COLOMBIA_UTC_OFFSET_SECONDS: i32 = -5 * 3600;
const DEFAULT_EXPIRY_WARNING_DAYS: i64 = 30;
/// Upper bound for the expiry warning window, roughly one century.
pub const MAX_EXPIRY_WARNING_DAYS: i64 = 36_500;

/// Error returned when a configuration value is out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid UTC offset: {seconds} seconds")]
    InvalidUtcOffset { seconds: i32 },

    #[error("invalid expiry warning: {days} days (expected 0 to 36500)")]
    InvalidExpiryWarning { days: i64 },

    #[error("invalid configuration JSON: {message}")]
    Parse { message: String },
}

/// Settings shared by the signer, the validator and the bundle cache.
///
/// # Examples
/// ```rust
/// use firmador_core::config::Config;
/// use std::time::Duration;
///
/// let config = Config::default().with_cache_ttl(Duration::from_secs(600));
/// assert_eq!(config.cache_ttl(), Duration::from_secs(600));
/// assert_eq!(config.utc_offset().local_minus_utc(), -5 * 3600);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    utc_offset_seconds: i32,
    cache_ttl_seconds: u64,
    expiry_warning_days: i64,
    include_chain: bool,
}

impl Config {
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            utc_offset_seconds: utc_offset.local_minus_utc(),
            ..Self::default()
        }
    }

    /// Parses a JSON configuration; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.checked_offset()?;
        config.checked_expiry_warning()?;
        Ok(config)
    }

    pub fn with_utc_offset(mut self, utc_offset: FixedOffset) -> Self {
        self.utc_offset_seconds = utc_offset.local_minus_utc();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn with_expiry_warning_days(mut self, days: i64) -> Result<Self, ConfigError> {
        self.expiry_warning_days = days;
        self.checked_expiry_warning()?;
        Ok(self)
    }

    /// Whether CA certificates shipped in the bundle are listed in `SigningCertificate`.
    pub fn with_chain(mut self, include_chain: bool) -> Self {
        self.include_chain = include_chain;
        self
    }

    /// Offset used to render `xades:SigningTime`. An out-of-range value that
    /// bypassed [`Config::from_json`] falls back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        self.checked_offset().unwrap_or_else(|_| Utc.fix())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    /// Window before `not_after` in which validation warns. An out-of-range
    /// value that bypassed [`Config::from_json`] falls back to the default.
    pub fn expiry_warning(&self) -> TimeDelta {
        self.checked_expiry_warning()
            .unwrap_or(TimeDelta::days(DEFAULT_EXPIRY_WARNING_DAYS))
    }

    pub fn include_chain(&self) -> bool {
        self.include_chain
    }

    fn checked_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or(ConfigError::InvalidUtcOffset {
            seconds: self.utc_offset_seconds,
        })
    }

    fn checked_expiry_warning(&self) -> Result<TimeDelta, ConfigError> {
        let days = self.expiry_warning_days;
        if !(0..=MAX_EXPIRY_WARNING_DAYS).contains(&days) {
            return Err(ConfigError::InvalidExpiryWarning { days });
        }
        TimeDelta::try_days(days).ok_or(ConfigError::InvalidExpiryWarning { days })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            utc_offset_seconds: COLOMBIA_UTC_OFFSET_SECONDS,
            cache_ttl_seconds: 3600,
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
            include_chain: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_colombia() {
        let config = Config::default();
        assert_eq!(config.utc_offset().local_minus_utc(), -18_000);
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.expiry_warning(), TimeDelta::days(30));
        assert!(config.include_chain());
    }

    #[test]
    fn from_json_fills_missing_keys() {
        let config = Config::from_json(r#"{ "cache_ttl_seconds": 60 }"#).expect("config");
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.utc_offset().local_minus_utc(), -18_000);
    }

    #[test]
    fn from_json_rejects_out_of_range_offset() {
        let err = Config::from_json(r#"{ "utc_offset_seconds": 200000 }"#).unwrap_err();
        assert_eq!(err, ConfigError::InvalidUtcOffset { seconds: 200_000 });
    }

    #[test]
    fn from_json_rejects_out_of_range_expiry_warning() {
        for json in [
            r#"{ "expiry_warning_days": 9223372036854775807 }"#,
            r#"{ "expiry_warning_days": -1 }"#,
        ] {
            assert!(matches!(
                Config::from_json(json),
                Err(ConfigError::InvalidExpiryWarning { .. })
            ));
        }
        let config = Config::from_json(r#"{ "expiry_warning_days": 36500 }"#).expect("config");
        assert_eq!(config.expiry_warning(), TimeDelta::days(MAX_EXPIRY_WARNING_DAYS));
    }

    #[test]
    fn expiry_warning_setter_is_range_checked() {
        assert_eq!(
            Config::default().with_expiry_warning_days(i64::MAX).unwrap_err(),
            ConfigError::InvalidExpiryWarning { days: i64::MAX }
        );
        let config = Config::default().with_expiry_warning_days(45).expect("config");
        assert_eq!(config.expiry_warning(), TimeDelta::days(45));
    }

    #[test]
    fn deserialized_out_of_range_warning_falls_back_to_default() {
        let config: Config =
            serde_json::from_str(r#"{ "expiry_warning_days": 9223372036854775807 }"#).expect("raw");
        assert_eq!(config.expiry_warning(), TimeDelta::days(30));
    }

    #[test]
    fn from_json_reports_syntax_errors() {
        assert!(matches!(
            Config::from_json("{ not json"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
