use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::QueueError;

/// Runtime settings for the daemon process itself. Everything tunable at
/// runtime lives in the store's `config` table instead (see [`ConfigKey`]).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    pub state_dir: PathBuf,
    pub worker_count: usize,
    /// Program and arguments used to spawn worker children. Defaults to the
    /// current executable with the hidden `worker` subcommand.
    pub worker_command: Option<(PathBuf, Vec<String>)>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7077".parse().unwrap(),
            state_dir: PathBuf::from("./queuectl-state"),
            worker_count: 3,
            worker_command: None,
        }
    }
}

impl DaemonConfig {
    pub fn new(listen_addr: SocketAddr, state_dir: PathBuf, worker_count: usize) -> Self {
        Self {
            listen_addr,
            state_dir,
            worker_count,
            ..Default::default()
        }
    }
}

/// The recognized keys of the `config` table, with per-key value schemas.
/// Values are validated here, at the set boundary; the core reads them back
/// through the typed [`Settings`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    BackoffFactorMs,
    TickIntervalMs,
    SaveIntervalMs,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 5] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::BackoffFactorMs,
        ConfigKey::TickIntervalMs,
        ConfigKey::SaveIntervalMs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::BackoffFactorMs => "backoff_factor_ms",
            ConfigKey::TickIntervalMs => "tick_interval_ms",
            ConfigKey::SaveIntervalMs => "save_interval_ms",
        }
    }

    pub fn parse(key: &str) -> Option<ConfigKey> {
        Self::ALL.iter().copied().find(|k| k.as_str() == key)
    }

    pub fn default_value(&self) -> u64 {
        match self {
            ConfigKey::MaxRetries => 3,
            ConfigKey::BackoffBase => 2,
            ConfigKey::BackoffFactorMs => 1000,
            ConfigKey::TickIntervalMs => 100,
            ConfigKey::SaveIntervalMs => 5000,
        }
    }

    fn min_value(&self) -> u64 {
        match self {
            ConfigKey::MaxRetries => 0,
            ConfigKey::BackoffBase => 1,
            ConfigKey::BackoffFactorMs => 0,
            ConfigKey::TickIntervalMs => 50,
            ConfigKey::SaveIntervalMs => 1000,
        }
    }

    /// Validate a raw textual value against this key's schema, returning the
    /// sanitized form that gets stored.
    pub fn validate(&self, value: &str) -> Result<String, QueueError> {
        let parsed: u64 = value.trim().parse().map_err(|_| {
            QueueError::Validation(format!(
                "config key '{}' requires a non-negative integer, got '{}'",
                self.as_str(),
                value
            ))
        })?;
        if parsed < self.min_value() {
            return Err(QueueError::Validation(format!(
                "config key '{}' must be >= {}",
                self.as_str(),
                self.min_value()
            )));
        }
        Ok(parsed.to_string())
    }
}

/// Typed snapshot of the config table, read by the scheduler each time it
/// needs a setting. Unparseable stored values fall back to defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub max_retries: u32,
    pub backoff_base: u32,
    pub backoff_factor_ms: u64,
    pub tick_interval_ms: u64,
    pub save_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: ConfigKey::MaxRetries.default_value() as u32,
            backoff_base: ConfigKey::BackoffBase.default_value() as u32,
            backoff_factor_ms: ConfigKey::BackoffFactorMs.default_value(),
            tick_interval_ms: ConfigKey::TickIntervalMs.default_value(),
            save_interval_ms: ConfigKey::SaveIntervalMs.default_value(),
        }
    }
}

impl Settings {
    /// Build from raw `(key, value)` pairs as stored in the config table.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut settings = Settings::default();
        for (key, value) in pairs {
            let Ok(parsed) = value.parse::<u64>() else {
                continue;
            };
            match ConfigKey::parse(key) {
                Some(ConfigKey::MaxRetries) => settings.max_retries = parsed as u32,
                Some(ConfigKey::BackoffBase) => settings.backoff_base = parsed as u32,
                Some(ConfigKey::BackoffFactorMs) => settings.backoff_factor_ms = parsed,
                Some(ConfigKey::TickIntervalMs) => settings.tick_interval_ms = parsed,
                Some(ConfigKey::SaveIntervalMs) => settings.save_interval_ms = parsed,
                None => {}
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_in_range_values() {
        assert_eq!(ConfigKey::MaxRetries.validate("0").unwrap(), "0");
        assert_eq!(ConfigKey::TickIntervalMs.validate(" 250 ").unwrap(), "250");
    }

    #[test]
    fn validate_rejects_below_minimum() {
        assert!(ConfigKey::BackoffBase.validate("0").is_err());
        assert!(ConfigKey::TickIntervalMs.validate("49").is_err());
        assert!(ConfigKey::SaveIntervalMs.validate("999").is_err());
    }

    #[test]
    fn validate_rejects_non_integers() {
        assert!(ConfigKey::MaxRetries.validate("three").is_err());
        assert!(ConfigKey::MaxRetries.validate("-1").is_err());
        assert!(ConfigKey::MaxRetries.validate("").is_err());
    }

    #[test]
    fn settings_from_pairs_falls_back_on_garbage() {
        let settings = Settings::from_pairs([
            ("max_retries", "5"),
            ("backoff_base", "not-a-number"),
            ("unknown_key", "7"),
        ]);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.backoff_base, 2);
    }
}
