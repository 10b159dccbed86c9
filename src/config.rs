use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STUCK_AFTER: Duration = Duration::from_secs(60 * 60);

/// Runtime settings, read from `STOWAWAY_*` environment variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Path of the SQLite database. An in-memory database is used when unset.
    pub db_path: Option<String>,
    pub max_attempts: Option<u32>,
    pub batch_size: Option<u32>,
    pub dead_letter_enabled: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub dispatch_timeout_ms: Option<u64>,
    pub stuck_after_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("STOWAWAY_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    /// Dispatch attempts a message gets before it is dead-lettered.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn dead_letter_enabled(&self) -> bool {
        self.dead_letter_enabled.unwrap_or(true)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// No timeout is applied to dispatches unless one is configured.
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_ms.map(Duration::from_millis)
    }

    /// How long a message may sit in `processing` before health checks flag it.
    pub fn stuck_after(&self) -> Duration {
        self.stuck_after_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STUCK_AFTER)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_attempts() == 0 {
            return Err(Error::invalid_parameter("max_attempts must be at least 1"));
        }
        if self.batch_size() == 0 {
            return Err(Error::invalid_parameter("batch_size must be at least 1"));
        }
        if self.dispatch_timeout() == Some(Duration::ZERO) {
            return Err(Error::invalid_parameter(
                "dispatch_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.db_path(), None);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.batch_size(), 100);
        assert!(config.dead_letter_enabled());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.dispatch_timeout(), None);
        assert_eq!(config.stuck_after(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_vars() {
        let vars = vec![
            ("STOWAWAY_DB_PATH".to_owned(), "/tmp/outbox.db".to_owned()),
            ("STOWAWAY_MAX_ATTEMPTS".to_owned(), "5".to_owned()),
            ("STOWAWAY_DEAD_LETTER_ENABLED".to_owned(), "false".to_owned()),
            ("STOWAWAY_DISPATCH_TIMEOUT_MS".to_owned(), "250".to_owned()),
        ];

        let config: Config = envy::prefixed("STOWAWAY_").from_iter(vars).unwrap();

        assert_eq!(config.db_path(), Some("/tmp/outbox.db"));
        assert_eq!(config.max_attempts(), 5);
        assert!(!config.dead_letter_enabled());
        assert_eq!(config.dispatch_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.batch_size(), 100);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let invalid = vec![
            Config {
                max_attempts: Some(0),
                ..Default::default()
            },
            Config {
                batch_size: Some(0),
                ..Default::default()
            },
            Config {
                dispatch_timeout_ms: Some(0),
                ..Default::default()
            },
        ];

        for config in invalid {
            match config.validate() {
                Err(Error::InvalidParameter { .. }) => {}
                other => panic!("Expected InvalidParameter for {config:?}, got {other:?}"),
            }
        }
    }
}
