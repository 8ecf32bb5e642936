//! Queue configuration.
//!
//! A small `serde`-derived settings struct with a `Default` impl,
//! deserialisable from TOML whether it comes from a file, an embedded
//! string, or a host process's own config layer.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Lease duration and lease-reaper tick, with the defaults called out in the
/// spec (a 10 minute lease).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    extension_secs: u64,
    reaper_interval_secs: u64,
}

impl QueueConfig {
    /// How long a lease is valid for once granted or renewed.
    pub fn extension(&self) -> Duration {
        Duration::from_secs(self.extension_secs)
    }

    /// Suggested interval for [`crate::Queue::spawn_lease_reaper`].
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Parse configuration from a TOML document. Missing keys fall back to
    /// [`QueueConfig::default`].
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Load configuration from a TOML file on disk, for a host process that
    /// keeps its settings in a file rather than passing a string directly.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, crate::error::ConfigError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|source| crate::error::ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml_str(&contents).map_err(|source| crate::error::ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            extension_secs: 600,
            reaper_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extension_is_ten_minutes() {
        assert_eq!(QueueConfig::default().extension(), Duration::from_secs(600));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = QueueConfig::from_toml_str("extension_secs = 30").unwrap();
        assert_eq!(config.extension(), Duration::from_secs(30));
        assert_eq!(config.reaper_interval(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(QueueConfig::from_toml_str("not valid toml = = =").is_err());
    }

    #[test]
    fn loads_from_a_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.toml");
        std::fs::write(&path, "extension_secs = 120\nreaper_interval_secs = 5\n").unwrap();

        let config = QueueConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.extension(), Duration::from_secs(120));
        assert_eq!(config.reaper_interval(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = QueueConfig::from_toml_file("/nonexistent/queue.toml").unwrap_err();
        assert!(matches!(err, crate::error::ConfigError::Io { .. }));
    }
}
