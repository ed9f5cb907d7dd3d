//! Relay configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "0.0.0.0:3030";
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Relay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// `SHAPESYNC_ADDR`
    pub addr: SocketAddr,
    /// `SHAPESYNC_DATA_DIR`; room snapshots are kept in memory only when unset.
    pub data_dir: Option<PathBuf>,
    /// `SHAPESYNC_SAVE_INTERVAL_SECS`
    pub save_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            data_dir: None,
            save_interval: Duration::from_secs(DEFAULT_SAVE_INTERVAL_SECS),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = lookup("SHAPESYNC_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                var: "SHAPESYNC_ADDR",
                message: e.to_string(),
            })?;

        let data_dir = lookup("SHAPESYNC_DATA_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let save_interval = match lookup("SHAPESYNC_SAVE_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                    var: "SHAPESYNC_SAVE_INTERVAL_SECS",
                    message: e.to_string(),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        var: "SHAPESYNC_SAVE_INTERVAL_SECS",
                        message: "must be positive".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_SAVE_INTERVAL_SECS),
        };

        Ok(Self {
            addr,
            data_dir,
            save_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(ServerConfig::from_lookup(lookup(&[])).unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("SHAPESYNC_ADDR", "127.0.0.1:9000"),
            ("SHAPESYNC_DATA_DIR", "/tmp/rooms"),
            ("SHAPESYNC_SAVE_INTERVAL_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/rooms")));
        assert_eq!(config.save_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::from_lookup(lookup(&[("SHAPESYNC_ADDR", "nope")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("SHAPESYNC_SAVE_INTERVAL_SECS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("SHAPESYNC_SAVE_INTERVAL_SECS", "x")])).is_err());
    }
}
