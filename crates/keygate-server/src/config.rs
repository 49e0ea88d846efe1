//! Daemon configuration.
//!
//! Settings come from three layers, later winning: built-in defaults (a
//! development set under `--debug`), an optional YAML file, and `KEYGATE_*`
//! environment variables. Nested keys use `__` in the environment, e.g.
//! `KEYGATE_LISTEN__PORT=9000` or `KEYGATE_SWEEP__INTERVAL_SECS=120`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ServerError;

/// Where to accept connections.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSettings {
    /// TCP host.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Unix socket path. When set, it wins over host and port.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Which storage backend to run on.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Volatile in-memory store instead of the database file.
    pub memory: bool,
    /// Database file for the durable store.
    pub path: PathBuf,
}

/// Expiration sweep cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepSettings {
    /// Seconds between sweep cycles.
    pub interval_secs: u64,
}

impl SweepSettings {
    /// The interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Listener settings.
    pub listen: ListenSettings,
    /// Storage settings.
    pub store: StoreSettings,
    /// Sweep settings.
    pub sweep: SweepSettings,
}

impl Settings {
    /// Loads configuration from defaults, an optional YAML file, and the
    /// environment.
    ///
    /// `debug` swaps in development defaults: loopback on port 8002, the
    /// in-memory store, and a 60-second sweep. Normal defaults are port
    /// 8000, the database file, and an hourly sweep.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] when the file cannot be read or a
    /// value does not fit its setting.
    pub fn load(path: Option<&Path>, debug: bool) -> Result<Self, ServerError> {
        let (port, memory, sweep_secs) = if debug { (8002, true, 60) } else { (8000, false, 3600) };

        let mut builder = Config::builder()
            .set_default("listen.host", "127.0.0.1")
            .and_then(|b| b.set_default("listen.port", port))
            .and_then(|b| b.set_default("store.memory", memory))
            .and_then(|b| b.set_default("store.path", "keygate.redb"))
            .and_then(|b| b.set_default("sweep.interval_secs", sweep_secs))
            .map_err(|e| ServerError::Config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder
            .add_source(Environment::with_prefix("KEYGATE").separator("__").try_parsing(true));

        let config = builder.build().map_err(|e| ServerError::Config(e.to_string()))?;
        config.try_deserialize().map_err(|e| ServerError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn debug_defaults() {
        let settings = Settings::load(None, true).unwrap();
        assert_eq!(settings.listen.host, "127.0.0.1");
        assert_eq!(settings.listen.port, 8002);
        assert!(settings.listen.path.is_none());
        assert!(settings.store.memory);
        assert_eq!(settings.sweep.interval(), Duration::from_secs(60));
    }

    #[test]
    fn normal_defaults() {
        let settings = Settings::load(None, false).unwrap();
        assert_eq!(settings.listen.port, 8000);
        assert!(!settings.store.memory);
        assert_eq!(settings.store.path, PathBuf::from("keygate.redb"));
        assert_eq!(settings.sweep.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keygate.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "listen:\n  port: 9000\nsweep:\n  interval_secs: 120").unwrap();

        let settings = Settings::load(Some(&path), false).unwrap();
        assert_eq!(settings.listen.port, 9000);
        assert_eq!(settings.sweep.interval_secs, 120);
        // Untouched keys keep their defaults.
        assert_eq!(settings.listen.host, "127.0.0.1");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/keygate.yaml")), false).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
