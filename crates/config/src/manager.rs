//! Configuration manager implementation
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `SKETCH__` (nested keys separated by `__`,
//! e.g. `SKETCH__ROUTER__TIMEOUT_MS=5000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config_rs::{Config, Environment, File};
use tracing::{debug, info};

use common::error::{Error, Result};

use crate::defaults;

/// Layered runtime settings
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Merged settings
    inner: Config,

    /// File the settings were read from, if any
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a configuration manager from defaults, the per-user config file and the environment
    pub fn new() -> Result<Self> {
        let path = Self::default_config_path().filter(|p| p.exists());
        Self::load(path.as_deref(), std::iter::empty::<(String, String)>())
    }

    /// Creates a configuration manager reading the given file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!("config file not found: {}", path.display())));
        }
        Self::load(Some(path), std::iter::empty::<(String, String)>())
    }

    /// Creates a configuration manager from defaults plus explicit overrides
    ///
    /// Environment variables and files are ignored, which keeps tests hermetic.
    pub fn with_overrides<I, K, V>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut builder = defaults::apply_defaults(Config::builder())?;
        for (key, value) in overrides {
            builder = builder
                .set_override(key.into(), value.into())
                .map_err(config_error)?;
        }

        let inner = builder.build().map_err(config_error)?;
        Ok(Self { inner, source_path: None })
    }

    fn load<I, K, V>(path: Option<&Path>, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut builder = defaults::apply_defaults(Config::builder())?;

        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("SKETCH")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder
                .set_override(key.into(), value.into())
                .map_err(config_error)?;
        }

        let inner = builder.build().map_err(config_error)?;

        Ok(Self {
            inner,
            source_path: path.map(Path::to_path_buf),
        })
    }

    /// Per-user configuration file location
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sketch-orchestrator").join("config.toml"))
    }

    /// File the settings were read from
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Returns true if the key is set in any layer
    pub fn contains(&self, key: &str) -> bool {
        self.inner.get::<config_rs::Value>(key).is_ok()
    }

    /// Gets a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.inner.get_string(key).map_err(|e| lookup_error(key, e))
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.inner.get_bool(key).map_err(|e| lookup_error(key, e))
    }

    /// Gets an unsigned 64-bit value
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        let value = self.inner.get_int(key).map_err(|e| lookup_error(key, e))?;
        u64::try_from(value)
            .map_err(|_| Error::Config(format!("'{}' must be non-negative, got {}", key, value)))
    }

    /// Gets a usize value
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        let value = self.get_u64(key)?;
        usize::try_from(value)
            .map_err(|_| Error::Config(format!("'{}' is out of range: {}", key, value)))
    }

    /// Gets an f64 value
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.inner.get_float(key).map_err(|e| lookup_error(key, e))
    }

    /// Gets an f32 value
    pub fn get_f32(&self, key: &str) -> Result<f32> {
        self.get_f64(key).map(|v| v as f32)
    }

    /// Gets a duration
    ///
    /// Integers are read as milliseconds; strings accept `ms`, `s` and `m` suffixes.
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        if let Ok(millis) = self.inner.get_int(key) {
            return u64::try_from(millis)
                .map(Duration::from_millis)
                .map_err(|_| Error::Config(format!("'{}' must be non-negative", key)));
        }

        let raw = self.get_string(key)?;
        parse_duration(&raw)
            .ok_or_else(|| Error::Config(format!("'{}' is not a duration: {}", key, raw)))
    }

    /// Gets a filesystem path
    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get_string(key).map(PathBuf::from)
    }
}

/// Parses `250ms`, `5s`, `2m` or a bare millisecond count
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(s) = raw.strip_suffix('s') {
        return s.trim().parse::<f64>().ok().filter(|v| *v >= 0.0).map(Duration::from_secs_f64);
    }
    if let Some(m) = raw.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 60));
    }
    raw.parse::<u64>().ok().map(Duration::from_millis)
}

fn config_error(e: config_rs::ConfigError) -> Error {
    Error::Config(e.to_string())
}

fn lookup_error(key: &str, e: config_rs::ConfigError) -> Error {
    debug!("Configuration key '{}' unavailable: {}", key, e);
    Error::Config(format!("'{}': {}", key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_present() {
        let config = ConfigManager::with_overrides(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.get_duration("router.timeout_ms").unwrap(), Duration::from_secs(30));
        assert_eq!(config.get_usize("queue.max_pending").unwrap(), 64);
        assert!(!config.get_bool("benchmark.on_startup").unwrap());
        assert_eq!(config.get_string("logging.format").unwrap(), "pretty");
    }

    #[test]
    fn test_overrides_win() {
        let config = ConfigManager::with_overrides([
            ("router.timeout_ms", "1500"),
            ("monitor.shrink_factor", "0.25"),
        ])
        .unwrap();
        assert_eq!(config.get_duration("router.timeout_ms").unwrap(), Duration::from_millis(1500));
        assert!((config.get_f64("monitor.shrink_factor").unwrap() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = ConfigManager::with_overrides(Vec::<(String, String)>::new()).unwrap();
        assert!(matches!(config.get_bool("probe.accelerated_gpu"), Err(Error::Config(_))));
        assert!(!config.contains("probe.accelerated_gpu"));
        assert!(config.contains("router.timeout_ms"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[router]\ntimeout_ms = 900\n[logging]\nlevel = \"debug\"").unwrap();

        let config = ConfigManager::from_file(file.path()).unwrap();
        assert_eq!(config.get_duration("router.timeout_ms").unwrap(), Duration::from_millis(900));
        assert_eq!(config.get_string("logging.level").unwrap(), "debug");
        assert_eq!(config.source_path(), Some(file.path()));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("3m"), Some(Duration::from_secs(180)));
        assert_eq!(parse_duration("40"), Some(Duration::from_millis(40)));
        assert_eq!(parse_duration("soon"), None);
    }
}
