//! Configuration system for oxidized-pak

use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable forcing the cooperative single-threaded mode
pub const ENV_SINGLE_THREAD: &str = "OXIDIZED_PAK_SINGLE_THREAD";

/// Environment variable overriding the number of I/O workers
pub const ENV_IO_WORKERS: &str = "OXIDIZED_PAK_IO_WORKERS";

/// Upper bound for the automatically chosen I/O worker count
pub const MAX_AUTO_IO_WORKERS: usize = 8;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub scheduler: SchedulerConfig,
    pub precache: PrecacheConfig,
    pub paths: PathConfig,
    pub debug: DebugConfig,
}

/// General loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Run the loading thread on a dedicated OS thread
    pub multithreaded: bool,
    /// Number of I/O worker threads (0 = derive from CPU count)
    pub io_workers: usize,
    /// Build an object cluster for every completed package
    pub create_clusters: bool,
}

/// Tick loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time budget of one loading-thread tick
    pub tick_budget_ms: u64,
    /// Time budget for postload/finalize work on the owning thread
    pub finalize_budget_ms: u64,
    /// How long an idle loading thread sleeps waiting for I/O
    pub idle_wait_ms: u64,
    /// Walk the graph and report the wait chain on a stall
    pub diagnose_stalls: bool,
}

/// Precache coalescing and throttling thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrecacheConfig {
    /// Minimum size of any archive read
    pub min_read_size: u64,
    /// Largest merged export read
    pub max_merged_bytes: u64,
    /// Largest hole allowed between two merged export ranges
    pub max_gap_bytes: u64,
    /// Most exports satisfied by one merged read
    pub max_exports_per_read: usize,
    /// Budget for bytes in flight plus resident unconsumed blocks
    pub memory_budget_bytes: u64,
}

/// Content path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub content_root: PathBuf,
    pub header_extension: String,
    pub body_extension: String,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            multithreaded: true,
            io_workers: 0,
            create_clusters: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: 5,
            finalize_budget_ms: 5,
            idle_wait_ms: 10,
            diagnose_stalls: true,
        }
    }
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            min_read_size: 64 * 1024,
            max_merged_bytes: 1024 * 1024,
            max_gap_bytes: 32 * 1024,
            max_exports_per_read: 64,
            memory_budget_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("content"),
            header_extension: "pak".to_string(),
            body_extension: "pakb".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-pak.log"),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    pub fn finalize_budget(&self) -> Duration {
        Duration::from_millis(self.finalize_budget_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path();

        if path.exists() {
            Self::from_file(&path)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-pak")
            .join("config.toml")
    }

    /// Apply environment overrides read through the platform layer
    pub fn apply_env_overrides(&mut self, platform: &dyn Platform) {
        if let Some(value) = platform.env_var(ENV_SINGLE_THREAD) {
            if value == "1" || value.eq_ignore_ascii_case("true") {
                tracing::info!("{} set, loading on the owning thread", ENV_SINGLE_THREAD);
                self.general.multithreaded = false;
            }
        }

        if let Some(value) = platform.env_var(ENV_IO_WORKERS) {
            match value.parse::<usize>() {
                Ok(workers) => self.general.io_workers = workers,
                Err(_) => tracing::warn!("Ignoring invalid {}={}", ENV_IO_WORKERS, value),
            }
        }
    }

    /// Resolve the effective number of I/O worker threads
    pub fn io_worker_count(&self, platform: &dyn Platform) -> usize {
        if self.general.io_workers > 0 {
            return self.general.io_workers;
        }
        (platform.cpu_count() / 2).clamp(1, MAX_AUTO_IO_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FixedPlatform;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.multithreaded);
        assert_eq!(config.general.io_workers, 0);
        assert_eq!(config.precache.min_read_size, 64 * 1024);
        assert_eq!(config.paths.header_extension, "pak");
        assert_eq!(config.scheduler.tick_budget(), Duration::from_millis(5));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.precache, config.precache);
        assert_eq!(parsed.general.multithreaded, config.general.multithreaded);
    }

    #[test]
    fn test_partial_config() {
        let parsed: Config = toml::from_str("[precache]\nmax_gap_bytes = 7\n").unwrap();
        assert_eq!(parsed.precache.max_gap_bytes, 7);
        assert_eq!(parsed.precache.max_exports_per_read, 64);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general]\nmultithreaded = false\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(!config.general.multithreaded);
    }

    #[test]
    fn test_env_overrides() {
        let platform = FixedPlatform::new(16)
            .with_env(ENV_SINGLE_THREAD, "1")
            .with_env(ENV_IO_WORKERS, "3");
        let mut config = Config::default();
        config.apply_env_overrides(&platform);
        assert!(!config.general.multithreaded);
        assert_eq!(config.io_worker_count(&platform), 3);
    }

    #[test]
    fn test_io_worker_count_from_cpus() {
        let config = Config::default();
        assert_eq!(config.io_worker_count(&FixedPlatform::new(1)), 1);
        assert_eq!(config.io_worker_count(&FixedPlatform::new(8)), 4);
        assert_eq!(config.io_worker_count(&FixedPlatform::new(64)), MAX_AUTO_IO_WORKERS);
    }
}
