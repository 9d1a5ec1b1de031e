//! Platform capability interface
//!
//! The loader never touches environment variables, locale or CPU topology
//! directly; it asks a [`Platform`] implementation instead.

use std::collections::HashMap;

/// Host capabilities consumed by the loader
pub trait Platform: Send + Sync {
    /// Read an environment variable
    fn env_var(&self, key: &str) -> Option<String>;

    /// Number of logical CPUs
    fn cpu_count(&self) -> usize;

    /// Current locale identifier (e.g. "en-US")
    fn locale(&self) -> String;
}

/// Platform backed by the running process
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn locale(&self) -> String {
        ["LC_ALL", "LANG"]
            .iter()
            .find_map(|key| std::env::var(key).ok())
            .and_then(|raw| raw.split('.').next().map(|s| s.replace('_', "-")))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "en-US".to_string())
    }
}

/// Deterministic platform for tests and tools
#[derive(Debug, Clone)]
pub struct FixedPlatform {
    cpus: usize,
    locale: String,
    env: HashMap<String, String>,
}

impl FixedPlatform {
    /// Create a platform reporting `cpus` logical CPUs
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            locale: "en-US".to_string(),
            env: HashMap::new(),
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Override the locale
    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = locale.to_string();
        self
    }
}

impl Platform for FixedPlatform {
    fn env_var(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn locale(&self) -> String {
        self.locale.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_platform() {
        let platform = HostPlatform;
        assert!(platform.cpu_count() >= 1);
        assert!(!platform.locale().is_empty());
    }

    #[test]
    fn test_fixed_platform() {
        let platform = FixedPlatform::new(4).with_env("A", "b").with_locale("de-DE");
        assert_eq!(platform.cpu_count(), 4);
        assert_eq!(platform.env_var("A").as_deref(), Some("b"));
        assert_eq!(platform.env_var("missing"), None);
        assert_eq!(platform.locale(), "de-DE");
    }
}
