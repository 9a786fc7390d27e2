//! Runtime settings read from `KEEL_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Namespace owned objects live in.
    pub namespace: String,
    pub db_path: String,
    /// Attempts before a resource is marked failed.
    pub retry_threshold: u32,
    pub callback_timeout_ms: u64,
    pub field_manager: String,
    /// `tracing` filter directives.
    pub log_filter: String,
    /// Prometheus exporter `host:port`; no exporter when unset.
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            db_path: default_db_path(),
            retry_threshold: 3,
            callback_timeout_ms: 1000,
            field_manager: "keel".to_string(),
            log_filter: "info".to_string(),
            metrics_addr: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            namespace: std::env::var("KEEL_NAMESPACE").ok().filter(|s| !s.is_empty()).unwrap_or(d.namespace),
            db_path: std::env::var("KEEL_DB_PATH").ok().filter(|s| !s.is_empty()).unwrap_or(d.db_path),
            retry_threshold: env_parse("KEEL_RETRY_THRESHOLD").filter(|v: &u32| *v > 0).unwrap_or(d.retry_threshold),
            callback_timeout_ms: env_parse("KEEL_CALLBACK_TIMEOUT_MS").unwrap_or(d.callback_timeout_ms),
            field_manager: std::env::var("KEEL_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
            log_filter: std::env::var("KEEL_LOG").ok().filter(|s| !s.is_empty()).unwrap_or(d.log_filter),
            metrics_addr: std::env::var("KEEL_METRICS_ADDR").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.namespace, "default");
        assert_eq!(s.retry_threshold, 3);
        assert_eq!(s.callback_timeout(), Duration::from_secs(1));
        assert!(s.db_path.ends_with("keel.db"));
        assert_eq!(s.log_filter, "info");
        assert_eq!(s.metrics_addr, None);
    }
}
