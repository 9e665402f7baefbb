//! Settings object passed to the service at init.
//!
//! Follows `commy::config::CommyConfig`'s pattern of a single struct with
//! serde derives, a `Default` impl, and a builder — populated here from
//! environment variables rather than a CLI, since argument parsing is an
//! out-of-scope external collaborator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::record::ResumeMode;

/// Top-level settings for one run of the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the stream mux listens on (loopback TCP).
    pub bind_address: String,
    pub listen_port: u16,

    /// Directory the run's artifacts (transaction log, config.yaml,
    /// output.log, wandb-*.jsonl) are written under.
    pub run_dir: PathBuf,

    /// File name for the transaction log within `run_dir`.
    pub sync_file_name: String,

    /// Backend base URL for GraphQL and file-stream REST calls.
    pub base_url: String,

    /// API key used for the Authorization header. Falls back to
    /// `WANDB_API_KEY` if not set explicitly.
    pub api_key: Option<String>,

    /// Cache directory for history replay, from `WANDB_CACHE_DIR`.
    pub cache_dir: Option<PathBuf>,

    pub resume: ResumeSettings,
    pub transport: TransportSettings,
    pub watcher: WatcherSettings,
    pub debounce: DebounceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSettings {
    pub mode: ResumeMode,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            mode: ResumeMode::Allow,
        }
    }
}

/// Transport-layer tunables for the rate-limited HTTP client (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub initial_requests_per_sec: f64,
    pub burst: u32,
    pub min_requests_per_sec: f64,
    pub max_requests_per_sec: f64,
    pub target_units_per_sec: f64,
    pub smoothing: f64,
    pub min_window_requests: u32,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            initial_requests_per_sec: 100.0,
            burst: 20,
            min_requests_per_sec: 1.0,
            max_requests_per_sec: 1000.0,
            target_units_per_sec: 1.0,
            smoothing: 0.2,
            min_window_requests: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// File-watcher tunables (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSettings {
    #[serde(with = "duration_millis")]
    pub polling_period: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            polling_period: Duration::from_millis(500),
        }
    }
}

/// Config-upsert debouncer tunables (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceSettings {
    pub requests_per_sec: f64,
    pub burst: u32,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            requests_per_sec: 1.0 / 30.0,
            burst: 1,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            listen_port: 0,
            run_dir: PathBuf::from("./run"),
            sync_file_name: "run.runlog".to_string(),
            base_url: "https://api.example.com".to_string(),
            api_key: None,
            cache_dir: None,
            resume: ResumeSettings::default(),
            transport: TransportSettings::default(),
            watcher: WatcherSettings::default(),
            debounce: DebounceSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Build a builder seeded with defaults.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Overlay values sourced from the environment, following the
    /// `WANDB_API_KEY` fallback / `WANDB_CACHE_DIR` contract in §6.
    pub fn apply_env(mut self) -> Self {
        if self.api_key.is_none() {
            if let Ok(key) = std::env::var("WANDB_API_KEY") {
                self.api_key = Some(key);
            }
        }
        if self.cache_dir.is_none() {
            if let Ok(dir) = std::env::var("WANDB_CACHE_DIR") {
                self.cache_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }

    pub fn transaction_log_path(&self) -> PathBuf {
        self.run_dir.join(&self.sync_file_name)
    }

    pub fn config_yaml_path(&self) -> PathBuf {
        self.run_dir.join("config.yaml")
    }

    pub fn output_log_path(&self) -> PathBuf {
        self.run_dir.join("output.log")
    }
}

#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    inner: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.inner.bind_address = addr.into();
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.inner.listen_port = port;
        self
    }

    pub fn run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.run_dir = dir.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.inner.base_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.inner.api_key = Some(key.into());
        self
    }

    pub fn resume_mode(mut self, mode: ResumeMode) -> Self {
        self.inner.resume.mode = mode;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.inner
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ServiceConfig::builder()
            .listen_port(4242)
            .run_dir("/tmp/run-1")
            .resume_mode(ResumeMode::Must)
            .build();
        assert_eq!(cfg.listen_port, 4242);
        assert_eq!(cfg.run_dir, PathBuf::from("/tmp/run-1"));
        assert_eq!(cfg.resume.mode, ResumeMode::Must);
        assert_eq!(cfg.transport.initial_requests_per_sec, 100.0);
    }

    #[test]
    fn env_fallback_only_applies_when_unset() {
        std::env::set_var("WANDB_API_KEY", "from-env");
        let cfg = ServiceConfig::default().apply_env();
        assert_eq!(cfg.api_key.as_deref(), Some("from-env"));

        let explicit = ServiceConfig::builder()
            .api_key("explicit")
            .build()
            .apply_env();
        assert_eq!(explicit.api_key.as_deref(), Some("explicit"));
        std::env::remove_var("WANDB_API_KEY");
    }
}
