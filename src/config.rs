//! Engine configuration.
//!
//! Every component carries its own config struct with production defaults;
//! [`EngineConfig`] aggregates them and can be loaded from a TOML file by
//! embedding applications.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Result cache limits and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum total size of cached values in bytes.
    pub max_bytes: u64,
    /// Time-to-live for a cached result.
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
    /// Run the periodic expiry sweep.
    pub auto_cleanup: bool,
    /// Interval between expiry sweeps.
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_bytes: 10 * 1024 * 1024,
            ttl: Duration::from_secs(30 * 60),
            auto_cleanup: true,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Worker pool sizing and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Workers pre-spawned at startup.
    pub initial_workers: usize,
    /// Hard cap on live workers.
    pub max_workers: usize,
    /// Per-request timeout.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Idle time after which a worker is reaped (never the last one).
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    /// Errors tolerated before a worker is replaced.
    pub error_threshold: u64,
    /// Interval of the reap/timeout maintenance tick.
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            initial_workers: 2,
            max_workers: 4,
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5 * 60),
            error_threshold: 5,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Behaviour analyzer windows and capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Bounded ring of input events.
    pub ring_capacity: usize,
    /// Window for the input-frequency metric.
    #[serde(with = "duration_serde")]
    pub analysis_window: Duration,
    /// Inactivity after which the rolling session is closed.
    #[serde(with = "duration_serde")]
    pub session_timeout: Duration,
    /// Interval of the metric recomputation tick.
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1000,
            analysis_window: Duration::from_secs(30),
            session_timeout: Duration::from_secs(5 * 60),
            tick_interval: Duration::from_secs(5),
        }
    }
}

/// Aggregate configuration of the realtime engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: WorkerPoolConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing sections fall back to
    /// their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
