//! Configuration for the stellwerk scheduling subsystem.
//!
//! Parsed from `stellwerk.toml` with support for environment variable
//! overrides. Every field has a default, so an empty file (or no file at
//! all) yields a working configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StellwerkError;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for the scheduling subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StellwerkConfig {
    /// Priority scheduler cycle limits.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Worker unit dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Resource pool retention settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Memoization cache capacity settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Metrics reporting settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Scheduler section: how much work a single cycle may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum non-critical items executed per cycle. Critical items
    /// are always drained in full and do not count against this.
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,

    /// Wall-clock budget per cycle in milliseconds, checked after each
    /// non-critical item.
    #[serde(default = "default_frame_budget_ms")]
    pub frame_budget_ms: u64,
}

fn default_event_batch_size() -> usize {
    64
}

fn default_frame_budget_ms() -> u64 {
    8
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_batch_size: default_event_batch_size(),
            frame_budget_ms: default_frame_budget_ms(),
        }
    }
}

impl SchedulerConfig {
    /// The cycle budget as a [`Duration`].
    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(self.frame_budget_ms)
    }
}

/// Dispatch section: the worker unit set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of worker units to spawn. 0 = number of available cores.
    #[serde(default)]
    pub worker_count: usize,
}

impl DispatchConfig {
    /// Resolve `worker_count`, mapping 0 to the available parallelism.
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_count
        }
    }
}

/// Pool section: retention cap shared by pools built from this config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum free objects a pool retains; releases past this discard
    /// the object. 0 means pools never retain anything.
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
}

fn default_pool_max_size() -> usize {
    256
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
        }
    }
}

/// Cache section: capacity shared by memoization caches built from this
/// config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries per cache; inserting past this evicts the
    /// oldest-inserted entry.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_max_entries() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Metrics section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Seconds between background snapshot reports. 0 disables the
    /// report task.
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_report_interval_secs() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl MetricsConfig {
    /// Report period, or `None` when reporting is disabled.
    pub fn report_interval(&self) -> Option<Duration> {
        if self.report_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.report_interval_secs))
        }
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl StellwerkConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, StellwerkError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StellwerkError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `STELLWERK_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `STELLWERK_SCHEDULER_EVENT_BATCH_SIZE` → `scheduler.event_batch_size`
    /// - `STELLWERK_SCHEDULER_FRAME_BUDGET_MS` → `scheduler.frame_budget_ms`
    /// - `STELLWERK_DISPATCH_WORKER_COUNT` → `dispatch.worker_count`
    /// - `STELLWERK_POOL_MAX_SIZE` → `pool.max_size`
    /// - `STELLWERK_CACHE_MAX_ENTRIES` → `cache.max_entries`
    /// - `STELLWERK_METRICS_REPORT_INTERVAL_SECS` → `metrics.report_interval_secs`
    ///
    /// A set-but-unparsable value is a config error rather than being
    /// silently ignored.
    fn apply_env_overrides(&mut self) -> Result<(), StellwerkError> {
        if let Some(v) = env_parse("STELLWERK_SCHEDULER_EVENT_BATCH_SIZE")? {
            self.scheduler.event_batch_size = v;
        }
        if let Some(v) = env_parse("STELLWERK_SCHEDULER_FRAME_BUDGET_MS")? {
            self.scheduler.frame_budget_ms = v;
        }
        if let Some(v) = env_parse("STELLWERK_DISPATCH_WORKER_COUNT")? {
            self.dispatch.worker_count = v;
        }
        if let Some(v) = env_parse("STELLWERK_POOL_MAX_SIZE")? {
            self.pool.max_size = v;
        }
        if let Some(v) = env_parse("STELLWERK_CACHE_MAX_ENTRIES")? {
            self.cache.max_entries = v;
        }
        if let Some(v) = env_parse("STELLWERK_METRICS_REPORT_INTERVAL_SECS")? {
            self.metrics.report_interval_secs = v;
        }
        Ok(())
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate limits that must be nonzero for the subsystem to make
    /// progress.
    ///
    /// `pool.max_size == 0` (never retain) and `dispatch.worker_count == 0`
    /// (auto) are deliberate, legal settings.
    pub fn validate(&self) -> Result<(), StellwerkError> {
        if self.scheduler.event_batch_size == 0 {
            return Err(StellwerkError::Config(
                "scheduler.event_batch_size must be at least 1".into(),
            ));
        }
        if self.scheduler.frame_budget_ms == 0 {
            return Err(StellwerkError::Config(
                "scheduler.frame_budget_ms must be at least 1".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(StellwerkError::Config(
                "cache.max_entries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Read and parse one environment variable, `None` when unset.
fn env_parse<T>(name: &str) -> Result<Option<T>, StellwerkError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| StellwerkError::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = StellwerkConfig::from_toml("").unwrap();
        assert_eq!(cfg.scheduler.event_batch_size, 64);
        assert_eq!(cfg.scheduler.frame_budget_ms, 8);
        assert_eq!(cfg.dispatch.worker_count, 0);
        assert_eq!(cfg.pool.max_size, 256);
        assert_eq!(cfg.cache.max_entries, 1024);
        assert_eq!(cfg.metrics.report_interval_secs, 60);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[scheduler]
event_batch_size = 16
frame_budget_ms = 4

[dispatch]
worker_count = 3

[pool]
max_size = 32

[cache]
max_entries = 100

[metrics]
report_interval_secs = 5
"#;
        let cfg = StellwerkConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.scheduler.event_batch_size, 16);
        assert_eq!(cfg.scheduler.frame_budget(), Duration::from_millis(4));
        assert_eq!(cfg.dispatch.worker_count, 3);
        assert_eq!(cfg.pool.max_size, 32);
        assert_eq!(cfg.cache.max_entries, 100);
        assert_eq!(
            cfg.metrics.report_interval(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml = r#"
[scheduler]
frame_budget_ms = 2
"#;
        let cfg = StellwerkConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.scheduler.frame_budget_ms, 2);
        assert_eq!(cfg.scheduler.event_batch_size, 64); // default
    }

    #[test]
    fn reject_zero_batch_size() {
        let toml = "[scheduler]\nevent_batch_size = 0\n";
        let err = StellwerkConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("event_batch_size"));
    }

    #[test]
    fn reject_zero_frame_budget() {
        let toml = "[scheduler]\nframe_budget_ms = 0\n";
        let err = StellwerkConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("frame_budget_ms"));
    }

    #[test]
    fn reject_zero_cache_entries() {
        let toml = "[cache]\nmax_entries = 0\n";
        let err = StellwerkConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("max_entries"));
    }

    #[test]
    fn zero_pool_max_is_legal() {
        let toml = "[pool]\nmax_size = 0\n";
        let cfg = StellwerkConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.pool.max_size, 0);
    }

    #[test]
    fn zero_report_interval_disables_reporting() {
        let toml = "[metrics]\nreport_interval_secs = 0\n";
        let cfg = StellwerkConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.metrics.report_interval(), None);
    }

    #[test]
    fn worker_count_zero_resolves_to_cores() {
        let cfg = DispatchConfig { worker_count: 0 };
        assert!(cfg.resolved_worker_count() >= 1);

        let cfg = DispatchConfig { worker_count: 3 };
        assert_eq!(cfg.resolved_worker_count(), 3);
    }

    #[test]
    fn env_override_frame_budget() {
        // SAFETY: test-only, nextest runs each test in its own process
        unsafe {
            std::env::set_var("STELLWERK_SCHEDULER_FRAME_BUDGET_MS", "3");
        }
        let cfg = StellwerkConfig::from_toml("[scheduler]\nframe_budget_ms = 10\n").unwrap();
        assert_eq!(cfg.scheduler.frame_budget_ms, 3);
        unsafe {
            std::env::remove_var("STELLWERK_SCHEDULER_FRAME_BUDGET_MS");
        }
    }

    #[test]
    fn env_override_invalid_value_is_an_error() {
        // SAFETY: test-only, nextest runs each test in its own process
        unsafe {
            std::env::set_var("STELLWERK_POOL_MAX_SIZE", "lots");
        }
        let err = StellwerkConfig::from_toml("").unwrap_err();
        assert!(err.to_string().contains("STELLWERK_POOL_MAX_SIZE"));
        unsafe {
            std::env::remove_var("STELLWERK_POOL_MAX_SIZE");
        }
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stellwerk.toml");
        std::fs::write(&path, "[dispatch]\nworker_count = 2\n").unwrap();

        let cfg = StellwerkConfig::from_file(&path).unwrap();
        assert_eq!(cfg.dispatch.worker_count, 2);
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let err = StellwerkConfig::from_file("/nonexistent/stellwerk.toml").unwrap_err();
        assert!(matches!(err, StellwerkError::ConfigIo(_)));
    }
}
