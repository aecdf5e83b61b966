use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration, loaded from a TOML file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub ports: PortRangeConfig,

    #[serde(default)]
    pub spinlets: SpinletDefaults,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Host identifier recorded on every runtime record
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Host used when building a spinlet's service path (`host:port`)
    #[serde(default = "default_service_host")]
    pub service_host: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            service_host: default_service_host(),
        }
    }
}

/// Inclusive port range handed out to spinlets
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct PortRangeConfig {
    #[serde(default = "default_range_start")]
    pub range_start: u16,

    #[serde(default = "default_range_end")]
    pub range_end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
        }
    }
}

impl PortRangeConfig {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start,
            range_end,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.range_start && port <= self.range_end
    }

    pub fn len(&self) -> usize {
        if self.range_end < self.range_start {
            0
        } else {
            (self.range_end - self.range_start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle timings applied to every spinlet
#[derive(Debug, Deserialize, Clone)]
pub struct SpinletDefaults {
    /// Inactivity after which a running spinlet is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Max time to wait for a new spinlet to answer its readiness probe
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Readiness poll interval during startup in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Per-request timeout for a single readiness probe in milliseconds
    #[serde(default = "default_readiness_request_timeout")]
    pub readiness_request_timeout_ms: u64,

    /// Liveness watchdog interval
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Consecutive liveness failures before raising an unhealthy event
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// How long resource samples are kept in the store
    #[serde(default = "default_metrics_ttl")]
    pub metrics_ttl_secs: u64,

    /// Delay after start before orphaned spinlets are reconciled
    #[serde(default = "default_orphan_check_delay")]
    pub orphan_check_delay_secs: u64,
}

impl Default for SpinletDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            readiness_interval_ms: default_readiness_interval(),
            readiness_request_timeout_ms: default_readiness_request_timeout(),
            health_check_interval_secs: default_health_interval(),
            unhealthy_threshold: default_unhealthy_threshold(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            metrics_interval_secs: default_metrics_interval(),
            metrics_ttl_secs: default_metrics_ttl(),
            orphan_check_delay_secs: default_orphan_check_delay(),
        }
    }
}

impl SpinletDefaults {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn readiness_request_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_ttl_secs)
    }

    pub fn orphan_check_delay(&self) -> Duration {
        Duration::from_secs(self.orphan_check_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildSettings {
    /// Max builds running at once
    #[serde(default = "default_build_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Run the package manager install step before building
    #[serde(default = "default_true")]
    pub install_deps: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            concurrency: default_build_concurrency(),
            output_dir: default_output_dir(),
            install_deps: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite file, only used by the sqlite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How often expired keys are purged and published
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// Default value functions
fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_service_host() -> String {
    "localhost".to_string()
}

fn default_range_start() -> u16 {
    3000
}

fn default_range_end() -> u16 {
    4000
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_readiness_interval() -> u64 {
    100
}

fn default_readiness_request_timeout() -> u64 {
    1000
}

fn default_health_interval() -> u64 {
    10
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_metrics_interval() -> u64 {
    5
}

fn default_metrics_ttl() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_orphan_check_delay() -> u64 {
    5
}

fn default_build_concurrency() -> usize {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./builds")
}

fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./spinhost.db")
}

fn default_sweep_interval() -> u64 {
    250
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.range_start == 0 {
            errors.push("ports: 'range_start' must be greater than 0".to_string());
        }
        if self.ports.range_start > self.ports.range_end {
            errors.push(format!(
                "ports: 'range_start' ({}) must not exceed 'range_end' ({})",
                self.ports.range_start, self.ports.range_end
            ));
        }
        if self.spinlets.idle_timeout_secs == 0 {
            errors.push("spinlets: 'idle_timeout_secs' must be greater than 0".to_string());
        }
        if self.spinlets.readiness_interval_ms == 0 {
            errors.push("spinlets: 'readiness_interval_ms' must be greater than 0".to_string());
        }
        if self.spinlets.unhealthy_threshold == 0 {
            errors.push("spinlets: 'unhealthy_threshold' must be at least 1".to_string());
        }
        if self.spinlets.metrics_ttl_secs <= self.spinlets.idle_timeout_secs {
            errors.push("spinlets: 'metrics_ttl_secs' must exceed 'idle_timeout_secs'".to_string());
        }
        if self.build.concurrency == 0 {
            errors.push("build: 'concurrency' must be at least 1".to_string());
        }
        if self.store.sweep_interval_ms == 0 {
            errors.push("store: 'sweep_interval_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
