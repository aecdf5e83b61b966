//! Core spinlet types
//!
//! A [`LaunchSpec`] describes how to start a spinlet and is never mutated once
//! built. A [`RuntimeRecord`] tracks one running instance and is mirrored to
//! the resource store as a flat hash.

use crate::error::{Result, SpinError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a spinlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpinletState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SpinletState {
    /// Stopped and crashed records hold no resources
    pub fn is_terminal(&self) -> bool {
        matches!(self, SpinletState::Stopped | SpinletState::Crashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpinletState::Starting => "starting",
            SpinletState::Running => "running",
            SpinletState::Stopping => "stopping",
            SpinletState::Stopped => "stopped",
            SpinletState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SpinletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpinletState {
    type Err = SpinError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(SpinletState::Starting),
            "running" => Ok(SpinletState::Running),
            "stopping" => Ok(SpinletState::Stopping),
            "stopped" => Ok(SpinletState::Stopped),
            "crashed" => Ok(SpinletState::Crashed),
            // Older records used "idle" for a running spinlet with no traffic
            "idle" => Ok(SpinletState::Running),
            other => Err(SpinError::store(format!("unknown spinlet state '{}'", other))),
        }
    }
}

/// Why a spinlet was stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    Idle,
    OrphanedIdle,
    Shutdown,
    StartupFailed,
    /// Process exited cleanly on its own
    Exited,
    Crashed(String),
    Other(String),
}

impl StopReason {
    pub fn is_crash(&self) -> bool {
        matches!(self, StopReason::Crashed(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Manual => f.write_str("manual"),
            StopReason::Idle => f.write_str("idle"),
            StopReason::OrphanedIdle => f.write_str("orphaned-idle"),
            StopReason::Shutdown => f.write_str("shutdown"),
            StopReason::StartupFailed => f.write_str("startup-failed"),
            StopReason::Exited => f.write_str("exited"),
            StopReason::Crashed(detail) => write!(f, "crashed ({})", detail),
            StopReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// Framework tag used to pick build and launch strategies
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Framework {
    NextJs,
    Remix,
    Express,
    Node,
    NestJs,
    Static,
    React,
    Vue,
    Astro,
    Flutter,
    Docker,
    Custom,
    Other(String),
}

impl Framework {
    pub fn as_str(&self) -> &str {
        match self {
            Framework::NextJs => "nextjs",
            Framework::Remix => "remix",
            Framework::Express => "express",
            Framework::Node => "node",
            Framework::NestJs => "nestjs",
            Framework::Static => "static",
            Framework::React => "react",
            Framework::Vue => "vue",
            Framework::Astro => "astro",
            Framework::Flutter => "flutter",
            Framework::Docker => "docker",
            Framework::Custom => "custom",
            Framework::Other(name) => name,
        }
    }

    /// Node-based frameworks take a V8 heap limit
    pub fn is_node(&self) -> bool {
        matches!(
            self,
            Framework::NextJs
                | Framework::Remix
                | Framework::Express
                | Framework::Node
                | Framework::NestJs
                | Framework::Custom
        )
    }
}

impl From<&str> for Framework {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "nextjs" | "next" => Framework::NextJs,
            "remix" => Framework::Remix,
            "express" => Framework::Express,
            "node" => Framework::Node,
            "nestjs" => Framework::NestJs,
            "static" => Framework::Static,
            "react" => Framework::React,
            "vue" => Framework::Vue,
            "astro" => Framework::Astro,
            "flutter" => Framework::Flutter,
            "docker" => Framework::Docker,
            "custom" => Framework::Custom,
            other => Framework::Other(other.to_string()),
        }
    }
}

impl From<String> for Framework {
    fn from(s: String) -> Self {
        Framework::from(s.as_str())
    }
}

impl From<Framework> for String {
    fn from(f: Framework) -> Self {
        f.as_str().to_string()
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Development,
    #[default]
    Production,
}

impl DeploymentMode {
    pub fn node_env(&self) -> &'static str {
        match self {
            DeploymentMode::Development => "development",
            DeploymentMode::Production => "production",
        }
    }
}

/// Memory and CPU limits as written by users, e.g. `512MB` and `0.5`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory: Option<String>,
    pub cpu: Option<String>,
}

impl ResourceLimits {
    /// Memory limit in megabytes, if one is set
    pub fn memory_mb(&self) -> Result<Option<u64>> {
        self.memory.as_deref().map(parse_memory_mb).transpose()
    }
}

/// Parse `<n>MB` or `<n>GB` (case-insensitive) into megabytes
pub fn parse_memory_mb(spec: &str) -> Result<u64> {
    let invalid = || SpinError::InvalidMemorySpec(spec.to_string());
    let upper = spec.trim().to_ascii_uppercase();

    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("MB") {
        (n, 1)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024)
    } else {
        return Err(invalid());
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Immutable description of how to launch a spinlet
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub tenant_id: String,
    pub spinlet_id: String,
    pub artifact_path: PathBuf,
    pub framework: Framework,
    /// Fixed port instead of one from the pool
    pub port: Option<u16>,
    pub env: HashMap<String, String>,
    pub resources: ResourceLimits,
    pub domains: Vec<String>,
    pub mode: DeploymentMode,
}

impl LaunchSpec {
    pub fn new(
        tenant_id: impl Into<String>,
        spinlet_id: impl Into<String>,
        artifact_path: impl Into<PathBuf>,
        framework: Framework,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            spinlet_id: spinlet_id.into(),
            artifact_path: artifact_path.into(),
            framework,
            port: None,
            env: HashMap::new(),
            resources: ResourceLimits::default(),
            domains: Vec::new(),
            mode: DeploymentMode::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }
}

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Runtime state of one spinlet, owned by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub spinlet_id: String,
    pub tenant_id: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub state: SpinletState,
    /// Epoch milliseconds
    pub start_time: i64,
    /// Epoch milliseconds
    pub last_access: i64,
    pub requests: u64,
    pub errors: u64,
    /// Resident memory in bytes
    pub memory: u64,
    /// CPU percentage
    pub cpu: f64,
    pub host: String,
    pub service_path: String,
    pub domains: Vec<String>,
    pub framework: Framework,
}

impl RuntimeRecord {
    pub fn is_running(&self) -> bool {
        self.state == SpinletState::Running
    }

    /// Milliseconds since the last recorded access
    pub fn idle_for_ms(&self, now: i64) -> i64 {
        (now - self.last_access).max(0)
    }

    /// Flatten into hash fields for the resource store
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let domains = serde_json::to_string(&self.domains).unwrap_or_else(|_| "[]".to_string());
        vec![
            ("spinletId".into(), self.spinlet_id.clone()),
            ("tenantId".into(), self.tenant_id.clone()),
            ("pid".into(), self.pid.map(|p| p.to_string()).unwrap_or_default()),
            ("port".into(), self.port.to_string()),
            ("state".into(), self.state.to_string()),
            ("startTime".into(), self.start_time.to_string()),
            ("lastAccess".into(), self.last_access.to_string()),
            ("requests".into(), self.requests.to_string()),
            ("errors".into(), self.errors.to_string()),
            ("memory".into(), self.memory.to_string()),
            ("cpu".into(), self.cpu.to_string()),
            ("host".into(), self.host.clone()),
            ("servicePath".into(), self.service_path.clone()),
            ("domains".into(), domains),
            ("framework".into(), self.framework.to_string()),
        ]
    }

    /// Rebuild a record from its stored hash fields
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let required = |name: &str| {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SpinError::store(format!("runtime record missing '{}'", name)))
        };
        fn number<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
            match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| SpinError::store(format!("invalid '{}' value '{}'", name, raw))),
                None => "0"
                    .parse()
                    .map_err(|_| SpinError::store(format!("invalid '{}'", name))),
            }
        }

        let spinlet_id = required("spinletId")?.clone();
        let port: u16 = required("port")?
            .parse()
            .map_err(|_| SpinError::store("runtime record has invalid port"))?;
        let state: SpinletState = required("state")?.parse()?;
        let domains = match fields.get("domains").filter(|d| !d.is_empty()) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        let pid = fields.get("pid").and_then(|p| p.parse().ok());
        let service_path = fields
            .get("servicePath")
            .filter(|p| !p.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("localhost:{}", port));

        Ok(Self {
            spinlet_id,
            tenant_id: fields.get("tenantId").cloned().unwrap_or_default(),
            pid,
            port,
            state,
            start_time: number(fields, "startTime")?,
            last_access: number(fields, "lastAccess")?,
            requests: number(fields, "requests")?,
            errors: number(fields, "errors")?,
            memory: number(fields, "memory")?,
            cpu: number(fields, "cpu")?,
            host: fields.get("host").cloned().unwrap_or_default(),
            service_path,
            domains,
            framework: fields
                .get("framework")
                .map(|f| Framework::from(f.as_str()))
                .unwrap_or(Framework::Custom),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RuntimeRecord {
        RuntimeRecord {
            spinlet_id: "spin-1".into(),
            tenant_id: "acme".into(),
            pid: Some(4242),
            port: 3005,
            state: SpinletState::Running,
            start_time: 1_700_000_000_000,
            last_access: 1_700_000_060_000,
            requests: 12,
            errors: 1,
            memory: 52_428_800,
            cpu: 3.5,
            host: "node-1".into(),
            service_path: "localhost:3005".into(),
            domains: vec!["acme.test".into(), "www.acme.test".into()],
            framework: Framework::NextJs,
        }
    }

    #[test]
    fn test_parse_memory_spec() {
        assert_eq!(parse_memory_mb("512MB").unwrap(), 512);
        assert_eq!(parse_memory_mb("2GB").unwrap(), 2048);
        assert_eq!(parse_memory_mb("256mb").unwrap(), 256);
        assert_eq!(parse_memory_mb("1gb").unwrap(), 1024);
    }

    #[test]
    fn test_parse_memory_spec_rejects_garbage() {
        for bad in ["12XB", "MB", "512", "1.5GB", "-1MB", "", "5 MB"] {
            let err = parse_memory_mb(bad).unwrap_err();
            assert!(
                matches!(err, SpinError::InvalidMemorySpec(ref s) if s == bad),
                "expected InvalidMemorySpec for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_resource_limits_memory_optional() {
        assert_eq!(ResourceLimits::default().memory_mb().unwrap(), None);
        let limits = ResourceLimits {
            memory: Some("1GB".into()),
            cpu: None,
        };
        assert_eq!(limits.memory_mb().unwrap(), Some(1024));
    }

    #[test]
    fn test_state_terminal() {
        assert!(SpinletState::Stopped.is_terminal());
        assert!(SpinletState::Crashed.is_terminal());
        assert!(!SpinletState::Running.is_terminal());
        assert!(!SpinletState::Stopping.is_terminal());
        assert_eq!("idle".parse::<SpinletState>().unwrap(), SpinletState::Running);
        assert!("zombie".parse::<SpinletState>().is_err());
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::OrphanedIdle.to_string(), "orphaned-idle");
        assert_eq!(StopReason::Idle.to_string(), "idle");
        assert_eq!(
            StopReason::Crashed("exit code 1".into()).to_string(),
            "crashed (exit code 1)"
        );
        assert!(StopReason::Crashed("x".into()).is_crash());
        assert!(!StopReason::Exited.is_crash());
    }

    #[test]
    fn test_framework_tags() {
        assert_eq!(Framework::from("nextjs"), Framework::NextJs);
        assert_eq!(Framework::from("Next"), Framework::NextJs);
        assert_eq!(Framework::from("reverse-proxy"), Framework::Other("reverse-proxy".into()));
        assert_eq!(Framework::Other("deno".into()).to_string(), "deno");
        assert!(Framework::Express.is_node());
        assert!(!Framework::Static.is_node());

        let json = serde_json::to_string(&Framework::Remix).unwrap();
        assert_eq!(json, "\"remix\"");
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("acme", "spin-1", "/builds/spin-1", Framework::Express)
            .with_port(3100)
            .with_env("API_URL", "http://api")
            .with_domains(["acme.test"])
            .with_mode(DeploymentMode::Development);

        assert_eq!(spec.port, Some(3100));
        assert_eq!(spec.env.get("API_URL").map(String::as_str), Some("http://api"));
        assert_eq!(spec.domains, vec!["acme.test".to_string()]);
        assert_eq!(spec.mode.node_env(), "development");
    }

    #[test]
    fn test_record_fields_roundtrip() {
        let record = sample_record();
        let fields: HashMap<String, String> = record.to_fields().into_iter().collect();
        assert_eq!(fields["domains"], r#"["acme.test","www.acme.test"]"#);
        assert_eq!(fields["state"], "running");

        let decoded = RuntimeRecord::from_fields(&fields).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_from_sparse_fields() {
        let mut fields = HashMap::new();
        fields.insert("spinletId".to_string(), "legacy".to_string());
        fields.insert("port".to_string(), "3001".to_string());
        fields.insert("state".to_string(), "stopped".to_string());

        let record = RuntimeRecord::from_fields(&fields).unwrap();
        assert_eq!(record.service_path, "localhost:3001");
        assert_eq!(record.pid, None);
        assert!(record.domains.is_empty());
        assert_eq!(record.requests, 0);
    }

    #[test]
    fn test_record_missing_port_is_error() {
        let mut fields = HashMap::new();
        fields.insert("spinletId".to_string(), "broken".to_string());
        fields.insert("state".to_string(), "running".to_string());
        assert!(RuntimeRecord::from_fields(&fields).is_err());
    }

    #[test]
    fn test_idle_for() {
        let record = sample_record();
        assert_eq!(record.idle_for_ms(record.last_access + 5_000), 5_000);
        assert_eq!(record.idle_for_ms(record.last_access - 5_000), 0);
    }
}
