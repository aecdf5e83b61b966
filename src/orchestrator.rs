//! Spinlet orchestrator
//!
//! Owns the lifecycle of every spinlet on this host:
//! `starting -> running -> stopping -> stopped`, with `crashed` reachable on an
//! abnormal exit. The in-memory maps are a cache over the resource store; any
//! record missing locally is rehydrated from the store before acting on it.
//!
//! Idle eviction is driven by store key expiry: every access re-arms a
//! per-spinlet TTL key and an expiry notification for that key stops the
//! spinlet. `stop` and `cleanup` are idempotent, so duplicate notifications
//! and racing callers are harmless.

use crate::config::{Config, PortRangeConfig};
use crate::error::{Result, SpinError};
use crate::events::{EventBus, LogStream, SpinletEvent};
use crate::health::{HealthCheckConfig, HealthProber, LivenessCheck, PidLiveness};
use crate::launcher::{self, LocalLauncher, ProcessControl, ProcessExit, ProcessHandle, ProcessLauncher, ProcessSignal};
use crate::ports::PortAllocator;
use crate::probe::{self, HttpProbe, ReadinessProbe};
use crate::spinlet::{now_ms, LaunchSpec, RuntimeRecord, SpinletState, StopReason};
use crate::store::{keys, KeyTtl, ResourceStore};
use crate::ticker::{self, spawn_periodic};
use crate::usage::{ProcSampler, UsageSampler};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Spinlets whose idle timer has less than this left count as about to expire
const ABOUT_TO_EXPIRE: Duration = Duration::from_secs(60);

/// Extra wait for a process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Lifecycle timings and host identity used by the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub hostname: String,
    pub service_host: String,
    pub ports: PortRangeConfig,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub readiness_interval: Duration,
    pub readiness_request_timeout: Duration,
    pub shutdown_grace_period: Duration,
    pub metrics_interval: Duration,
    pub metrics_ttl: Duration,
    pub orphan_check_delay: Duration,
    pub sweep_interval: Duration,
    pub health: HealthCheckConfig,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        let spinlets = &config.spinlets;
        Self {
            hostname: config.host.hostname.clone(),
            service_host: config.host.service_host.clone(),
            ports: config.ports,
            idle_timeout: spinlets.idle_timeout(),
            startup_timeout: spinlets.startup_timeout(),
            readiness_interval: spinlets.readiness_interval(),
            readiness_request_timeout: spinlets.readiness_request_timeout(),
            shutdown_grace_period: spinlets.shutdown_grace_period(),
            metrics_interval: spinlets.metrics_interval(),
            metrics_ttl: spinlets.metrics_ttl(),
            orphan_check_delay: spinlets.orphan_check_delay(),
            sweep_interval: config.store.sweep_interval(),
            health: HealthCheckConfig {
                interval: spinlets.health_check_interval(),
                failure_threshold: spinlets.unhealthy_threshold,
            },
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Remaining idle time for one spinlet
#[derive(Debug, Clone, PartialEq)]
pub struct IdleInfo {
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdleTimeout {
    pub spinlet_id: String,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

/// Idle timer overview across all active spinlets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdleMetrics {
    pub total_active: usize,
    pub timeouts: Vec<IdleTimeout>,
    pub about_to_expire: usize,
    pub avg_time_to_expire_secs: u64,
}

/// Outcome of one orphan reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Stopped because they were idle past the timeout
    pub stopped: Vec<String>,
    /// Idle timer recreated with the remaining time
    pub rearmed: Vec<String>,
}

/// Process tracked for a spinlet
///
/// The generation distinguishes successive launches of the same spinlet id so
/// a late exit from an old process never cleans up its replacement.
struct Supervised {
    generation: u64,
    control: ProcessControl,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn ResourceStore>,
    ports: PortAllocator,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn ReadinessProbe>,
    sampler: Arc<dyn UsageSampler>,
    health: HealthProber,
    events: EventBus,
    records: DashMap<String, RuntimeRecord>,
    processes: DashMap<String, Supervised>,
    monitors: DashMap<String, CancellationToken>,
    cleaning: DashSet<String>,
    stopping: DashSet<String>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpinletEvent> {
        self.events.subscribe()
    }

    fn record(&self, spinlet_id: &str) -> Option<RuntimeRecord> {
        self.records.get(spinlet_id).map(|r| r.value().clone())
    }

    async fn load_record(&self, spinlet_id: &str) -> Result<Option<RuntimeRecord>> {
        let fields = self.store.hgetall(&keys::spinlet(spinlet_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        RuntimeRecord::from_fields(&fields).map(Some)
    }

    /// Launch a spinlet and wait until it is ready
    ///
    /// Returns the existing record without launching anything if the spinlet
    /// is already running, here or under another orchestrator sharing the
    /// store. Leftover `starting`/`stopping` state with no local process is
    /// cleaned up before launching.
    pub async fn spawn(self: &Arc<Self>, spec: LaunchSpec) -> Result<RuntimeRecord> {
        let spinlet_id = spec.spinlet_id.clone();

        // Cached state or an in-flight stop means this orchestrator owns it
        let cached = self.record(&spinlet_id);
        let local = cached.is_some() || self.stopping.contains(&spinlet_id);
        let existing = match cached {
            Some(record) => Some(record),
            None => self.load_record(&spinlet_id).await?,
        };

        if let Some(existing) = existing {
            match existing.state {
                SpinletState::Running if local => {
                    debug!(spinlet_id = %spinlet_id, "Spinlet already running");
                    self.touch(&spinlet_id).await?;
                    return Ok(self.record(&spinlet_id).unwrap_or(existing));
                }
                SpinletState::Running => {
                    debug!(spinlet_id = %spinlet_id, port = existing.port, host = %existing.host, "Spinlet running elsewhere");
                    let mut record = existing;
                    record.last_access = now_ms();
                    self.persist(&record).await?;
                    self.arm_idle_timer(&spinlet_id).await?;
                    return Ok(record);
                }
                SpinletState::Starting | SpinletState::Stopping if local => {
                    return Err(SpinError::StartupFailed {
                        spinlet_id,
                        reason: format!("spinlet is {}", existing.state),
                    });
                }
                SpinletState::Starting | SpinletState::Stopping => {
                    warn!(spinlet_id = %spinlet_id, state = %existing.state, port = existing.port, "Releasing stale state before launch");
                    self.stop(&spinlet_id, StopReason::Other("stale".to_string())).await?;
                }
                SpinletState::Stopped | SpinletState::Crashed => {}
            }
        }

        // Reject bad limits before any resource is claimed
        spec.resources.memory_mb()?;

        let port = match spec.port {
            Some(port) => {
                self.ports.reserve(port, &spinlet_id).await?;
                port
            }
            None => self.ports.allocate(&spinlet_id).await?,
        };

        let env = launcher::base_env(&spec, port);
        let handle = match self.launcher.launch(&spec, port, &env).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(spinlet_id = %spinlet_id, port, error = %e, "Failed to launch spinlet");
                if let Err(release_err) = self.ports.release_for(port, &spinlet_id).await {
                    warn!(spinlet_id = %spinlet_id, port, error = %release_err, "Failed to release port after launch failure");
                }
                return Err(e);
            }
        };

        let control = handle.control();
        let now = now_ms();
        let record = RuntimeRecord {
            spinlet_id: spinlet_id.clone(),
            tenant_id: spec.tenant_id.clone(),
            pid: handle.pid(),
            port,
            state: SpinletState::Starting,
            start_time: now,
            last_access: now,
            requests: 0,
            errors: 0,
            memory: 0,
            cpu: 0.0,
            host: self.config.hostname.clone(),
            service_path: format!("{}:{}", self.config.service_host, port),
            domains: spec.domains.clone(),
            framework: spec.framework.clone(),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.insert(spinlet_id.clone(), record.clone());
        self.processes.insert(
            spinlet_id.clone(),
            Supervised {
                generation,
                control: control.clone(),
            },
        );
        self.attach_output(&spinlet_id, handle);
        self.watch_exit(&spinlet_id, generation, control.clone());

        if let Err(e) = self.persist(&record).await {
            self.abort_startup(&spinlet_id).await;
            return Err(e);
        }

        let policy = self.launcher.readiness_policy(&spec.framework);
        let ready = probe::wait_for_ready(
            self.probe.as_ref(),
            port,
            &policy,
            self.config.startup_timeout,
            self.config.readiness_interval,
            &control,
            self.shutdown.child_token(),
        )
        .await;

        let ready_in = match ready {
            Ok(elapsed) => elapsed,
            Err(e) => {
                warn!(spinlet_id = %spinlet_id, port, error = %e, "Spinlet failed to become ready");
                self.abort_startup(&spinlet_id).await;
                return Err(SpinError::StartupFailed {
                    spinlet_id,
                    reason: e.to_string(),
                });
            }
        };

        let promoted = self.records.get_mut(&spinlet_id).and_then(|mut r| {
            (r.state == SpinletState::Starting).then(|| {
                r.state = SpinletState::Running;
                r.last_access = now_ms();
                r.clone()
            })
        });
        let Some(record) = promoted else {
            return Err(SpinError::StartupFailed {
                spinlet_id,
                reason: "stopped during startup".to_string(),
            });
        };

        if let Err(e) = self.persist(&record).await {
            self.abort_startup(&spinlet_id).await;
            return Err(e);
        }
        if let Err(e) = self.arm_idle_timer(&spinlet_id).await {
            self.abort_startup(&spinlet_id).await;
            return Err(e);
        }
        self.start_monitor(&spinlet_id, record.pid);

        info!(
            spinlet_id = %spinlet_id,
            port,
            pid = ?record.pid,
            service_path = %record.service_path,
            startup_ms = ready_in.as_millis() as u64,
            "Spinlet started"
        );
        self.events.emit(SpinletEvent::Started {
            spinlet_id: spinlet_id.clone(),
            port,
        });

        // An exit between readiness and promotion was skipped by the watcher
        if let Some(exit) = control.exit_status() {
            self.on_exit(&spinlet_id, generation, Some(exit)).await;
        }

        Ok(record)
    }

    async fn abort_startup(&self, spinlet_id: &str) {
        if let Err(e) = self.stop(spinlet_id, StopReason::StartupFailed).await {
            error!(spinlet_id, error = %e, "Failed to clean up after startup failure");
        }
    }

    /// Stop a spinlet
    ///
    /// Works from whatever is left: a live process, a record only in the
    /// store, or nothing at all (no-op).
    pub async fn stop(&self, spinlet_id: &str, reason: StopReason) -> Result<()> {
        if !self.stopping.insert(spinlet_id.to_string()) {
            debug!(spinlet_id, "Stop already in progress");
            return Ok(());
        }
        let result = self.stop_inner(spinlet_id, reason).await;
        self.stopping.remove(spinlet_id);
        result
    }

    async fn stop_inner(&self, spinlet_id: &str, reason: StopReason) -> Result<()> {
        let process = self.processes.remove(spinlet_id).map(|(_, p)| p);

        let record = match self.record(spinlet_id) {
            Some(record) => Some(record),
            None => {
                let loaded = self.load_record(spinlet_id).await?;
                if let Some(record) = loaded.as_ref().filter(|r| !r.state.is_terminal()) {
                    self.records.insert(spinlet_id.to_string(), record.clone());
                }
                loaded
            }
        };

        let Some(process) = process else {
            return match record {
                Some(record) if !record.state.is_terminal() => {
                    info!(spinlet_id, reason = %reason, state = %record.state, "No process handle, cleaning up stored state");
                    self.cleanup(spinlet_id, reason).await
                }
                _ => {
                    debug!(spinlet_id, "Nothing to stop");
                    Ok(())
                }
            };
        };

        if let Some(mut record) = record {
            info!(
                spinlet_id,
                reason = %reason,
                uptime_secs = (now_ms() - record.start_time).max(0) / 1000,
                requests = record.requests,
                errors = record.errors,
                "Stopping spinlet"
            );
            record.state = SpinletState::Stopping;
            self.records.insert(spinlet_id.to_string(), record.clone());
            self.persist(&record).await?;
        } else {
            info!(spinlet_id, reason = %reason, "Stopping spinlet with no cached state");
        }

        self.terminate(spinlet_id, &process.control).await;
        self.cleanup(spinlet_id, reason).await
    }

    /// SIGTERM, wait out the grace period, then SIGKILL
    async fn terminate(&self, spinlet_id: &str, control: &ProcessControl) {
        if !control.signal(ProcessSignal::Terminate) {
            debug!(spinlet_id, "Process already exited");
            return;
        }

        let grace_period = self.config.shutdown_grace_period;
        match tokio::time::timeout(grace_period, control.wait()).await {
            Ok(Some(exit)) => {
                info!(spinlet_id, status = %exit.describe(), "Spinlet exited gracefully");
            }
            Ok(None) => {
                warn!(spinlet_id, "Lost track of spinlet process during shutdown");
            }
            Err(_) => {
                warn!(
                    spinlet_id,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                control.signal(ProcessSignal::Kill);
                if tokio::time::timeout(KILL_WAIT, control.wait()).await.is_err() {
                    error!(spinlet_id, "Spinlet process did not exit after SIGKILL");
                }
            }
        }
    }

    /// Release everything a spinlet holds and record its terminal state
    ///
    /// Runs at most once per terminal transition; a terminal record is left
    /// untouched.
    async fn cleanup(&self, spinlet_id: &str, reason: StopReason) -> Result<()> {
        if !self.cleaning.insert(spinlet_id.to_string()) {
            debug!(spinlet_id, "Cleanup already in progress");
            return Ok(());
        }
        let result = self.cleanup_inner(spinlet_id, reason).await;
        self.cleaning.remove(spinlet_id);
        result
    }

    async fn cleanup_inner(&self, spinlet_id: &str, reason: StopReason) -> Result<()> {
        let record = match self.record(spinlet_id) {
            Some(record) => Some(record),
            None => self.load_record(spinlet_id).await?,
        };
        if let Some((_, token)) = self.monitors.remove(spinlet_id) {
            token.cancel();
        }

        let Some(mut record) = record.filter(|r| !r.state.is_terminal()) else {
            self.records.remove(spinlet_id);
            return Ok(());
        };

        self.ports.release_for(record.port, spinlet_id).await?;
        self.delete_mapping(&keys::service_path(&record.service_path), spinlet_id)
            .await?;
        for domain in &record.domains {
            self.delete_mapping(&keys::domain(domain), spinlet_id).await?;
        }
        self.store.zrem(keys::ACTIVE, spinlet_id).await?;
        self.store.del(&keys::idle(spinlet_id)).await?;
        if let Some(pid) = record.pid {
            self.sampler.forget(pid);
        }

        record.state = if reason.is_crash() {
            SpinletState::Crashed
        } else {
            SpinletState::Stopped
        };
        self.persist(&record).await?;
        self.records.remove(spinlet_id);

        info!(spinlet_id, port = record.port, reason = %reason, state = %record.state, "Spinlet cleaned up");
        let event = match reason {
            StopReason::Crashed(error) => SpinletEvent::Crashed {
                spinlet_id: spinlet_id.to_string(),
                error,
            },
            reason => SpinletEvent::Stopped {
                spinlet_id: spinlet_id.to_string(),
                reason,
            },
        };
        self.events.emit(event);
        Ok(())
    }

    /// Delete a reverse lookup only if it still points at `spinlet_id`
    async fn delete_mapping(&self, key: &str, spinlet_id: &str) -> Result<()> {
        if self.store.get(key).await?.as_deref() == Some(spinlet_id) {
            self.store.del(key).await?;
        }
        Ok(())
    }

    /// Mirror a record to the store; lookups and the active index only while running
    async fn persist(&self, record: &RuntimeRecord) -> Result<()> {
        let id = &record.spinlet_id;
        self.store
            .hset_many(&keys::spinlet(id), &record.to_fields())
            .await?;

        if record.is_running() {
            self.store
                .set(&keys::service_path(&record.service_path), id)
                .await?;
            for domain in &record.domains {
                self.store.set(&keys::domain(domain), id).await?;
            }
            self.store
                .zadd(keys::ACTIVE, id, record.last_access as f64)
                .await?;
        }
        Ok(())
    }

    async fn arm_idle_timer(&self, spinlet_id: &str) -> Result<()> {
        self.store
            .set_ex(&keys::idle(spinlet_id), "1", self.config.idle_timeout)
            .await
    }

    /// Reset the idle timer and bump last access
    pub async fn touch(&self, spinlet_id: &str) -> Result<()> {
        let record = self
            .records
            .get_mut(spinlet_id)
            .map(|mut r| {
                if r.is_running() {
                    r.last_access = now_ms();
                }
                r.clone()
            })
            .ok_or_else(|| SpinError::NotFound(spinlet_id.to_string()))?;

        if !record.is_running() {
            return Ok(());
        }
        self.arm_idle_timer(spinlet_id).await?;
        self.persist(&record).await
    }

    pub async fn update_last_access(&self, spinlet_id: &str) -> Result<()> {
        self.touch(spinlet_id).await
    }

    /// Count one request (and any errors) against a spinlet
    pub async fn record_request(&self, spinlet_id: &str, errors: u64) -> Result<()> {
        let record = self
            .records
            .get_mut(spinlet_id)
            .map(|mut r| {
                r.requests += 1;
                r.errors += errors;
                r.last_access = now_ms();
                r.clone()
            })
            .ok_or_else(|| SpinError::NotFound(spinlet_id.to_string()))?;

        self.persist(&record).await?;
        if record.is_running() {
            self.arm_idle_timer(spinlet_id).await?;
        }
        Ok(())
    }

    /// Replace the domains bound to a spinlet
    pub async fn update_domains(&self, spinlet_id: &str, domains: Vec<String>) -> Result<()> {
        let (old, record) = self
            .records
            .get_mut(spinlet_id)
            .map(|mut r| {
                let old = std::mem::replace(&mut r.domains, domains);
                (old, r.clone())
            })
            .ok_or_else(|| SpinError::NotFound(spinlet_id.to_string()))?;

        for domain in old.iter().filter(|d| !record.domains.contains(d)) {
            self.delete_mapping(&keys::domain(domain), spinlet_id).await?;
        }
        self.persist(&record).await?;
        info!(spinlet_id, domains = ?record.domains, "Updated spinlet domains");
        Ok(())
    }

    pub async fn find_by_service_path(&self, service_path: &str) -> Result<Option<String>> {
        self.store.get(&keys::service_path(service_path)).await
    }

    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<String>> {
        self.store.get(&keys::domain(domain)).await
    }

    /// Look up by `host:port` service path, or by domain if there is no `:`
    pub async fn state_by_service_path_or_domain(&self, path_or_domain: &str) -> Result<Option<RuntimeRecord>> {
        let spinlet_id = if path_or_domain.contains(':') {
            self.find_by_service_path(path_or_domain).await?
        } else {
            self.find_by_domain(path_or_domain).await?
        };
        match spinlet_id {
            Some(id) => self.get_state(&id).await,
            None => Ok(None),
        }
    }

    /// Current record, from memory first and then the store
    pub async fn get_state(&self, spinlet_id: &str) -> Result<Option<RuntimeRecord>> {
        match self.record(spinlet_id) {
            Some(record) => Ok(Some(record)),
            None => self.load_record(spinlet_id).await,
        }
    }

    /// Running spinlets owned by this orchestrator
    pub fn list_running(&self) -> Vec<RuntimeRecord> {
        let mut running: Vec<RuntimeRecord> = self
            .records
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.value().clone())
            .collect();
        running.sort_by(|a, b| a.spinlet_id.cmp(&b.spinlet_id));
        running
    }

    pub async fn idle_info(&self, spinlet_id: &str) -> Result<Option<IdleInfo>> {
        match self.store.ttl(&keys::idle(spinlet_id)).await? {
            KeyTtl::Expires(ttl) if !ttl.is_zero() => Ok(Some(IdleInfo {
                ttl,
                expires_at: Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64),
            })),
            _ => Ok(None),
        }
    }

    /// Push a running spinlet's idle deadline out by `extra`
    ///
    /// Returns false if the spinlet is not running or has no idle timer.
    pub async fn extend_idle_timeout(&self, spinlet_id: &str, extra: Duration) -> Result<bool> {
        match self.get_state(spinlet_id).await? {
            Some(record) if record.is_running() => {}
            _ => return Ok(false),
        }

        let key = keys::idle(spinlet_id);
        let KeyTtl::Expires(current) = self.store.ttl(&key).await? else {
            return Ok(false);
        };
        let extended = current + extra;
        let applied = self.store.expire(&key, extended).await?;
        if applied {
            info!(
                spinlet_id,
                previous_ttl_secs = current.as_secs(),
                new_ttl_secs = extended.as_secs(),
                "Extended idle timeout"
            );
        }
        Ok(applied)
    }

    pub async fn idle_metrics(&self) -> Result<IdleMetrics> {
        let active = self.store.zrange(keys::ACTIVE).await?;
        let mut metrics = IdleMetrics {
            total_active: active.len(),
            ..Default::default()
        };

        let mut total = Duration::ZERO;
        for (spinlet_id, _) in active {
            if let Some(info) = self.idle_info(&spinlet_id).await? {
                total += info.ttl;
                if info.ttl < ABOUT_TO_EXPIRE {
                    metrics.about_to_expire += 1;
                }
                metrics.timeouts.push(IdleTimeout {
                    spinlet_id,
                    ttl: info.ttl,
                    expires_at: info.expires_at,
                });
            }
        }

        if !metrics.timeouts.is_empty() {
            let avg = total.as_secs_f64() / metrics.timeouts.len() as f64;
            metrics.avg_time_to_expire_secs = avg.round() as u64;
        }
        Ok(metrics)
    }

    /// Check every active spinlet still has an idle timer
    ///
    /// A running spinlet whose timer was lost is stopped if it has been idle
    /// longer than the timeout, otherwise its timer is recreated with the
    /// time it has left.
    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let timeout_ms = self.config.idle_timeout.as_millis() as i64;

        for (spinlet_id, _) in self.store.zrange(keys::ACTIVE).await? {
            let Some(record) = self.get_state(&spinlet_id).await? else {
                continue;
            };
            if !record.is_running() {
                continue;
            }
            let idle_key = keys::idle(&spinlet_id);
            if self.store.ttl(&idle_key).await? != KeyTtl::Missing {
                continue;
            }

            let idle_for = record.idle_for_ms(now_ms());
            warn!(spinlet_id = %spinlet_id, idle_for_secs = idle_for / 1000, "Found orphaned spinlet without idle timer");

            if idle_for >= timeout_ms {
                info!(spinlet_id = %spinlet_id, "Stopping orphaned idle spinlet");
                self.stop(&spinlet_id, StopReason::OrphanedIdle).await?;
                report.stopped.push(spinlet_id);
            } else {
                let remaining = Duration::from_millis((timeout_ms - idle_for) as u64);
                self.store.set_ex(&idle_key, "1", remaining).await?;
                info!(spinlet_id = %spinlet_id, remaining_secs = remaining.as_secs(), "Recreated idle timer for orphaned spinlet");
                report.rearmed.push(spinlet_id);
            }
        }
        Ok(report)
    }

    /// Sample cpu/memory for every running spinlet
    pub async fn collect_metrics(&self) {
        let targets: Vec<(String, u32)> = self
            .records
            .iter()
            .filter(|r| r.is_running())
            .filter_map(|r| r.pid.map(|pid| (r.spinlet_id.clone(), pid)))
            .collect();

        for (spinlet_id, pid) in targets {
            let usage = match self.sampler.sample(pid) {
                Ok(usage) => usage,
                Err(e) => {
                    debug!(spinlet_id = %spinlet_id, pid, error = %e, "Failed to sample spinlet usage");
                    continue;
                }
            };

            if let Some(mut record) = self.records.get_mut(&spinlet_id) {
                record.cpu = usage.cpu;
                record.memory = usage.memory;
            }

            let now = now_ms();
            let key = keys::metrics(&spinlet_id, now);
            let fields = vec![
                ("cpu_percent".to_string(), format!("{:.2}", usage.cpu)),
                ("memory_bytes".to_string(), usage.memory.to_string()),
                ("memory_percent".to_string(), format!("{:.2}", usage.memory_percent)),
                ("timestamp".to_string(), now.to_string()),
            ];
            let record_fields = vec![
                ("cpu".to_string(), usage.cpu.to_string()),
                ("memory".to_string(), usage.memory.to_string()),
            ];

            let written = async {
                self.store.hset_many(&key, &fields).await?;
                self.store.expire(&key, self.config.metrics_ttl).await?;
                self.store
                    .hset_many(&keys::spinlet(&spinlet_id), &record_fields)
                    .await
            }
            .await;
            if let Err(e) = written {
                warn!(spinlet_id = %spinlet_id, error = %e, "Failed to store resource metrics");
            }
        }
    }

    /// Stop every spinlet this orchestrator knows about
    pub async fn stop_all(&self, reason: StopReason) {
        let mut ids: Vec<String> = self.processes.iter().map(|p| p.key().clone()).collect();
        for record in self.records.iter() {
            if !record.state.is_terminal() && !ids.contains(record.key()) {
                ids.push(record.key().clone());
            }
        }

        let stops = ids.iter().map(|id| {
            let reason = reason.clone();
            async move {
                if let Err(e) = self.stop(id, reason).await {
                    error!(spinlet_id = %id, error = %e, "Failed to stop spinlet");
                }
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Start the supervisory loops: expiry listener, store sweeper, metrics
    /// sampler and the delayed orphan check
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_expiry_listener());

        let store = Arc::clone(&self.store);
        tasks.push(spawn_periodic(
            "store-sweeper",
            self.config.sweep_interval,
            self.shutdown.child_token(),
            move || {
                let store = Arc::clone(&store);
                async move {
                    if let Err(e) = store.purge_expired().await {
                        warn!(error = %e, "Failed to purge expired keys");
                    }
                }
            },
        ));

        let this = Arc::clone(self);
        tasks.push(spawn_periodic(
            "metrics",
            self.config.metrics_interval,
            self.shutdown.child_token(),
            move || {
                let this = Arc::clone(&this);
                async move { this.collect_metrics().await }
            },
        ));

        let this = Arc::clone(self);
        let token = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if !ticker::sleep_unless_cancelled(this.config.orphan_check_delay, &token).await {
                return;
            }
            match this.reconcile_orphans().await {
                Ok(report) => info!(
                    stopped = report.stopped.len(),
                    rearmed = report.rearmed.len(),
                    "Orphan reconciliation complete"
                ),
                Err(e) => error!(error = %e, "Orphan reconciliation failed"),
            }
        }));

        info!(
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            ports = ?(self.config.ports.range_start, self.config.ports.range_end),
            "Orchestrator started"
        );
    }

    /// Cancel the supervisory loops and stop every spinlet
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.stop_all(StopReason::Shutdown).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Orchestrator stopped");
    }

    fn spawn_expiry_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut expired = self.store.subscribe_expired();
        let token = self.shutdown.child_token();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = expired.recv() => match received {
                        Ok(key) => {
                            if let Some(spinlet_id) = keys::idle_spinlet_id(&key) {
                                let this = Arc::clone(&this);
                                let spinlet_id = spinlet_id.to_string();
                                tokio::spawn(async move { this.on_idle_expired(&spinlet_id).await });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Expiry listener lagged; orphan reconciliation will catch up");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Expiry listener stopped");
        })
    }

    async fn on_idle_expired(&self, spinlet_id: &str) {
        match self.get_state(spinlet_id).await {
            Ok(Some(record)) if record.is_running() => {
                info!(
                    spinlet_id,
                    idle_for_secs = record.idle_for_ms(now_ms()) / 1000,
                    "Stopping idle spinlet"
                );
                if let Err(e) = self.stop(spinlet_id, StopReason::Idle).await {
                    error!(spinlet_id, error = %e, "Failed to stop idle spinlet");
                }
            }
            Ok(_) => debug!(spinlet_id, "Idle timer expired for spinlet that is not running"),
            Err(e) => error!(spinlet_id, error = %e, "Failed to load spinlet after idle expiry"),
        }
    }

    fn start_monitor(&self, spinlet_id: &str, pid: Option<u32>) {
        let token = self.shutdown.child_token();
        self.health.spawn(spinlet_id.to_string(), pid, token.clone());
        if let Some(previous) = self.monitors.insert(spinlet_id.to_string(), token) {
            previous.cancel();
        }
    }

    /// Forward process output to the log and the event bus
    fn attach_output(&self, spinlet_id: &str, mut handle: ProcessHandle) {
        let streams = [
            (LogStream::Stdout, handle.stdout.take()),
            (LogStream::Stderr, handle.stderr.take()),
        ];
        for (stream, reader) in streams {
            let Some(reader) = reader else { continue };
            let events = self.events.clone();
            let spinlet_id = spinlet_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match stream {
                        LogStream::Stdout => info!(target: "spinlet", spinlet_id = %spinlet_id, "{}", line),
                        LogStream::Stderr => warn!(target: "spinlet", spinlet_id = %spinlet_id, "{}", line),
                    }
                    events.emit(SpinletEvent::Log {
                        spinlet_id: spinlet_id.clone(),
                        stream,
                        line,
                    });
                }
            });
        }
    }

    fn watch_exit(self: &Arc<Self>, spinlet_id: &str, generation: u64, control: ProcessControl) {
        let this = Arc::clone(self);
        let spinlet_id = spinlet_id.to_string();
        tokio::spawn(async move {
            let exit = control.wait().await;
            let starting = this
                .records
                .get(&spinlet_id)
                .map(|r| r.state == SpinletState::Starting)
                .unwrap_or(false);
            if starting {
                // spawn() sees the exit through its readiness wait and cleans up
                debug!(spinlet_id = %spinlet_id, "Process exited during startup");
                return;
            }
            this.on_exit(&spinlet_id, generation, exit).await;
        });
    }

    /// Handle a process exit nobody asked for
    async fn on_exit(&self, spinlet_id: &str, generation: u64, exit: Option<ProcessExit>) {
        // stop() removes the process first; if it is gone, stop owns cleanup
        if self
            .processes
            .remove_if(spinlet_id, |_, p| p.generation == generation)
            .is_none()
        {
            return;
        }

        let reason = match exit {
            Some(exit) if exit.success() => StopReason::Exited,
            Some(exit) => StopReason::Crashed(exit.describe()),
            None => StopReason::Crashed("unknown exit status".to_string()),
        };
        match &reason {
            StopReason::Crashed(detail) => error!(spinlet_id, detail = %detail, "Spinlet crashed"),
            _ => info!(spinlet_id, "Spinlet process exited"),
        }

        if let Err(e) = self.cleanup(spinlet_id, reason).await {
            error!(spinlet_id, error = %e, "Failed to clean up after process exit");
        }
    }
}

/// Builder for configuring an [`Orchestrator`]
pub struct OrchestratorBuilder {
    store: Arc<dyn ResourceStore>,
    config: OrchestratorConfig,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    probe: Option<Arc<dyn ReadinessProbe>>,
    sampler: Option<Arc<dyn UsageSampler>>,
    liveness: Option<Arc<dyn LivenessCheck>>,
    events: Option<EventBus>,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            config: OrchestratorConfig::default(),
            launcher: None,
            probe: None,
            sampler: None,
            liveness: None,
            events: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn UsageSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn liveness(mut self, liveness: Arc<dyn LivenessCheck>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Arc<Orchestrator> {
        let config = self.config;
        let events = self.events.unwrap_or_default();
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe::new(config.readiness_request_timeout)));
        let liveness = self.liveness.unwrap_or_else(|| Arc::new(PidLiveness));
        let health = HealthProber::new(config.health.clone(), liveness, events.clone());

        Arc::new(Orchestrator {
            ports: PortAllocator::new(Arc::clone(&self.store), config.ports),
            store: self.store,
            launcher: self.launcher.unwrap_or_else(|| Arc::new(LocalLauncher::new())),
            probe,
            sampler: self.sampler.unwrap_or_else(|| Arc::new(ProcSampler::new())),
            health,
            events,
            records: DashMap::new(),
            processes: DashMap::new(),
            monitors: DashMap::new(),
            cleaning: DashSet::new(),
            stopping: DashSet::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }
}
