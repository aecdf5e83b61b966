//! Per-spinlet liveness watchdog
//!
//! Periodically checks that a spinlet's process still exists and publishes
//! `Unhealthy` / `Healthy` transitions on the event bus. It never stops a
//! spinlet itself.

use crate::events::{EventBus, SpinletEvent};
use crate::ticker::Ticker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between liveness checks
    pub interval: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// Cheap existence check for a process id
pub trait LivenessCheck: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// `kill(pid, 0)`: succeeds if the process exists
pub struct PidLiveness;

impl LivenessCheck for PidLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only
        let rc = unsafe { libc::kill(pid, 0) };
        // EPERM means the process exists but belongs to someone else
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnhealthy { failures: u32 },
    Recovered,
}

/// Tracks consecutive liveness results for one spinlet
#[derive(Debug)]
pub struct HealthState {
    consecutive_failures: u32,
    is_healthy: bool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            is_healthy: true, // Assume healthy initially
        }
    }
}

impl HealthState {
    /// Record one check; returns a transition when the health flips
    pub fn observe(&mut self, alive: bool, threshold: u32) -> Option<HealthTransition> {
        if alive {
            self.consecutive_failures = 0;
            if !self.is_healthy {
                self.is_healthy = true;
                return Some(HealthTransition::Recovered);
            }
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.is_healthy && self.consecutive_failures >= threshold.max(1) {
            self.is_healthy = false;
            return Some(HealthTransition::BecameUnhealthy {
                failures: self.consecutive_failures,
            });
        }
        None
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Spawns liveness watchdogs that report onto the event bus
#[derive(Clone)]
pub struct HealthProber {
    config: HealthCheckConfig,
    liveness: Arc<dyn LivenessCheck>,
    events: EventBus,
}

impl HealthProber {
    pub fn new(config: HealthCheckConfig, liveness: Arc<dyn LivenessCheck>, events: EventBus) -> Self {
        Self {
            config,
            liveness,
            events,
        }
    }

    /// Watch `pid` until `token` is cancelled
    pub fn spawn(&self, spinlet_id: String, pid: Option<u32>, token: CancellationToken) -> JoinHandle<()> {
        let prober = self.clone();
        tokio::spawn(async move {
            debug!(spinlet_id = %spinlet_id, ?pid, "Health prober started");
            let mut state = HealthState::default();
            let mut ticker = Ticker::new(prober.config.interval, token);

            while ticker.tick().await {
                let alive = pid.is_some_and(|pid| prober.liveness.is_alive(pid));
                match state.observe(alive, prober.config.failure_threshold) {
                    Some(HealthTransition::BecameUnhealthy { failures }) => {
                        warn!(spinlet_id = %spinlet_id, failures, "Spinlet is now unhealthy");
                        prober.events.emit(SpinletEvent::Unhealthy {
                            spinlet_id: spinlet_id.clone(),
                            reason: unhealthy_reason(pid).to_string(),
                            failures,
                        });
                    }
                    Some(HealthTransition::Recovered) => {
                        info!(spinlet_id = %spinlet_id, "Spinlet is healthy again");
                        prober.events.emit(SpinletEvent::Healthy {
                            spinlet_id: spinlet_id.clone(),
                        });
                    }
                    None => {}
                }
            }
            debug!(spinlet_id = %spinlet_id, "Health prober stopped");
        })
    }
}

/// Reason carried by `Unhealthy`; a failed existence check means the process is gone
fn unhealthy_reason(pid: Option<u32>) -> &'static str {
    match pid {
        Some(_) => "process_dead",
        None => "no_pid",
    }
}
