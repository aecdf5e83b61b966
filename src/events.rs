//! Typed lifecycle events published by the orchestrator

use crate::spinlet::StopReason;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpinletEvent {
    Started {
        spinlet_id: String,
        port: u16,
    },
    Stopped {
        spinlet_id: String,
        reason: StopReason,
    },
    /// Abnormal exit; emitted instead of `Stopped`
    Crashed {
        spinlet_id: String,
        error: String,
    },
    Log {
        spinlet_id: String,
        stream: LogStream,
        line: String,
    },
    Unhealthy {
        spinlet_id: String,
        reason: String,
        failures: u32,
    },
    Healthy {
        spinlet_id: String,
    },
}

impl SpinletEvent {
    pub fn spinlet_id(&self) -> &str {
        match self {
            SpinletEvent::Started { spinlet_id, .. }
            | SpinletEvent::Stopped { spinlet_id, .. }
            | SpinletEvent::Crashed { spinlet_id, .. }
            | SpinletEvent::Log { spinlet_id, .. }
            | SpinletEvent::Unhealthy { spinlet_id, .. }
            | SpinletEvent::Healthy { spinlet_id } => spinlet_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SpinletEvent::Started { .. } => "started",
            SpinletEvent::Stopped { .. } => "stopped",
            SpinletEvent::Crashed { .. } => "crashed",
            SpinletEvent::Log { .. } => "log",
            SpinletEvent::Unhealthy { .. } => "unhealthy",
            SpinletEvent::Healthy { .. } => "healthy",
        }
    }
}

/// Fan-out channel for [`SpinletEvent`]s
///
/// Slow subscribers lag and drop old events; emitting never blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SpinletEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: SpinletEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpinletEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
