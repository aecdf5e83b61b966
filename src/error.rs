//! Error taxonomy for the spinlet host
//!
//! Library operations return [`SpinError`]. Build failures are the exception:
//! they are collected into `BuildResult::errors` and never escape the build
//! queue as errors.

use thiserror::Error;

/// Errors surfaced by the orchestrator, port allocator and resource store
#[derive(Debug, Error)]
pub enum SpinError {
    /// No free port left in the configured range
    #[error("no available ports in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    /// Readiness timed out or the process died during startup
    #[error("spinlet {spinlet_id} failed to start: {reason}")]
    StartupFailed { spinlet_id: String, reason: String },

    /// No launch strategy registered for the framework
    #[error("no launch strategy registered for framework '{0}'")]
    LaunchStrategyMissing(String),

    /// A failed build was used where a deployable artifact is required
    #[error("build failed: {}", .0.join("; "))]
    BuildFailed(Vec<String>),

    /// Malformed memory limit such as "12XB"
    #[error("invalid memory spec '{0}' (expected <n>MB or <n>GB)")]
    InvalidMemorySpec(String),

    /// Resource store failure; fatal to the affected operation
    #[error("resource store error: {0}")]
    Store(String),

    /// Spinlet is not known to this orchestrator
    #[error("spinlet {0} not found")]
    NotFound(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SpinError {
    /// Shorthand for a store error with a message
    pub fn store(message: impl Into<String>) -> Self {
        SpinError::Store(message.into())
    }

    /// Whether the error is `ResourceExhausted`
    pub fn is_exhausted(&self) -> bool {
        matches!(self, SpinError::ResourceExhausted { .. })
    }

    /// Whether the error is `StartupFailed`
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, SpinError::StartupFailed { .. })
    }
}

impl From<rusqlite::Error> for SpinError {
    fn from(err: rusqlite::Error) -> Self {
        SpinError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SpinError::ResourceExhausted {
            start: 3000,
            end: 3002,
        };
        assert_eq!(err.to_string(), "no available ports in range 3000-3002");
        assert!(err.is_exhausted());

        let err = SpinError::StartupFailed {
            spinlet_id: "web-1".to_string(),
            reason: "readiness timed out after 2s".to_string(),
        };
        assert!(err.to_string().contains("web-1"));
        assert!(err.is_startup_failure());
        assert!(!err.is_exhausted());
    }

    #[test]
    fn test_build_failed_joins_errors() {
        let err = SpinError::BuildFailed(vec!["npm install failed".into(), "no output".into()]);
        assert_eq!(err.to_string(), "build failed: npm install failed; no output");
    }

    #[test]
    fn test_sqlite_errors_map_to_store() {
        let err: SpinError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, SpinError::Store(_)));
    }
}
