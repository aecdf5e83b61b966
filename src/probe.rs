//! Readiness probing during spinlet startup

use crate::launcher::{ProcessControl, ReadinessPolicy};
use crate::ticker::Ticker;
use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Status code of a single GET, or `None` if nothing answered
    async fn probe(&self, port: u16, path: &str) -> Option<u16>;
}

/// Probes `http://127.0.0.1:<port><path>` with a pooled hyper client
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(request_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, port: u16, path: &str) -> Option<u16> {
        let uri = format!("http://127.0.0.1:{}{}", port, path);
        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .header("User-Agent", "spinhost-probe")
            .body(Empty::<Bytes>::new())
            .ok()?;

        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Some(response.status().as_u16()),
            Ok(Err(e)) => {
                trace!(port, error = %e, "Readiness probe failed");
                None
            }
            Err(_) => {
                trace!(port, "Readiness probe timed out");
                None
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReadinessError {
    #[error("readiness timed out after {0:?}")]
    TimedOut(Duration),

    #[error("process exited during startup ({0})")]
    ProcessExited(String),

    #[error("startup cancelled")]
    Cancelled,
}

/// Poll until the policy accepts a response, the process dies or `timeout` passes
///
/// Returns how long the spinlet took to become ready.
pub async fn wait_for_ready(
    probe: &dyn ReadinessProbe,
    port: u16,
    policy: &ReadinessPolicy,
    timeout: Duration,
    interval: Duration,
    process: &ProcessControl,
    token: CancellationToken,
) -> Result<Duration, ReadinessError> {
    let started = Instant::now();

    let poll = async {
        let mut ticker = Ticker::immediate(interval, token);
        while ticker.tick().await {
            match probe.probe(port, &policy.path).await {
                Some(status) if policy.accepts(status) => return Ok(()),
                Some(status) => trace!(port, status, "Spinlet answered but is not ready"),
                None => {}
            }
        }
        Err(ReadinessError::Cancelled)
    };

    let result = tokio::select! {
        biased;
        exit = process.wait() => {
            let status = exit.map(|e| e.describe()).unwrap_or_else(|| "unknown exit status".to_string());
            Err(ReadinessError::ProcessExited(status))
        }
        polled = tokio::time::timeout(timeout, poll) => match polled {
            Ok(result) => result,
            Err(_) => Err(ReadinessError::TimedOut(timeout)),
        },
    };

    result.map(|()| {
        let elapsed = started.elapsed();
        debug!(port, ready_in_ms = elapsed.as_millis() as u64, "Spinlet ready");
        elapsed
    })
}
