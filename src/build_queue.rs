//! Bounded-concurrency FIFO build queue
//!
//! Jobs are dispatched strictly in submission order by a single dispatcher
//! that takes a concurrency permit before dequeuing the next job. Every
//! failure inside a build is folded into the returned [`BuildResult`]; a
//! failed job never blocks the jobs behind it.

use crate::builder::{
    dir_size, BuildArtifact, BuildJob, BuildResult, FlutterBuilder, FrameworkBuilder, NestJsBuilder,
    NextJsBuilder, NodeBuilder, RemixBuilder, SpaBuilder, StaticBuilder,
};
use crate::config::BuildSettings;
use crate::detect::FrameworkResolver;
use crate::spinfile::Spinfile;
use crate::spinlet::Framework;
use crate::store::{keys, ResourceStore};
use anyhow::{bail, Context};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::json;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// How long the per-spinlet build status is kept
const STATUS_TTL: Duration = Duration::from_secs(60 * 60);

/// How long the last build result is kept
const RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Build metadata written into every successful artifact
pub const METADATA_FILE: &str = ".spinhost.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Queued,
    Running,
}

struct QueuedBuild {
    build_id: String,
    job: BuildJob,
    reply: oneshot::Sender<BuildResult>,
}

/// Handle for a submitted build
pub struct BuildTicket {
    pub build_id: String,
    result: oneshot::Receiver<BuildResult>,
}

impl BuildTicket {
    pub async fn wait(self) -> BuildResult {
        match self.result.await {
            Ok(result) => result,
            Err(_) => BuildResult {
                build_id: self.build_id,
                tenant_id: String::new(),
                spinlet_id: String::new(),
                success: false,
                framework: Framework::Other("unknown".to_string()),
                entry_point: None,
                artifact_path: PathBuf::new(),
                duration_ms: 0,
                size_bytes: 0,
                errors: vec!["build queue shut down before the build finished".to_string()],
                warnings: Vec::new(),
                cancelled: false,
            },
        }
    }
}

struct QueueState {
    builders: HashMap<Framework, Arc<dyn FrameworkBuilder>>,
    resolver: FrameworkResolver,
    output_root: PathBuf,
    install_deps: bool,
    store: Option<Arc<dyn ResourceStore>>,
    phases: DashMap<String, BuildPhase>,
    cancelled: DashSet<String>,
    queued: AtomicUsize,
    running: AtomicUsize,
    idle: Notify,
}

pub struct BuildQueue {
    state: Arc<QueueState>,
    tx: mpsc::UnboundedSender<QueuedBuild>,
    concurrency: usize,
}

impl BuildQueue {
    pub fn builder(settings: &BuildSettings) -> BuildQueueBuilder {
        BuildQueueBuilder::new(settings)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Enqueue a job; the ticket resolves once it has run
    pub fn submit(&self, job: BuildJob) -> BuildTicket {
        let build_id = short_id();
        let (reply, result) = oneshot::channel();

        self.state.queued.fetch_add(1, Ordering::SeqCst);
        self.state.phases.insert(build_id.clone(), BuildPhase::Queued);
        info!(
            build_id = %build_id,
            tenant_id = %job.tenant_id,
            spinlet_id = %job.spinlet_id,
            source = %job.source_dir.display(),
            "Build queued"
        );

        let queued = QueuedBuild {
            build_id: build_id.clone(),
            job,
            reply,
        };
        if let Err(mpsc::error::SendError(lost)) = self.tx.send(queued) {
            // Dispatcher gone; the ticket reports the failure
            error!(build_id = %lost.build_id, "Build dispatcher is not running");
            self.state.phases.remove(&lost.build_id);
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
        }

        BuildTicket { build_id, result }
    }

    /// Submit and wait for the result
    pub async fn build(&self, job: BuildJob) -> BuildResult {
        self.submit(job).wait().await
    }

    /// Jobs waiting for a slot
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently building
    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn phase(&self, build_id: &str) -> Option<BuildPhase> {
        self.state.phases.get(build_id).map(|p| *p)
    }

    /// Mark a queued or running build as cancelled
    ///
    /// A queued build is skipped; a running build finishes but its result is
    /// flagged so it is never deployed. Returns false for unknown builds.
    pub fn cancel(&self, build_id: &str) -> bool {
        match self.phase(build_id) {
            Some(phase) => {
                self.state.cancelled.insert(build_id.to_string());
                info!(build_id, ?phase, "Build cancelled");
                true
            }
            None => false,
        }
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

pub struct BuildQueueBuilder {
    concurrency: usize,
    output_root: PathBuf,
    install_deps: bool,
    store: Option<Arc<dyn ResourceStore>>,
    resolver: FrameworkResolver,
    builders: HashMap<Framework, Arc<dyn FrameworkBuilder>>,
}

impl BuildQueueBuilder {
    fn new(settings: &BuildSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            output_root: settings.output_dir.clone(),
            install_deps: settings.install_deps,
            store: None,
            resolver: FrameworkResolver::new(),
            builders: HashMap::new(),
        }
        .register(Arc::new(NextJsBuilder))
        .register(Arc::new(RemixBuilder))
        .register(Arc::new(NodeBuilder::express()))
        .register(Arc::new(NodeBuilder::node()))
        .register(Arc::new(NestJsBuilder))
        .register(Arc::new(SpaBuilder::react()))
        .register(Arc::new(SpaBuilder::vue()))
        .register(Arc::new(SpaBuilder::astro()))
        .register(Arc::new(FlutterBuilder))
        .register(Arc::new(StaticBuilder))
    }

    /// Record build status and results in the store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn resolver(mut self, resolver: FrameworkResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Add or replace the builder for its framework
    pub fn register(mut self, builder: Arc<dyn FrameworkBuilder>) -> Self {
        self.builders.insert(builder.framework(), builder);
        self
    }

    /// Start the dispatcher; must be called inside a tokio runtime
    pub fn build(self) -> BuildQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState {
            builders: self.builders,
            resolver: self.resolver,
            output_root: self.output_root,
            install_deps: self.install_deps,
            store: self.store,
            phases: DashMap::new(),
            cancelled: DashSet::new(),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        tokio::spawn(dispatch(Arc::clone(&state), rx, self.concurrency));
        info!(concurrency = self.concurrency, "Build queue started");

        BuildQueue {
            state,
            tx,
            concurrency: self.concurrency,
        }
    }
}

async fn dispatch(state: Arc<QueueState>, mut rx: mpsc::UnboundedReceiver<QueuedBuild>, concurrency: usize) {
    let slots = Arc::new(Semaphore::new(concurrency));
    loop {
        // Slot first, then dequeue: keeps strict FIFO start order
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let Some(queued) = rx.recv().await else {
            break;
        };

        state.queued.fetch_sub(1, Ordering::SeqCst);
        state.running.fetch_add(1, Ordering::SeqCst);
        state.phases.insert(queued.build_id.clone(), BuildPhase::Running);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let QueuedBuild { build_id, job, reply } = queued;
            let slot = RunningSlot {
                state: Arc::clone(&state),
                build_id: build_id.clone(),
                _permit: permit,
            };

            let outcome = AssertUnwindSafe(state.execute(&build_id, job.clone()))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(build_id = %build_id, spinlet_id = %job.spinlet_id, panic = %message, "Builder panicked");
                    let framework = job.framework.clone().unwrap_or(Framework::Other("unknown".to_string()));
                    let result = BuildResult::failed(&build_id, &job, framework, vec![format!("builder panicked: {}", message)]);
                    state.record(&job, &result).await;
                    result
                }
            };
            drop(slot);

            if reply.send(result).is_err() {
                debug!(build_id = %build_id, "Build result dropped; nobody was waiting");
            }
        });
    }
    debug!("Build dispatcher stopped");
}

/// Frees the concurrency slot and running count even if the build panicked
struct RunningSlot {
    state: Arc<QueueState>,
    build_id: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.state.phases.remove(&self.build_id);
        self.state.cancelled.remove(&self.build_id);
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        if self.state.is_idle() {
            self.state.idle.notify_waiters();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && self.running.load(Ordering::SeqCst) == 0
    }

    fn is_cancelled(&self, build_id: &str) -> bool {
        self.cancelled.contains(build_id)
    }

    async fn execute(&self, build_id: &str, mut job: BuildJob) -> BuildResult {
        let started = Instant::now();
        if job.output_dir.is_none() {
            job.output_dir = Some(self.output_root.join(&job.tenant_id).join(&job.spinlet_id));
        }
        job.install_deps &= self.install_deps;

        if self.is_cancelled(build_id) {
            info!(build_id, "Skipping cancelled build");
            let mut result = BuildResult::failed(
                build_id,
                &job,
                job.framework.clone().unwrap_or(Framework::Other("unknown".to_string())),
                vec!["build was cancelled before it started".to_string()],
            );
            result.cancelled = true;
            self.record(&job, &result).await;
            return result;
        }

        info!(
            build_id,
            tenant_id = %job.tenant_id,
            spinlet_id = %job.spinlet_id,
            "Starting build"
        );
        self.record_status(&job.spinlet_id, build_id, "building", &[]).await;

        let mut framework = job.framework.clone();
        let outcome = self.run(build_id, &mut job, &mut framework).await;
        let framework = framework.unwrap_or(Framework::Other("unknown".to_string()));

        let mut result = match outcome {
            Ok((artifact, size_bytes)) => BuildResult {
                build_id: build_id.to_string(),
                tenant_id: job.tenant_id.clone(),
                spinlet_id: job.spinlet_id.clone(),
                success: true,
                framework,
                entry_point: artifact.entry_point,
                artifact_path: job.output_dir.clone().unwrap_or_default(),
                duration_ms: 0,
                size_bytes,
                errors: Vec::new(),
                warnings: artifact.warnings,
                cancelled: false,
            },
            Err(e) => {
                let errors: Vec<String> = e.chain().map(|cause| cause.to_string()).collect();
                error!(build_id, spinlet_id = %job.spinlet_id, errors = ?errors, "Build failed");
                BuildResult::failed(build_id, &job, framework, errors)
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.cancelled = self.is_cancelled(build_id);

        if result.success {
            if let Err(e) = write_metadata(&result).await {
                warn!(build_id, error = %e, "Failed to write build metadata");
                result.warnings.push(format!("metadata not written: {}", e));
            }
        }

        info!(
            build_id,
            spinlet_id = %result.spinlet_id,
            success = result.success,
            cancelled = result.cancelled,
            framework = %result.framework,
            duration_ms = result.duration_ms,
            size_bytes = result.size_bytes,
            "Build finished"
        );
        self.record(&job, &result).await;
        result
    }

    async fn run(
        &self,
        build_id: &str,
        job: &mut BuildJob,
        framework: &mut Option<Framework>,
    ) -> anyhow::Result<(BuildArtifact, u64)> {
        if !job.source_dir.is_dir() {
            bail!("Source directory does not exist: {}", job.source_dir.display());
        }

        let spinfile = match Spinfile::load(&job.source_dir) {
            Ok(spinfile) => spinfile,
            Err(e) => {
                warn!(build_id, error = %format!("{:#}", e), "Ignoring unreadable spinfile");
                None
            }
        };
        if let Some(spinfile) = &spinfile {
            job.env.extend(spinfile.build_env());
        }

        // Pinned by the caller, then declared in the spinfile, then detected
        let resolved = match (job.framework.clone(), spinfile.as_ref().and_then(Spinfile::declared_framework)) {
            (Some(pinned), _) => pinned,
            (None, Some(declared)) => declared,
            (None, None) => self.resolver.detect(&job.source_dir),
        };
        *framework = Some(resolved.clone());
        job.framework = Some(resolved.clone());
        job.spinfile = spinfile;

        let builder = self
            .builders
            .get(&resolved)
            .with_context(|| format!("No builder available for framework: {}", resolved))?;

        if !builder.validate(&job.source_dir).await {
            bail!("Project does not appear to be a valid {} application", resolved);
        }

        let output = job.output()?.to_path_buf();
        tokio::fs::create_dir_all(&output)
            .await
            .with_context(|| format!("Failed to create {}", output.display()))?;

        debug!(build_id, framework = %resolved, output = %output.display(), "Running builder");
        let artifact = AssertUnwindSafe(builder.build(job))
            .catch_unwind()
            .await
            .map_err(|panic| anyhow::anyhow!("builder panicked: {}", panic_message(panic.as_ref())))??;

        let size_bytes = tokio::task::spawn_blocking(move || dir_size(&output))
            .await
            .context("size task panicked")?
            .context("Failed to measure artifact")?;
        Ok((artifact, size_bytes))
    }

    async fn record_status(&self, spinlet_id: &str, build_id: &str, status: &str, errors: &[String]) {
        let Some(store) = &self.store else { return };
        let value = json!({
            "status": status,
            "buildId": build_id,
            "timestamp": Utc::now().to_rfc3339(),
            "errors": errors,
        });
        if let Err(e) = store
            .set_ex(&keys::build_status(spinlet_id), &value.to_string(), STATUS_TTL)
            .await
        {
            warn!(build_id, error = %e, "Failed to record build status");
        }
    }

    async fn record(&self, job: &BuildJob, result: &BuildResult) {
        let status = if result.cancelled {
            "cancelled"
        } else if result.success {
            "success"
        } else {
            "failed"
        };
        self.record_status(&job.spinlet_id, &result.build_id, status, &result.errors)
            .await;

        let Some(store) = &self.store else { return };
        if !result.is_deployable() {
            return;
        }
        let stored = match serde_json::to_string(result) {
            Ok(json) => store
                .set_ex(&keys::build_result(&job.spinlet_id), &json, RESULT_TTL)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = stored {
            warn!(build_id = %result.build_id, error = %e, "Failed to record build result");
        }
    }
}

async fn write_metadata(result: &BuildResult) -> anyhow::Result<()> {
    let metadata = json!({
        "buildId": result.build_id,
        "tenantId": result.tenant_id,
        "spinletId": result.spinlet_id,
        "framework": result.framework,
        "entryPoint": result.entry_point,
        "builtAt": Utc::now().to_rfc3339(),
        "durationMs": result.duration_ms,
        "sizeBytes": result.size_bytes,
        "builder": format!("spinhost {}", env!("CARGO_PKG_VERSION")),
    });
    let path = result.artifact_path.join(METADATA_FILE);
    tokio::fs::write(&path, serde_json::to_vec_pretty(&metadata)?)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Eight hex characters from a v4 uuid
fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Fetch the last recorded build result for a spinlet
pub async fn last_result(store: &dyn ResourceStore, spinlet_id: &str) -> crate::error::Result<Option<BuildResult>> {
    match store.get(&keys::build_result(spinlet_id)).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Writes a marker file after a short delay
    struct SlowBuilder {
        delay: Duration,
    }

    #[async_trait]
    impl FrameworkBuilder for SlowBuilder {
        fn framework(&self) -> Framework {
            Framework::Static
        }

        async fn validate(&self, _source: &Path) -> bool {
            true
        }

        async fn build(&self, job: &BuildJob) -> anyhow::Result<BuildArtifact> {
            tokio::time::sleep(self.delay).await;
            fs::write(job.output()?.join("index.html"), "<html></html>")?;
            Ok(BuildArtifact {
                entry_point: Some("index.html".into()),
                warnings: Vec::new(),
            })
        }
    }

    fn settings(dir: &Path, concurrency: usize) -> BuildSettings {
        BuildSettings {
            concurrency,
            output_dir: dir.to_path_buf(),
            install_deps: false,
        }
    }

    #[test]
    fn test_short_id() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(short_id(), id);
    }

    #[tokio::test]
    async fn test_successful_build_writes_metadata_and_store() {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());

        let queue = BuildQueue::builder(&settings(out.path(), 1))
            .store(store.clone())
            .register(Arc::new(SlowBuilder {
                delay: Duration::from_millis(1),
            }))
            .build();

        let result = queue.build(BuildJob::new("t1", "site", source.path())).await;
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.framework, Framework::Static);
        assert_eq!(result.artifact_path, out.path().join("t1").join("site"));
        assert!(result.size_bytes > 0);

        let metadata = fs::read_to_string(result.artifact_path.join(METADATA_FILE)).unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(metadata["buildId"], result.build_id.as_str());

        let status = store.get(&keys::build_status("site")).await.unwrap().unwrap();
        assert!(status.contains("\"success\""));
        let stored = last_result(store.as_ref(), "site").await.unwrap().unwrap();
        assert_eq!(stored.build_id, result.build_id);
    }

    #[tokio::test]
    async fn test_missing_source_is_a_failed_result() {
        let out = TempDir::new().unwrap();
        let queue = BuildQueue::builder(&settings(out.path(), 2)).build();

        let result = queue
            .build(BuildJob::new("t1", "ghost", out.path().join("does-not-exist")))
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("Source directory does not exist"));
        assert!(result.launch_spec(Default::default()).is_err());
    }

    #[tokio::test]
    async fn test_unknown_framework_fails() {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let queue = BuildQueue::builder(&settings(out.path(), 1)).build();

        let cobol = Framework::Other("cobol".to_string());
        let job = BuildJob::new("t1", "svc", source.path()).with_framework(cobol.clone());
        let result = queue.build(job).await;
        assert!(!result.success);
        assert_eq!(result.framework, cobol);
        assert!(result.errors[0].contains("No builder available"));
    }

    #[tokio::test]
    async fn test_cancel_queued_build() {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let queue = BuildQueue::builder(&settings(out.path(), 1))
            .register(Arc::new(SlowBuilder {
                delay: Duration::from_millis(200),
            }))
            .build();

        let first = queue.submit(BuildJob::new("t", "a", source.path()));
        let second = queue.submit(BuildJob::new("t", "b", source.path()));
        assert!(queue.cancel(&second.build_id));
        assert!(!queue.cancel("nope"));

        let first = first.wait().await;
        let second = second.wait().await;
        assert!(first.success);
        assert!(!first.cancelled);
        assert!(second.cancelled);
        assert!(!second.is_deployable());
        assert!(!out.path().join("t").join("b").join("index.html").exists());
    }

    #[tokio::test]
    async fn test_wait_for_idle() {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let queue = BuildQueue::builder(&settings(out.path(), 2))
            .register(Arc::new(SlowBuilder {
                delay: Duration::from_millis(50),
            }))
            .build();

        queue.wait_for_idle().await;

        for i in 0..4 {
            let _ = queue.submit(BuildJob::new("t", format!("s{}", i), source.path()));
        }
        assert!(queue.queued() + queue.running() > 0);

        tokio::time::timeout(Duration::from_secs(5), queue.wait_for_idle())
            .await
            .unwrap();
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.running(), 0);
    }
}
