//! Build queue tests: bounded concurrency, framework resolution and
//! failure isolation

use async_trait::async_trait;
use spinhost::build_queue::{last_result, BuildQueue, METADATA_FILE};
use spinhost::builder::{BuildArtifact, BuildJob, FrameworkBuilder};
use spinhost::config::BuildSettings;
use spinhost::spinlet::{DeploymentMode, Framework};
use spinhost::store::{keys, MemoryStore, ResourceStore};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Builder that records how many builds overlap
struct FakeBuilder {
    framework: Framework,
    delay: Duration,
    fail: bool,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    runs: AtomicUsize,
}

impl FakeBuilder {
    fn new(framework: Framework) -> Self {
        Self {
            framework,
            delay: Duration::from_millis(5),
            fail: false,
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl FrameworkBuilder for FakeBuilder {
    fn framework(&self) -> Framework {
        self.framework.clone()
    }

    async fn validate(&self, _source: &Path) -> bool {
        true
    }

    async fn build(&self, job: &BuildJob) -> anyhow::Result<BuildArtifact> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            anyhow::bail!("compiler exploded");
        }
        fs::write(job.output()?.join("server.js"), "console.log('hi')")?;
        Ok(BuildArtifact {
            entry_point: Some("server.js".to_string()),
            warnings: Vec::new(),
        })
    }
}

/// Builder whose build future panics
struct PanickingBuilder;

#[async_trait]
impl FrameworkBuilder for PanickingBuilder {
    fn framework(&self) -> Framework {
        Framework::Express
    }

    async fn validate(&self, _source: &Path) -> bool {
        true
    }

    async fn build(&self, _job: &BuildJob) -> anyhow::Result<BuildArtifact> {
        panic!("index out of bounds in bundler");
    }
}

fn settings(output: &Path, concurrency: usize) -> BuildSettings {
    BuildSettings {
        concurrency,
        output_dir: output.to_path_buf(),
        install_deps: false,
    }
}

fn project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_running_builds_never_exceed_concurrency() {
    let out = TempDir::new().unwrap();
    let builder = Arc::new(FakeBuilder::new(Framework::Static).slow(Duration::from_millis(100)));
    let queue = BuildQueue::builder(&settings(out.path(), 2))
        .register(builder.clone())
        .build();

    let sources: Vec<TempDir> = (0..6).map(|_| project(&[("index.html", "<html></html>")])).collect();
    let tickets: Vec<_> = sources
        .iter()
        .enumerate()
        .map(|(i, source)| queue.submit(BuildJob::new("tenant", format!("site-{i}"), source.path())))
        .collect();

    for ticket in tickets {
        let result = ticket.wait().await;
        assert!(result.success, "errors: {:?}", result.errors);
    }

    assert_eq!(builder.runs.load(Ordering::SeqCst), 6);
    assert_eq!(builder.max_seen.load(Ordering::SeqCst), 2);
    queue.wait_for_idle().await;
    assert_eq!(queue.queued(), 0);
    assert_eq!(queue.running(), 0);
}

#[tokio::test]
async fn test_meta_framework_wins_over_express() {
    let out = TempDir::new().unwrap();
    let next = Arc::new(FakeBuilder::new(Framework::NextJs));
    let express = Arc::new(FakeBuilder::new(Framework::Express));
    let queue = BuildQueue::builder(&settings(out.path(), 1))
        .register(next.clone())
        .register(express.clone())
        .build();

    let source = project(&[(
        "package.json",
        r#"{"name":"shop","dependencies":{"express":"^4.18.0","next":"^14.0.0"}}"#,
    )]);
    let result = queue.build(BuildJob::new("tenant", "shop", source.path())).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.framework, Framework::NextJs);
    assert_eq!(next.runs.load(Ordering::SeqCst), 1);
    assert_eq!(express.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_spinfile_framework_overrides_detection() {
    let out = TempDir::new().unwrap();
    let express = Arc::new(FakeBuilder::new(Framework::Express));
    let queue = BuildQueue::builder(&settings(out.path(), 1))
        .register(Arc::new(FakeBuilder::new(Framework::NextJs)))
        .register(express.clone())
        .build();

    let source = project(&[
        ("package.json", r#"{"dependencies":{"express":"^4","next":"14"}}"#),
        ("spinfile.yaml", "name: api\nframework: express\n"),
    ]);
    let result = queue.build(BuildJob::new("tenant", "api", source.path())).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.framework, Framework::Express);
    assert_eq!(express.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pinned_framework_beats_spinfile() {
    let out = TempDir::new().unwrap();
    let next = Arc::new(FakeBuilder::new(Framework::NextJs));
    let express = Arc::new(FakeBuilder::new(Framework::Express));
    let queue = BuildQueue::builder(&settings(out.path(), 1))
        .register(next.clone())
        .register(express.clone())
        .build();

    let source = project(&[
        ("package.json", r#"{"dependencies":{"express":"^4","next":"14"}}"#),
        ("spinfile.yaml", "name: api\nframework: express\n"),
    ]);
    let job = BuildJob::new("tenant", "api", source.path()).with_framework(Framework::NextJs);
    let result = queue.build(job).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.framework, Framework::NextJs);
    assert_eq!(next.runs.load(Ordering::SeqCst), 1);
    assert_eq!(express.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_builder_fails_without_wedging_queue() {
    let out = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let queue = BuildQueue::builder(&settings(out.path(), 1))
        .store(store.clone())
        .register(Arc::new(PanickingBuilder))
        .register(Arc::new(FakeBuilder::new(Framework::Static)))
        .build();

    let api = project(&[("package.json", r#"{"dependencies":{"express":"^4"}}"#)]);
    let site = project(&[("index.html", "<html></html>")]);

    let panicked = queue.submit(BuildJob::new("tenant", "api", api.path()));
    let next = queue.submit(BuildJob::new("tenant", "site", site.path()));

    let panicked = tokio::time::timeout(Duration::from_secs(5), panicked.wait())
        .await
        .unwrap();
    assert!(!panicked.success);
    assert_eq!(panicked.tenant_id, "tenant");
    assert_eq!(panicked.framework, Framework::Express);
    assert!(
        panicked
            .errors
            .iter()
            .any(|e| e.contains("builder panicked") && e.contains("index out of bounds")),
        "errors: {:?}",
        panicked.errors
    );
    assert!(store.get(&keys::build_status("api")).await.unwrap().is_some());

    let next = tokio::time::timeout(Duration::from_secs(5), next.wait())
        .await
        .unwrap();
    assert!(next.success, "errors: {:?}", next.errors);

    tokio::time::timeout(Duration::from_secs(5), queue.wait_for_idle())
        .await
        .unwrap();
    assert_eq!(queue.running(), 0);
    assert_eq!(queue.queued(), 0);
}

#[tokio::test]
async fn test_failed_build_does_not_block_the_next() {
    let out = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let queue = BuildQueue::builder(&settings(out.path(), 1))
        .store(store.clone())
        .register(Arc::new(FakeBuilder::new(Framework::Express).failing()))
        .register(Arc::new(FakeBuilder::new(Framework::Static)))
        .build();

    let broken = project(&[("package.json", r#"{"dependencies":{"express":"^4"}}"#)]);
    let site = project(&[("index.html", "<html></html>")]);

    let failed = queue.submit(BuildJob::new("tenant", "api", broken.path()));
    let succeeded = queue.submit(BuildJob::new("tenant", "site", site.path()));

    let failed = failed.wait().await;
    assert!(!failed.success);
    assert!(
        failed.errors.iter().any(|e| e.contains("compiler exploded")),
        "errors: {:?}",
        failed.errors
    );
    assert!(failed.launch_spec(DeploymentMode::Production).is_err());
    assert!(!failed.artifact_path.join(METADATA_FILE).exists());

    let succeeded = succeeded.wait().await;
    assert!(succeeded.success, "errors: {:?}", succeeded.errors);

    // Only deployable results are kept; status is recorded for both
    assert!(last_result(store.as_ref(), "api").await.unwrap().is_none());
    assert!(store.get(&keys::build_status("api")).await.unwrap().is_some());
    let stored = last_result(store.as_ref(), "site").await.unwrap().unwrap();
    assert_eq!(stored.build_id, succeeded.build_id);
}

#[tokio::test]
async fn test_static_site_builds_into_launchable_artifact() {
    let out = TempDir::new().unwrap();
    let queue = BuildQueue::builder(&settings(out.path(), 1)).build();

    let site = project(&[
        ("index.html", "<html><body>hello</body></html>"),
        ("assets/app.css", "body { margin: 0 }"),
    ]);
    let result = queue.build(BuildJob::new("tenant", "landing", site.path())).await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.framework, Framework::Static);
    assert!(result.artifact_path.join("index.html").exists());
    assert!(result.size_bytes > 0);

    let spec = result.launch_spec(DeploymentMode::Production).unwrap();
    assert_eq!(spec.tenant_id, "tenant");
    assert_eq!(spec.spinlet_id, "landing");
    assert_eq!(spec.framework, Framework::Static);
    assert_eq!(spec.artifact_path, result.artifact_path);
    assert_eq!(spec.mode, DeploymentMode::Production);
}
