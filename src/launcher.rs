//! Process launching
//!
//! The orchestrator never touches OS process APIs directly; it goes through a
//! [`ProcessLauncher`]. [`LocalLauncher`] resolves a [`LaunchStrategy`] from a
//! registered framework table, spawns the resulting command and supervises the
//! child on a background task. Other launchers (and test fakes) build their
//! handles with [`ProcessHandle::channel`].

use crate::error::{Result, SpinError};
use crate::spinlet::{DeploymentMode, Framework, LaunchSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal on Unix
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to shut down (SIGTERM)
    Terminate,
    /// Force termination (SIGKILL)
    Kill,
}

pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Cloneable control side of a launched process
#[derive(Clone)]
pub struct ProcessControl {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<ProcessSignal>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver a signal; false if the process is already gone
    pub fn signal(&self, signal: ProcessSignal) -> bool {
        self.exit_status().is_none() && self.signals.send(signal).is_ok()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit
    ///
    /// Returns `None` if the supervisor went away without reporting an exit.
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await;
        result.ok().and_then(|status| *status)
    }
}

/// Supervisor side of a launched process
pub struct ProcessDriver {
    signals: mpsc::UnboundedReceiver<ProcessSignal>,
    exit: watch::Sender<Option<ProcessExit>>,
}

impl ProcessDriver {
    /// Next signal requested by the orchestrator
    pub async fn next_signal(&mut self) -> Option<ProcessSignal> {
        self.signals.recv().await
    }

    pub fn report_exit(&self, exit: ProcessExit) {
        self.exit.send_replace(Some(exit));
    }
}

/// A launched process: pid, output streams and exit notification
pub struct ProcessHandle {
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    control: ProcessControl,
}

impl ProcessHandle {
    /// Create a handle and the driver that reports on its behalf
    pub fn channel(pid: Option<u32>) -> (ProcessHandle, ProcessDriver) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle {
            stdout: None,
            stderr: None,
            control: ProcessControl {
                pid,
                signals: signal_tx,
                exit: exit_rx,
            },
        };
        let driver = ProcessDriver {
            signals: signal_rx,
            exit: exit_tx,
        };
        (handle, driver)
    }

    pub fn with_output(mut self, stdout: Option<OutputStream>, stderr: Option<OutputStream>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }
}

/// Command line produced by a launch strategy
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Defaults to the artifact path
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the launch environment
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Which HTTP answers count as "ready"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub path: String,
    /// Any HTTP response proves the server is up, even a 404
    pub accept_any: bool,
}

impl ReadinessPolicy {
    /// `GET /health` must return 200
    pub fn health_endpoint() -> Self {
        Self {
            path: "/health".to_string(),
            accept_any: false,
        }
    }

    /// Any response on `/` will do
    pub fn any_response() -> Self {
        Self {
            path: "/".to_string(),
            accept_any: true,
        }
    }

    pub fn accepts(&self, status: u16) -> bool {
        self.accept_any || status == 200
    }
}

/// Inputs available to a launch strategy
pub struct LaunchContext<'a> {
    pub spec: &'a LaunchSpec,
    pub port: u16,
    pub memory_mb: Option<u64>,
}

impl LaunchContext<'_> {
    pub fn artifact(&self) -> &Path {
        &self.spec.artifact_path
    }

    pub fn is_development(&self) -> bool {
        self.spec.mode == DeploymentMode::Development
    }

    fn startup_error(&self, reason: impl Into<String>) -> SpinError {
        SpinError::StartupFailed {
            spinlet_id: self.spec.spinlet_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Framework-specific command construction
pub trait LaunchStrategy: Send + Sync {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec>;

    fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy::health_endpoint()
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the spinlet's process on `port` with the given environment
    async fn launch(
        &self,
        spec: &LaunchSpec,
        port: u16,
        env: &HashMap<String, String>,
    ) -> Result<ProcessHandle>;

    fn readiness_policy(&self, framework: &Framework) -> ReadinessPolicy;
}

/// Environment every spinlet gets, with `LaunchSpec::env` applied last
pub fn base_env(spec: &LaunchSpec, port: u16) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("PORT".to_string(), port.to_string());
    env.insert("SPINLET_ID".to_string(), spec.spinlet_id.clone());
    env.insert("TENANT_ID".to_string(), spec.tenant_id.clone());
    env.insert("NODE_ENV".to_string(), spec.mode.node_env().to_string());
    for (key, value) in &spec.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

fn package_scripts(dir: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(dir.join("package.json")) else {
        return HashMap::new();
    };
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(pkg) => pkg
            .get("scripts")
            .and_then(|s| s.as_object())
            .map(|scripts| {
                scripts
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read package.json");
            HashMap::new()
        }
    }
}

/// `npm run dev` in development (falling back to start), `npm run start` otherwise
fn npm_script(ctx: &LaunchContext<'_>, dir: &Path) -> Option<CommandSpec> {
    let scripts = package_scripts(dir);
    let script = if ctx.is_development() && scripts.contains_key("dev") {
        "dev"
    } else {
        "start"
    };
    scripts
        .contains_key(script)
        .then(|| CommandSpec::new("npm", ["run", script]).with_cwd(dir))
}

fn with_heap_limit(command: CommandSpec, ctx: &LaunchContext<'_>) -> CommandSpec {
    match ctx.memory_mb {
        Some(mb) => command.with_env("NODE_OPTIONS", format!("--max-old-space-size={}", mb)),
        None => command,
    }
}

pub struct NextJsStrategy;

impl LaunchStrategy for NextJsStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        let artifact = ctx.artifact();
        let standalone = artifact.join(".next").join("standalone");
        if standalone.join("server.js").is_file() {
            let command = CommandSpec::new("node", ["server.js"])
                .with_cwd(standalone)
                .with_env("HOSTNAME", "0.0.0.0");
            return Ok(with_heap_limit(command, ctx));
        }

        // A `.next` build dir launches from its project root
        let root = if artifact.file_name().is_some_and(|n| n == ".next") {
            artifact.parent().unwrap_or(artifact)
        } else {
            artifact
        };

        let command = npm_script(ctx, root).unwrap_or_else(|| {
            let mode = if ctx.is_development() { "dev" } else { "start" };
            let port = ctx.port.to_string();
            let local_bin = root.join("node_modules").join(".bin").join("next");
            let command = if local_bin.is_file() {
                CommandSpec::new("node", [local_bin.display().to_string(), mode.into(), "-p".into(), port])
            } else {
                CommandSpec::new("npx", ["next".to_string(), mode.into(), "-p".into(), port])
            };
            command.with_cwd(root)
        });
        Ok(with_heap_limit(command, ctx))
    }

    fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy::any_response()
    }
}

pub struct RemixStrategy;

impl LaunchStrategy for RemixStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        let command = npm_script(ctx, ctx.artifact())
            .unwrap_or_else(|| CommandSpec::new("npm", ["run", "start"]));
        Ok(with_heap_limit(command, ctx))
    }
}

/// Plain Node servers: express, node and custom
pub struct NodeStrategy;

const NODE_ENTRY_POINTS: [&str; 4] = ["server.js", "index.js", "app.js", "main.js"];

impl LaunchStrategy for NodeStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        let artifact = ctx.artifact();
        if let Some(command) = npm_script(ctx, artifact) {
            return Ok(with_heap_limit(command, ctx));
        }

        let command = if artifact.is_file() {
            let dir = artifact.parent().unwrap_or(artifact);
            CommandSpec::new("node", [artifact.display().to_string()]).with_cwd(dir)
        } else {
            let entry = NODE_ENTRY_POINTS
                .iter()
                .find(|entry| artifact.join(entry).is_file())
                .ok_or_else(|| {
                    ctx.startup_error(format!(
                        "no start script or entry point ({}) in {}",
                        NODE_ENTRY_POINTS.join(", "),
                        artifact.display()
                    ))
                })?;
            CommandSpec::new("node", [*entry])
        };
        Ok(with_heap_limit(command, ctx))
    }
}

pub struct NestJsStrategy;

impl LaunchStrategy for NestJsStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        let artifact = ctx.artifact();
        let entry = if artifact.join("dist").join("main.js").is_file() {
            "dist/main.js"
        } else {
            "main.js"
        };
        Ok(with_heap_limit(CommandSpec::new("node", [entry]), ctx))
    }
}

/// Static sites and SPA builds (static, react, vue, astro)
pub struct StaticStrategy;

impl LaunchStrategy for StaticStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        if ctx.is_development() && ctx.spec.framework != Framework::Static {
            if let Some(command) = npm_script(ctx, ctx.artifact()) {
                return Ok(command);
            }
        }
        Ok(CommandSpec::new(
            "python3",
            ["-m".to_string(), "http.server".into(), ctx.port.to_string()],
        ))
    }

    fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy::any_response()
    }
}

/// Flutter web: the compiled bundle is served statically, development runs the web server device
pub struct FlutterStrategy;

impl LaunchStrategy for FlutterStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        if !ctx.is_development() {
            return StaticStrategy.command(ctx);
        }
        Ok(CommandSpec::new(
            "flutter",
            [
                "run".to_string(),
                "-d".into(),
                "web-server".into(),
                "--web-port".into(),
                ctx.port.to_string(),
            ],
        ))
    }

    fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy::any_response()
    }
}

/// Runs the artifact path as an image name via the docker CLI
pub struct DockerStrategy;

impl LaunchStrategy for DockerStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        let image = ctx.artifact().display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".into(),
            "--name".into(),
            format!("spinlet-{}", ctx.spec.spinlet_id),
            "-p".into(),
            format!("{}:80", ctx.port),
        ];
        if let Some(mb) = ctx.memory_mb {
            args.push("--memory".into());
            args.push(format!("{}m", mb));
        }
        if let Some(cpu) = &ctx.spec.resources.cpu {
            args.push("--cpus".into());
            args.push(cpu.clone());
        }
        args.push(image);
        Ok(CommandSpec::new("docker", args).with_cwd(std::env::temp_dir()))
    }
}

/// An arbitrary command line; `{port}` in any argument is replaced with the port
pub struct CommandStrategy {
    program: String,
    args: Vec<String>,
    readiness: ReadinessPolicy,
}

impl CommandStrategy {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            readiness: ReadinessPolicy::health_endpoint(),
        }
    }

    /// Split a shell-style command line
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut words = shell_words::split(command_line)
            .map_err(|e| SpinError::Config(format!("invalid command '{}': {}", command_line, e)))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| SpinError::Config("empty command".to_string()))?;
        Ok(Self::new(program, words))
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }
}

impl LaunchStrategy for CommandStrategy {
    fn command(&self, ctx: &LaunchContext<'_>) -> Result<CommandSpec> {
        let port = ctx.port.to_string();
        Ok(CommandSpec::new(
            self.program.clone(),
            self.args.iter().map(|a| a.replace("{port}", &port)),
        ))
    }

    fn readiness(&self) -> ReadinessPolicy {
        self.readiness.clone()
    }
}

/// Launches spinlets as local child processes
pub struct LocalLauncher {
    strategies: HashMap<Framework, Arc<dyn LaunchStrategy>>,
}

impl LocalLauncher {
    /// A launcher with no strategies registered
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// A launcher with every built-in framework registered
    pub fn new() -> Self {
        let node: Arc<dyn LaunchStrategy> = Arc::new(NodeStrategy);
        let static_site: Arc<dyn LaunchStrategy> = Arc::new(StaticStrategy);

        let mut launcher = Self::empty();
        launcher.register_shared(Framework::NextJs, Arc::new(NextJsStrategy));
        launcher.register_shared(Framework::Remix, Arc::new(RemixStrategy));
        launcher.register_shared(Framework::NestJs, Arc::new(NestJsStrategy));
        for framework in [Framework::Express, Framework::Node, Framework::Custom] {
            launcher.register_shared(framework, node.clone());
        }
        for framework in [Framework::Static, Framework::React, Framework::Vue, Framework::Astro] {
            launcher.register_shared(framework, static_site.clone());
        }
        launcher.register_shared(Framework::Flutter, Arc::new(FlutterStrategy));
        launcher.register_shared(Framework::Docker, Arc::new(DockerStrategy));
        launcher
    }

    pub fn register(&mut self, framework: Framework, strategy: impl LaunchStrategy + 'static) {
        self.register_shared(framework, Arc::new(strategy));
    }

    pub fn register_shared(&mut self, framework: Framework, strategy: Arc<dyn LaunchStrategy>) {
        self.strategies.insert(framework, strategy);
    }

    pub fn with_strategy(mut self, framework: Framework, strategy: impl LaunchStrategy + 'static) -> Self {
        self.register(framework, strategy);
        self
    }

    pub fn frameworks(&self) -> Vec<Framework> {
        self.strategies.keys().cloned().collect()
    }

    fn strategy(&self, framework: &Framework) -> Result<&Arc<dyn LaunchStrategy>> {
        self.strategies
            .get(framework)
            .ok_or_else(|| SpinError::LaunchStrategyMissing(framework.to_string()))
    }

    /// Resolve the command line without spawning anything
    pub fn resolve(&self, spec: &LaunchSpec, port: u16) -> Result<CommandSpec> {
        let strategy = self.strategy(&spec.framework)?;
        let ctx = LaunchContext {
            spec,
            port,
            memory_mb: spec.resources.memory_mb()?,
        };
        strategy.command(&ctx)
    }
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for LocalLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        port: u16,
        env: &HashMap<String, String>,
    ) -> Result<ProcessHandle> {
        let command = self.resolve(spec, port)?;
        let cwd = command.cwd.clone().unwrap_or_else(|| spec.artifact_path.clone());

        info!(
            spinlet_id = %spec.spinlet_id,
            framework = %spec.framework,
            port,
            program = %command.program,
            args = ?command.args,
            "Starting spinlet process"
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        cmd.current_dir(&cwd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.envs(env);
        cmd.envs(&command.env);
        // Own group so signals reach shells' and npm's children too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| SpinError::StartupFailed {
            spinlet_id: spec.spinlet_id.clone(),
            reason: format!("failed to spawn '{}': {}", command.program, e),
        })?;
        let pid = child.id();
        info!(spinlet_id = %spec.spinlet_id, pid = ?pid, "Spinlet process spawned");

        let stdout = child
            .stdout
            .take()
            .map(|s| Box::pin(s) as OutputStream);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::pin(s) as OutputStream);

        let (handle, driver) = ProcessHandle::channel(pid);
        tokio::spawn(supervise(child, driver, spec.spinlet_id.clone()));

        Ok(handle.with_output(stdout, stderr))
    }

    fn readiness_policy(&self, framework: &Framework) -> ReadinessPolicy {
        self.strategies
            .get(framework)
            .map(|s| s.readiness())
            .unwrap_or_else(ReadinessPolicy::health_endpoint)
    }
}

/// Own the child until it exits, relaying signals to it
async fn supervise(mut child: Child, mut driver: ProcessDriver, spinlet_id: String) {
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit = match status {
                    Ok(status) => ProcessExit::from(status),
                    Err(e) => {
                        warn!(spinlet_id = %spinlet_id, error = %e, "Error waiting for spinlet process");
                        ProcessExit { code: None, signal: None }
                    }
                };
                debug!(spinlet_id = %spinlet_id, status = %exit.describe(), "Spinlet process exited");
                driver.report_exit(exit);
                return;
            }
            Some(signal) = driver.next_signal() => signal_group(&mut child, &spinlet_id, signal),
        }
    }
}

/// Deliver `signal` to the child's process group
fn signal_group(child: &mut Child, spinlet_id: &str, signal: ProcessSignal) {
    let Some(pid) = child.id() else {
        return;
    };
    match signal {
        ProcessSignal::Terminate => info!(spinlet_id, pid, "Sending SIGTERM to spinlet"),
        ProcessSignal::Kill => warn!(spinlet_id, pid, "Sending SIGKILL to spinlet"),
    }

    #[cfg(unix)]
    {
        let sig = match signal {
            ProcessSignal::Terminate => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
        };
        // The child leads its group, so -pid names every descendant
        let delivered = unsafe { libc::kill(-(pid as i32), sig) } == 0;
        if !delivered {
            debug!(spinlet_id, pid, "Process group gone, signalling the child directly");
            unsafe {
                libc::kill(pid as i32, sig);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}
