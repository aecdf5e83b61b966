//! Framework builders
//!
//! Each builder turns a source tree into a runnable artifact directory:
//! - Next.js: install, `next build`, copy the standalone server (or `.next`)
//! - Remix: install, `remix build`, copy `build/` and `public/`
//! - Express / Node: install, optional TypeScript compile, copy the app
//! - NestJS: install, `nest build`, copy `dist/` with the package manifest
//! - React / Vue / Astro: install, `npm run build`, copy the bundle in `dist/` or `build/`
//! - Flutter: `flutter pub get`, `flutter build web`, copy `build/web`
//! - Static: optional build script, copy the directory holding `index.html`

use crate::detect::{PackageManifest, STATIC_INDICATORS};
use crate::error::SpinError;
use crate::spinfile::Spinfile;
use crate::spinlet::{DeploymentMode, Framework, LaunchSpec};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Lockfiles copied next to a Node artifact
const LOCKFILES: [&str; 3] = ["package-lock.json", "yarn.lock", "pnpm-lock.yaml"];

/// Never copied into an artifact
const SKIP_ALWAYS: [&str; 2] = [".git", ".spinhost.json"];

/// A request to build one spinlet's source tree
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub tenant_id: String,
    pub spinlet_id: String,
    pub source_dir: PathBuf,
    /// Defaults to `<build output dir>/<tenant>/<spinlet>` when queued
    pub output_dir: Option<PathBuf>,
    /// Pinned framework; detected when `None`
    pub framework: Option<Framework>,
    pub env: HashMap<String, String>,
    pub install_deps: bool,
    /// Filled in by the queue from the project's spinfile
    pub spinfile: Option<Spinfile>,
}

impl BuildJob {
    pub fn new(
        tenant_id: impl Into<String>,
        spinlet_id: impl Into<String>,
        source_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            spinlet_id: spinlet_id.into(),
            source_dir: source_dir.into(),
            output_dir: None,
            framework: None,
            env: HashMap::new(),
            install_deps: true,
            spinfile: None,
        }
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    pub fn with_framework(mut self, framework: Framework) -> Self {
        self.framework = Some(framework);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn without_install(mut self) -> Self {
        self.install_deps = false;
        self
    }

    /// Output directory; only valid once the queue has assigned one
    pub fn output(&self) -> Result<&Path> {
        self.output_dir
            .as_deref()
            .context("build job has no output directory")
    }

    fn should_install(&self) -> bool {
        self.install_deps && self.spinfile.as_ref().map_or(true, Spinfile::install_enabled)
    }

    fn build_command(&self) -> Option<&str> {
        self.spinfile.as_ref()?.build.command.as_deref()
    }

    fn install_command(&self) -> Option<&str> {
        self.spinfile.as_ref()?.install.command.as_deref()
    }

    fn declared_entry_point(&self) -> Option<&str> {
        self.spinfile.as_ref()?.runtime.entry_point.as_deref()
    }
}

/// What a builder produced, before the queue adds timing and size
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildArtifact {
    /// Entry point relative to the artifact directory
    pub entry_point: Option<String>,
    pub warnings: Vec<String>,
}

/// Outcome of a build; failures are data, never errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub build_id: String,
    pub tenant_id: String,
    pub spinlet_id: String,
    pub success: bool,
    pub framework: Framework,
    pub entry_point: Option<String>,
    pub artifact_path: PathBuf,
    pub duration_ms: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl BuildResult {
    pub fn failed(build_id: &str, job: &BuildJob, framework: Framework, errors: Vec<String>) -> Self {
        Self {
            build_id: build_id.to_string(),
            tenant_id: job.tenant_id.clone(),
            spinlet_id: job.spinlet_id.clone(),
            success: false,
            framework,
            entry_point: None,
            artifact_path: job.output_dir.clone().unwrap_or_default(),
            duration_ms: 0,
            size_bytes: 0,
            errors,
            warnings: Vec::new(),
            cancelled: false,
        }
    }

    /// Whether the artifact may be launched
    pub fn is_deployable(&self) -> bool {
        self.success && !self.cancelled
    }

    /// Launch spec for the built artifact
    pub fn launch_spec(&self, mode: DeploymentMode) -> crate::error::Result<LaunchSpec> {
        if !self.is_deployable() {
            let mut errors = self.errors.clone();
            if self.cancelled {
                errors.push("build was cancelled".to_string());
            }
            if errors.is_empty() {
                errors.push("build did not succeed".to_string());
            }
            return Err(SpinError::BuildFailed(errors));
        }

        Ok(LaunchSpec::new(
            self.tenant_id.clone(),
            self.spinlet_id.clone(),
            self.artifact_path.clone(),
            self.framework.clone(),
        )
        .with_mode(mode))
    }
}

/// Framework-specific build strategy
#[async_trait]
pub trait FrameworkBuilder: Send + Sync {
    fn framework(&self) -> Framework;

    /// Whether `source` looks like a project this builder can handle
    async fn validate(&self, source: &Path) -> bool;

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact>;
}

/// Run a command, streaming its output to the log
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<()> {
    info!(program, args = ?args, cwd = %cwd.display(), "Running build command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    // Last stderr lines go into the error if the command fails
    let mut tail: Vec<String> = Vec::new();
    let (mut stdout_done, mut stderr_done) = (false, false);

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => match line {
                Ok(Some(line)) => debug!(target: "build", "{}", line),
                Ok(None) => stdout_done = true,
                Err(e) => {
                    warn!(error = %e, "Error reading build stdout");
                    stdout_done = true;
                }
            },
            line = stderr_lines.next_line(), if !stderr_done => match line {
                Ok(Some(line)) => {
                    warn!(target: "build", "{}", line);
                    if tail.len() == 20 {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                Ok(None) => stderr_done = true,
                Err(e) => {
                    warn!(error = %e, "Error reading build stderr");
                    stderr_done = true;
                }
            },
        }
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for '{}'", program))?;

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        error!(program, code = %code, "Build command failed");
        if tail.is_empty() {
            bail!("Command failed: {} {} (exit {})", program, args.join(" "), code);
        }
        bail!(
            "Command failed: {} {} (exit {}): {}",
            program,
            args.join(" "),
            code,
            tail.join("\n")
        );
    }
    Ok(())
}

/// Run a shell-style command line such as `npm run build`
pub async fn run_command_line(line: &str, cwd: &Path, env: &HashMap<String, String>) -> Result<()> {
    let mut words = shell_words::split(line)
        .with_context(|| format!("Invalid command line: {}", line))?
        .into_iter();
    let Some(program) = words.next() else {
        bail!("Empty command line");
    };
    let args: Vec<String> = words.collect();
    run_command(&program, &args, cwd, env).await
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Install command chosen by lockfile: pnpm, yarn, npm ci, npm install
pub fn install_command(source: &Path) -> (&'static str, Vec<String>) {
    if source.join("pnpm-lock.yaml").exists() {
        ("pnpm", strings(&["install", "--frozen-lockfile"]))
    } else if source.join("yarn.lock").exists() {
        ("yarn", strings(&["install", "--frozen-lockfile"]))
    } else if source.join("package-lock.json").exists() {
        ("npm", strings(&["ci"]))
    } else {
        ("npm", strings(&["install"]))
    }
}

async fn install_dependencies(job: &BuildJob) -> Result<()> {
    if !job.should_install() {
        debug!(spinlet_id = %job.spinlet_id, "Skipping dependency install");
        return Ok(());
    }
    if !job.source_dir.join("package.json").exists() {
        bail!("No package.json found in {}", job.source_dir.display());
    }

    if let Some(line) = job.install_command() {
        return run_command_line(line, &job.source_dir, &job.env)
            .await
            .context("Dependency install failed");
    }

    let (program, args) = install_command(&job.source_dir);
    info!(spinlet_id = %job.spinlet_id, program, "Installing dependencies");
    run_command(program, &args, &job.source_dir, &job.env)
        .await
        .context("Dependency install failed")
}

/// Run the spinfile build command, or `npm run build` if the project has one
async fn run_build_script(job: &BuildJob, manifest: Option<&PackageManifest>, required: bool) -> Result<()> {
    if let Some(line) = job.build_command() {
        return run_command_line(line, &job.source_dir, &job.env)
            .await
            .context("Build step failed");
    }
    if manifest.is_some_and(|m| m.has_script("build")) {
        return run_command("npm", &strings(&["run", "build"]), &job.source_dir, &job.env)
            .await
            .context("Build step failed");
    }
    if required {
        bail!("package.json has no build script");
    }
    Ok(())
}

/// Recursively copy `from` into `to`, skipping top-level names in `skip`
pub fn copy_tree(from: &Path, to: &Path, skip: &[&str]) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if skip.contains(&name_str.as_ref()) || SKIP_ALWAYS.contains(&name_str.as_ref()) {
            continue;
        }
        copy_path(&entry.path(), &to.join(&name))?;
    }
    Ok(())
}

fn copy_path(from: &Path, to: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    if meta.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_path(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else if meta.file_type().is_symlink() {
        // Follow links so the artifact is self-contained
        if let Ok(target_meta) = std::fs::metadata(from) {
            if target_meta.is_dir() {
                let resolved = std::fs::canonicalize(from)?;
                copy_path(&resolved, to)?;
            } else {
                std::fs::copy(from, to)?;
            }
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}

/// Copy the listed entries that exist in `from` into `to`
pub fn copy_entries(from: &Path, to: &Path, entries: &[&str]) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in entries {
        let source = from.join(entry);
        if source.exists() {
            copy_path(&source, &to.join(entry))?;
        }
    }
    Ok(())
}

/// Total size of all files under `path`
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += dir_size(&entry?.path())?;
    }
    Ok(total)
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("filesystem task panicked")?
        .map_err(anyhow::Error::from)
}

pub struct NextJsBuilder;

#[async_trait]
impl FrameworkBuilder for NextJsBuilder {
    fn framework(&self) -> Framework {
        Framework::NextJs
    }

    async fn validate(&self, source: &Path) -> bool {
        PackageManifest::read(source).is_some_and(|m| m.depends_on("next"))
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();
        let manifest = PackageManifest::read(&source).context("Failed to read package.json")?;

        info!(spinlet_id = %job.spinlet_id, app = ?manifest.name, "Building Next.js application");
        install_dependencies(job).await?;
        run_build_script(job, Some(&manifest), true).await?;

        let standalone = source.join(".next").join("standalone");
        let mut artifact = BuildArtifact::default();

        if standalone.is_dir() {
            info!(spinlet_id = %job.spinlet_id, "Using standalone output");
            blocking(move || {
                copy_tree(&standalone, &output, &[])?;
                copy_entries(&source.join(".next"), &output.join(".next"), &["static"])?;
                copy_entries(&source, &output, &["public"])
            })
            .await?;
            artifact.entry_point = Some("server.js".to_string());
        } else {
            artifact
                .warnings
                .push("no standalone output; artifact includes node_modules".to_string());
            blocking(move || {
                let mut entries = vec![
                    "package.json",
                    "next.config.js",
                    "next.config.mjs",
                    "next.config.ts",
                    ".next",
                    "public",
                    "node_modules",
                    ".env.production",
                ];
                entries.extend(LOCKFILES);
                copy_entries(&source, &output, &entries)
            })
            .await?;
            artifact.entry_point = Some("npm start".to_string());
        }

        if let Some(entry) = job.declared_entry_point() {
            artifact.entry_point = Some(entry.to_string());
        }
        Ok(artifact)
    }
}

pub struct RemixBuilder;

#[async_trait]
impl FrameworkBuilder for RemixBuilder {
    fn framework(&self) -> Framework {
        Framework::Remix
    }

    async fn validate(&self, source: &Path) -> bool {
        PackageManifest::read(source).is_some_and(|m| m.depends_on_prefix("@remix-run/"))
            || source.join("remix.config.js").exists()
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();
        let manifest = PackageManifest::read(&source).context("Failed to read package.json")?;

        info!(spinlet_id = %job.spinlet_id, app = ?manifest.name, "Building Remix application");
        install_dependencies(job).await?;
        run_build_script(job, Some(&manifest), true).await?;

        if !source.join("build").exists() {
            bail!("Remix build produced no build/ directory");
        }

        blocking(move || {
            let mut entries = vec![
                "build",
                "public",
                "package.json",
                "remix.config.js",
                "node_modules",
            ];
            entries.extend(LOCKFILES);
            copy_entries(&source, &output, &entries)
        })
        .await?;

        let entry = job.declared_entry_point().unwrap_or("npm start");
        Ok(BuildArtifact {
            entry_point: Some(entry.to_string()),
            warnings: Vec::new(),
        })
    }
}

/// Entry points tried in order after `main`
const NODE_ENTRIES: [&str; 9] = [
    "server.js",
    "app.js",
    "index.js",
    "dist/index.js",
    "dist/server.js",
    "dist/app.js",
    "build/index.js",
    "build/server.js",
    "build/app.js",
];

/// Express and plain Node applications
pub struct NodeBuilder {
    framework: Framework,
}

impl NodeBuilder {
    pub fn express() -> Self {
        Self {
            framework: Framework::Express,
        }
    }

    pub fn node() -> Self {
        Self {
            framework: Framework::Node,
        }
    }

    fn find_entry(output: &Path, manifest: Option<&PackageManifest>) -> Option<String> {
        manifest
            .and_then(|m| m.main.clone())
            .into_iter()
            .chain(NODE_ENTRIES.iter().map(|e| e.to_string()))
            .find(|entry| output.join(entry).is_file())
    }
}

#[async_trait]
impl FrameworkBuilder for NodeBuilder {
    fn framework(&self) -> Framework {
        self.framework.clone()
    }

    async fn validate(&self, source: &Path) -> bool {
        match PackageManifest::read(source) {
            Some(manifest) if self.framework == Framework::Express => manifest.depends_on("express"),
            Some(_) => true,
            None => false,
        }
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();
        let manifest = PackageManifest::read(&source);

        info!(spinlet_id = %job.spinlet_id, framework = %self.framework, "Building Node application");
        install_dependencies(job).await?;

        if source.join("tsconfig.json").exists() {
            let has_build = manifest.as_ref().is_some_and(|m| m.has_script("build"));
            if job.build_command().is_some() || has_build {
                run_build_script(job, manifest.as_ref(), true).await?;
            } else {
                run_command("npx", &strings(&["tsc"]), &source, &job.env)
                    .await
                    .context("TypeScript compile failed")?;
            }
        } else {
            run_build_script(job, manifest.as_ref(), false).await?;
        }

        let copy_to = output.clone();
        blocking(move || copy_tree(&source, &copy_to, &[])).await?;

        let entry = match job.declared_entry_point() {
            Some(entry) => entry.to_string(),
            None => Self::find_entry(&output, manifest.as_ref())
                .context("Could not find an entry point for the application")?,
        };
        Ok(BuildArtifact {
            entry_point: Some(entry),
            warnings: Vec::new(),
        })
    }
}

pub struct NestJsBuilder;

#[async_trait]
impl FrameworkBuilder for NestJsBuilder {
    fn framework(&self) -> Framework {
        Framework::NestJs
    }

    async fn validate(&self, source: &Path) -> bool {
        PackageManifest::read(source).is_some_and(|m| m.depends_on("@nestjs/core"))
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();
        let manifest = PackageManifest::read(&source).context("Failed to read package.json")?;

        info!(spinlet_id = %job.spinlet_id, app = ?manifest.name, "Building NestJS application");
        install_dependencies(job).await?;

        if job.build_command().is_some() || manifest.has_script("build") {
            run_build_script(job, Some(&manifest), true).await?;
        } else {
            run_command("npx", &strings(&["nest", "build"]), &source, &job.env)
                .await
                .context("Build step failed")?;
        }

        if !source.join("dist").join("main.js").is_file() {
            bail!("NestJS build produced no dist/main.js");
        }

        blocking(move || {
            let mut entries = vec![
                "dist",
                "package.json",
                "nest-cli.json",
                "public",
                "views",
                "node_modules",
                ".env.production",
            ];
            entries.extend(LOCKFILES);
            copy_entries(&source, &output, &entries)
        })
        .await?;

        let entry = job.declared_entry_point().unwrap_or("dist/main.js");
        Ok(BuildArtifact {
            entry_point: Some(entry.to_string()),
            warnings: Vec::new(),
        })
    }
}

/// Where SPA toolchains write their bundle, in order
const SPA_OUTPUT_DIRS: [&str; 3] = ["dist", "build", "out"];

/// Single-page apps compiled to a static bundle: React, Vue and Astro
pub struct SpaBuilder {
    framework: Framework,
    package: &'static str,
}

impl SpaBuilder {
    pub fn react() -> Self {
        Self {
            framework: Framework::React,
            package: "react",
        }
    }

    pub fn vue() -> Self {
        Self {
            framework: Framework::Vue,
            package: "vue",
        }
    }

    pub fn astro() -> Self {
        Self {
            framework: Framework::Astro,
            package: "astro",
        }
    }

    fn bundle_dir(source: &Path) -> Option<&'static str> {
        SPA_OUTPUT_DIRS
            .iter()
            .find(|dir| source.join(dir).join("index.html").is_file())
            .copied()
    }
}

#[async_trait]
impl FrameworkBuilder for SpaBuilder {
    fn framework(&self) -> Framework {
        self.framework.clone()
    }

    async fn validate(&self, source: &Path) -> bool {
        let Some(manifest) = PackageManifest::read(source) else {
            return false;
        };
        // React under a meta-framework belongs to that framework's builder
        if self.framework == Framework::React
            && (manifest.depends_on("next") || manifest.depends_on_prefix("@remix-run/"))
        {
            return false;
        }
        manifest.depends_on(self.package)
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();
        let manifest = PackageManifest::read(&source).context("Failed to read package.json")?;

        info!(spinlet_id = %job.spinlet_id, framework = %self.framework, app = ?manifest.name, "Building single-page application");
        install_dependencies(job).await?;
        run_build_script(job, Some(&manifest), true).await?;

        let bundle = Self::bundle_dir(&source).with_context(|| {
            format!(
                "Build output not found (looked for index.html in {})",
                SPA_OUTPUT_DIRS.join(", ")
            )
        })?;
        debug!(spinlet_id = %job.spinlet_id, bundle, "Copying bundle");

        let from = source.join(bundle);
        blocking(move || copy_tree(&from, &output, &[])).await?;

        Ok(BuildArtifact {
            entry_point: Some("index.html".to_string()),
            warnings: Vec::new(),
        })
    }
}

pub struct FlutterBuilder;

#[async_trait]
impl FrameworkBuilder for FlutterBuilder {
    fn framework(&self) -> Framework {
        Framework::Flutter
    }

    async fn validate(&self, source: &Path) -> bool {
        tokio::fs::read_to_string(source.join("pubspec.yaml"))
            .await
            .is_ok_and(|pubspec| pubspec.contains("flutter:"))
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();

        info!(spinlet_id = %job.spinlet_id, "Building Flutter web application");
        if job.should_install() {
            let installed = match job.install_command() {
                Some(line) => run_command_line(line, &source, &job.env).await,
                None => run_command("flutter", &strings(&["pub", "get"]), &source, &job.env).await,
            };
            installed.context("Dependency install failed")?;
        }

        let built = match job.build_command() {
            Some(line) => run_command_line(line, &source, &job.env).await,
            None => {
                let args = strings(&["build", "web", "--release"]);
                run_command("flutter", &args, &source, &job.env).await
            }
        };
        built.context("Build step failed")?;

        let web = source.join("build").join("web");
        if !web.join("index.html").is_file() {
            bail!("Flutter web build output not found");
        }
        blocking(move || copy_tree(&web, &output, &[])).await?;

        Ok(BuildArtifact {
            entry_point: Some("index.html".to_string()),
            warnings: Vec::new(),
        })
    }
}

/// Directories searched for `index.html`, in order
const STATIC_DIRS: [&str; 5] = ["dist", "build", "public", "out", "."];

pub struct StaticBuilder;

impl StaticBuilder {
    fn site_root(source: &Path) -> &'static str {
        STATIC_DIRS
            .iter()
            .find(|dir| source.join(dir).join("index.html").is_file())
            .copied()
            .unwrap_or(".")
    }
}

#[async_trait]
impl FrameworkBuilder for StaticBuilder {
    fn framework(&self) -> Framework {
        Framework::Static
    }

    async fn validate(&self, source: &Path) -> bool {
        STATIC_INDICATORS.iter().any(|file| source.join(file).exists())
            || PackageManifest::read(source).is_some_and(|m| m.has_script("build"))
    }

    async fn build(&self, job: &BuildJob) -> Result<BuildArtifact> {
        let source = job.source_dir.clone();
        let output = job.output()?.to_path_buf();

        if let Some(manifest) = PackageManifest::read(&source) {
            if manifest.has_dependencies() {
                install_dependencies(job).await?;
            }
            run_build_script(job, Some(&manifest), false).await?;
        }

        let root = Self::site_root(&source);
        info!(spinlet_id = %job.spinlet_id, root, "Packaging static site");

        let from = source.join(root);
        let to = output.clone();
        if root == "." {
            blocking(move || copy_tree(&from, &to, &["node_modules", ".next", ".cache", "src"]))
                .await?;
        } else {
            blocking(move || copy_tree(&from, &to, &[])).await?;
        }

        if !output.join("index.html").is_file() {
            bail!("Static site has no index.html");
        }
        Ok(BuildArtifact {
            entry_point: Some("index.html".to_string()),
            warnings: Vec::new(),
        })
    }
}
