//! Framework detection for source trees
//!
//! Detectors run in descending priority and the first match wins, so a
//! meta-framework (Next.js, Remix) always beats the generic library it is
//! built on (Express) or a bare static site.

use crate::spinfile::Spinfile;
use crate::spinlet::Framework;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// The parts of `package.json` detection and builds look at
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub scripts: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: HashMap<String, serde_json::Value>,
}

impl PackageManifest {
    /// Read `<dir>/package.json`; `None` if missing or unparseable
    pub fn read(dir: &Path) -> Option<Self> {
        let path = dir.join("package.json");
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unparseable package.json");
                None
            }
        }
    }

    /// Runtime or dev dependency
    pub fn depends_on(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }

    pub fn depends_on_prefix(&self, prefix: &str) -> bool {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .any(|name| name.starts_with(prefix))
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty() || !self.dev_dependencies.is_empty()
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }
}

pub trait FrameworkDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher runs first
    fn priority(&self) -> u32;

    fn detect(&self, source: &Path) -> Option<Framework>;
}

fn any_exists(source: &Path, files: &[&str]) -> bool {
    files.iter().any(|file| source.join(file).exists())
}

pub struct NextJsDetector;

impl FrameworkDetector for NextJsDetector {
    fn name(&self) -> &'static str {
        "nextjs"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn detect(&self, source: &Path) -> Option<Framework> {
        let by_manifest = PackageManifest::read(source).is_some_and(|m| m.depends_on("next"));
        let by_config = any_exists(source, &["next.config.js", "next.config.mjs", "next.config.ts"]);
        (by_manifest || by_config).then_some(Framework::NextJs)
    }
}

pub struct RemixDetector;

impl FrameworkDetector for RemixDetector {
    fn name(&self) -> &'static str {
        "remix"
    }

    fn priority(&self) -> u32 {
        9
    }

    fn detect(&self, source: &Path) -> Option<Framework> {
        let by_manifest =
            PackageManifest::read(source).is_some_and(|m| m.depends_on_prefix("@remix-run/"));
        let by_config = any_exists(source, &["remix.config.js", "remix.config.mjs"]);
        (by_manifest || by_config).then_some(Framework::Remix)
    }
}

pub struct ExpressDetector;

impl FrameworkDetector for ExpressDetector {
    fn name(&self) -> &'static str {
        "express"
    }

    fn priority(&self) -> u32 {
        5
    }

    fn detect(&self, source: &Path) -> Option<Framework> {
        let manifest = PackageManifest::read(source)?;
        // Next and Remix apps frequently pull in express themselves
        let is_express = manifest.depends_on("express")
            && !manifest.depends_on("next")
            && !manifest.depends_on_prefix("@remix-run/");
        is_express.then_some(Framework::Express)
    }
}

/// Files that mark a plain static site
pub const STATIC_INDICATORS: [&str; 5] = [
    "index.html",
    "index.htm",
    "public/index.html",
    "dist/index.html",
    "build/index.html",
];

pub struct StaticDetector;

impl FrameworkDetector for StaticDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn detect(&self, source: &Path) -> Option<Framework> {
        any_exists(source, &STATIC_INDICATORS).then_some(Framework::Static)
    }
}

/// Priority-ordered detector chain
pub struct FrameworkResolver {
    detectors: Vec<Box<dyn FrameworkDetector>>,
}

impl FrameworkResolver {
    /// Resolver with no detectors; everything falls back to static
    pub fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    pub fn new() -> Self {
        let mut resolver = Self::empty();
        resolver.register(NextJsDetector);
        resolver.register(RemixDetector);
        resolver.register(ExpressDetector);
        resolver.register(StaticDetector);
        resolver
    }

    /// Add a detector, keeping the chain sorted by descending priority
    pub fn register(&mut self, detector: impl FrameworkDetector + 'static) {
        self.detectors.push(Box::new(detector));
        // Stable: equal priorities keep registration order
        self.detectors.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn detectors(&self) -> impl Iterator<Item = &dyn FrameworkDetector> {
        self.detectors.iter().map(|d| d.as_ref())
    }

    /// Run the detector chain; static if nothing matches
    pub fn detect(&self, source: &Path) -> Framework {
        for detector in &self.detectors {
            if let Some(framework) = detector.detect(source) {
                info!(
                    source = %source.display(),
                    detector = detector.name(),
                    framework = %framework,
                    "Detected framework"
                );
                return framework;
            }
        }
        debug!(source = %source.display(), "No framework detected, defaulting to static");
        Framework::Static
    }

    /// Framework declared by the spinfile, else detection
    pub fn resolve(&self, source: &Path, spinfile: Option<&Spinfile>) -> Framework {
        if let Some(framework) = spinfile.and_then(Spinfile::declared_framework) {
            info!(source = %source.display(), framework = %framework, "Framework declared in spinfile");
            return framework;
        }
        self.detect(source)
    }
}

impl Default for FrameworkResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

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

    #[test]
    fn test_manifest_queries() {
        let dir = project(&[(
            "package.json",
            r#"{"name":"x","main":"srv.js","scripts":{"build":"tsc"},"dependencies":{"express":"^4"},"devDependencies":{"@remix-run/dev":"2"}}"#,
        )]);
        let manifest = PackageManifest::read(dir.path()).unwrap();
        assert!(manifest.depends_on("express"));
        assert!(manifest.depends_on_prefix("@remix-run/"));
        assert!(manifest.has_script("build"));
        assert!(!manifest.has_script("start"));
        assert_eq!(manifest.main.as_deref(), Some("srv.js"));
    }

    #[test]
    fn test_unparseable_manifest_is_ignored() {
        let dir = project(&[("package.json", "{ not json")]);
        assert!(PackageManifest::read(dir.path()).is_none());
        assert_eq!(FrameworkResolver::new().detect(dir.path()), Framework::Static);
    }

    #[test]
    fn test_detectors_sorted_by_priority() {
        let mut resolver = FrameworkResolver::empty();
        resolver.register(StaticDetector);
        resolver.register(ExpressDetector);
        resolver.register(NextJsDetector);
        resolver.register(RemixDetector);
        let names: Vec<&str> = resolver.detectors().map(|d| d.name()).collect();
        assert_eq!(names, vec!["nextjs", "remix", "express", "static"]);
    }

    #[test]
    fn test_next_beats_express() {
        let dir = project(&[(
            "package.json",
            r#"{"dependencies":{"express":"^4","next":"14"}}"#,
        )]);
        assert_eq!(FrameworkResolver::new().detect(dir.path()), Framework::NextJs);
    }

    #[test]
    fn test_remix_beats_express() {
        let dir = project(&[(
            "package.json",
            r#"{"dependencies":{"express":"^4","@remix-run/express":"2"}}"#,
        )]);
        assert_eq!(FrameworkResolver::new().detect(dir.path()), Framework::Remix);
    }

    #[test]
    fn test_next_config_without_manifest() {
        let dir = project(&[("next.config.mjs", "export default {}")]);
        assert_eq!(FrameworkResolver::new().detect(dir.path()), Framework::NextJs);
    }

    #[test]
    fn test_plain_express() {
        let dir = project(&[
            ("package.json", r#"{"dependencies":{"express":"^4"}}"#),
            ("public/index.html", "<html></html>"),
        ]);
        assert_eq!(FrameworkResolver::new().detect(dir.path()), Framework::Express);
    }

    #[test]
    fn test_static_and_fallback() {
        let site = project(&[("dist/index.html", "<html></html>")]);
        assert_eq!(StaticDetector.detect(site.path()), Some(Framework::Static));

        let empty = project(&[]);
        assert_eq!(StaticDetector.detect(empty.path()), None);
        assert_eq!(FrameworkResolver::new().detect(empty.path()), Framework::Static);
    }

    #[test]
    fn test_spinfile_wins() {
        let dir = project(&[("package.json", r#"{"dependencies":{"next":"14"}}"#)]);
        let spinfile = Spinfile::parse_yaml("framework: express\n").unwrap();
        let resolver = FrameworkResolver::new();
        assert_eq!(resolver.resolve(dir.path(), Some(&spinfile)), Framework::Express);

        let auto = Spinfile::parse_yaml("framework: auto\n").unwrap();
        assert_eq!(resolver.resolve(dir.path(), Some(&auto)), Framework::NextJs);
        assert_eq!(resolver.resolve(dir.path(), None), Framework::NextJs);
    }
}
