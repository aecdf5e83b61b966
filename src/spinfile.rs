//! Per-project build overrides
//!
//! A project may ship a `spinfile.yaml`, `spinfile.yml` or `spinfile.toml`
//! at its root. Anything it declares takes precedence over what the build
//! pipeline would infer, including the framework.

use crate::spinlet::{Framework, ResourceLimits};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File names searched in order
pub const SPINFILE_NAMES: [&str; 3] = ["spinfile.yaml", "spinfile.yml", "spinfile.toml"];

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Spinfile {
    #[serde(default)]
    pub name: Option<String>,

    /// Declared framework; `auto` means detect
    #[serde(default)]
    pub framework: Option<Framework>,

    #[serde(default)]
    pub build: BuildSection,

    #[serde(default, alias = "dependencies")]
    pub install: InstallSection,

    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub resources: ResourceLimits,

    /// Environment merged over the build job's environment
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BuildSection {
    pub command: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct InstallSection {
    pub command: Option<String>,

    /// Set to false to skip the dependency install step
    #[serde(alias = "install")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RuntimeSection {
    #[serde(alias = "entryPoint")]
    pub entry_point: Option<String>,

    pub port: Option<u16>,
}

impl Spinfile {
    pub fn parse_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("invalid spinfile YAML")
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid spinfile TOML")
    }

    /// Locate the spinfile in `dir`, if any
    pub fn find(dir: &Path) -> Option<PathBuf> {
        SPINFILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Load the spinfile from `dir`; `Ok(None)` when the project has none
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let Some(path) = Self::find(dir) else {
            return Ok(None);
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let spinfile = if path.extension().is_some_and(|ext| ext == "toml") {
            Self::parse_toml(&content)
        } else {
            Self::parse_yaml(&content)
        }
        .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(Some(spinfile))
    }

    /// Framework the project pins, ignoring `auto`
    pub fn declared_framework(&self) -> Option<Framework> {
        self.framework
            .clone()
            .filter(|f| !f.as_str().eq_ignore_ascii_case("auto"))
    }

    pub fn install_enabled(&self) -> bool {
        self.install.enabled.unwrap_or(true)
    }

    /// Build environment: top-level env, then `build.env`
    pub fn build_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.extend(self.build.env.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
name: shop
framework: remix
build:
  command: npm run build:prod
  env:
    API_URL: https://api.test
install:
  enabled: false
runtime:
  entryPoint: build/server.js
resources:
  memory: 512MB
env:
  FEATURE: "on"
"#;
        let spinfile = Spinfile::parse_yaml(yaml).unwrap();
        assert_eq!(spinfile.name.as_deref(), Some("shop"));
        assert_eq!(spinfile.declared_framework(), Some(Framework::Remix));
        assert_eq!(spinfile.build.command.as_deref(), Some("npm run build:prod"));
        assert!(!spinfile.install_enabled());
        assert_eq!(spinfile.runtime.entry_point.as_deref(), Some("build/server.js"));
        assert_eq!(spinfile.resources.memory_mb().unwrap(), Some(512));

        let env = spinfile.build_env();
        assert_eq!(env.get("FEATURE").map(String::as_str), Some("on"));
        assert_eq!(env.get("API_URL").map(String::as_str), Some("https://api.test"));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
framework = "nextjs"

[build]
command = "pnpm build"

[install]
command = "pnpm install --prod"
"#;
        let spinfile = Spinfile::parse_toml(toml).unwrap();
        assert_eq!(spinfile.declared_framework(), Some(Framework::NextJs));
        assert_eq!(spinfile.install.command.as_deref(), Some("pnpm install --prod"));
        assert!(spinfile.install_enabled());
    }

    #[test]
    fn test_auto_is_not_declared() {
        let spinfile = Spinfile::parse_yaml("framework: auto\n").unwrap();
        assert_eq!(spinfile.declared_framework(), None);
    }

    #[test]
    fn test_load_missing_and_present() {
        let dir = TempDir::new().unwrap();
        assert!(Spinfile::load(dir.path()).unwrap().is_none());

        fs::write(dir.path().join("spinfile.yml"), "framework: express\n").unwrap();
        let spinfile = Spinfile::load(dir.path()).unwrap().unwrap();
        assert_eq!(spinfile.declared_framework(), Some(Framework::Express));
    }

    #[test]
    fn test_load_invalid() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("spinfile.toml"), "framework = [").unwrap();
        let err = Spinfile::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("spinfile.toml"));
    }
}
