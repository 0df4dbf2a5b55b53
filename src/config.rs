//! Concretizer configuration.
//!
//! Configuration is TOML, read from any number of scopes. Later scopes win:
//! tables merge key by key, while scalars and arrays are replaced whole.
//!
//! ```toml
//! [concretizer]
//! reuse = true
//! timeout_ms = 30000
//!
//! [[compilers]]
//! name = "gcc"
//! version = "12.2.0"
//!
//! [architecture]
//! platform = "linux"
//! os = "ubuntu22.04"
//! targets = ["x86_64"]
//!
//! [packages.all]
//! providers = { mpi = ["mpich", "openmpi"] }
//!
//! [packages.hdf5]
//! version = ["1.12.2"]
//! variants = "+mpi ~szip"
//! require = "@1.12:"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::spec::{ArchSpec, Spec};
use crate::version::Version;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// `[concretizer]` options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcretizerConfig {
    /// Wall-clock budget for one solve, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Prefer installed specs over fresh builds.
    pub reuse: bool,
    /// Concretize all roots together so they share dependencies.
    pub unify: bool,
    /// Include `test` dependencies of root packages.
    pub tests: bool,
}

impl Default for ConcretizerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            reuse: true,
            unify: true,
            tests: false,
        }
    }
}

/// One available compiler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerEntry {
    pub name: String,
    pub version: Version,
}

/// `[architecture]`: the host, and the targets nodes may be built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchitectureConfig {
    pub platform: Option<String>,
    pub os: Option<String>,
    /// In order of preference.
    pub targets: Vec<String>,
}

/// `[packages.<name>]` preferences and requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    /// Preferred versions, best first.
    pub version: Vec<Version>,
    /// Preferred variant values, e.g. `+shared ~debug`.
    pub variants: Option<Spec>,
    /// Preferred compiler names, best first.
    pub compiler: Vec<String>,
    /// Preferred targets, best first.
    pub target: Vec<String>,
    /// Preferred providers per virtual (read from `packages.all`).
    pub providers: BTreeMap<String, Vec<String>>,
    /// Hard requirement every node of this package must satisfy.
    pub require: Option<Spec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub concretizer: ConcretizerConfig,
    pub compilers: Vec<CompilerEntry>,
    pub architecture: ArchitectureConfig,
    pub packages: BTreeMap<String, PackageConfig>,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_scopes(&[path.to_path_buf()])
    }

    /// Load and merge scopes, lowest precedence first. Missing files are
    /// skipped.
    pub fn load_scopes(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        let mut last = PathBuf::from("<empty>");
        for path in paths {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "configuration scope not found");
                    continue;
                }
                Err(source) => {
                    return Err(ConfigError::Io {
                        path: path.clone(),
                        source,
                    });
                }
            };
            let table: toml::Table = toml::from_str(&text).map_err(|source| ConfigError::Toml {
                path: path.clone(),
                source,
            })?;
            merge_tables(&mut merged, table);
            last = path.clone();
        }
        toml::Value::Table(merged)
            .try_into()
            .map_err(|source| ConfigError::Toml { path: last, source })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.concretizer.timeout_ms.map(Duration::from_millis)
    }

    fn package(&self, name: &str) -> Option<&PackageConfig> {
        self.packages.get(name)
    }

    fn all(&self) -> Option<&PackageConfig> {
        self.packages.get("all")
    }

    /// Versions listed under `packages.<name>.version`.
    pub fn preferred_versions(&self, name: &str) -> &[Version] {
        self.package(name).map(|p| p.version.as_slice()).unwrap_or(&[])
    }

    /// Preferred variant values for `name`, falling back to `packages.all`.
    pub fn variant_preferences(&self, name: &str) -> Option<&Spec> {
        self.package(name)
            .and_then(|p| p.variants.as_ref())
            .or_else(|| self.all().and_then(|p| p.variants.as_ref()))
    }

    pub fn requirement(&self, name: &str) -> Option<&Spec> {
        self.package(name).and_then(|p| p.require.as_ref())
    }

    /// Configured compilers, best first for `name`.
    pub fn compiler_order(&self, name: &str) -> Vec<&CompilerEntry> {
        let prefs: Vec<&String> = self
            .package(name)
            .into_iter()
            .chain(self.all())
            .flat_map(|p| p.compiler.iter())
            .collect();
        let mut order: Vec<&CompilerEntry> = self.compilers.iter().collect();
        order.sort_by_key(|c| prefs.iter().position(|p| **p == c.name).unwrap_or(usize::MAX));
        order
    }

    /// Usable targets, best first for `name`.
    pub fn target_order(&self, name: &str) -> Vec<String> {
        let mut targets = if self.architecture.targets.is_empty() {
            vec![std::env::consts::ARCH.to_string()]
        } else {
            self.architecture.targets.clone()
        };
        let prefs: Vec<&String> = self
            .package(name)
            .into_iter()
            .chain(self.all())
            .flat_map(|p| p.target.iter())
            .collect();
        targets.sort_by_key(|t| prefs.iter().position(|p| *p == t).unwrap_or(usize::MAX));
        targets
    }

    /// Preferred providers of `virtual_name`, best first.
    pub fn provider_order(&self, virtual_name: &str) -> &[String] {
        self.all()
            .and_then(|p| p.providers.get(virtual_name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn platform(&self) -> String {
        self.architecture.platform.clone().unwrap_or_else(|| {
            match std::env::consts::OS {
                "macos" => "darwin",
                other => other,
            }
            .to_string()
        })
    }

    pub fn os(&self) -> String {
        self.architecture.os.clone().unwrap_or_else(|| "unknown".to_string())
    }

    /// The host architecture with `target` filled in.
    pub fn arch_for_target(&self, target: &str) -> ArchSpec {
        ArchSpec::new(&self.platform(), &self.os(), target)
    }
}

/// Deep-merge `higher` into `base`; `higher` wins on conflicts.
fn merge_tables(base: &mut toml::Table, higher: toml::Table) {
    for (key, value) in higher {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = r#"
[concretizer]
reuse = false
timeout_ms = 10000

[[compilers]]
name = "gcc"
version = "12.2.0"

[[compilers]]
name = "clang"
version = "16.0.0"

[architecture]
platform = "linux"
os = "ubuntu22.04"
targets = ["x86_64", "zen2"]

[packages.all]
providers = { mpi = ["openmpi"] }

[packages.hdf5]
version = ["1.12.2"]
variants = "+mpi"
"#;

    const USER: &str = r#"
[concretizer]
reuse = true

[packages.all]
providers = { mpi = ["mpich", "openmpi"] }
compiler = ["clang"]

[packages.hdf5]
require = "@1.12:"
"#;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert!(c.concretizer.reuse);
        assert!(c.concretizer.unify);
        assert!(!c.concretizer.tests);
        assert_eq!(c.timeout(), None);
        assert_eq!(c.target_order("x").len(), 1);
    }

    #[test]
    fn parse_single_scope() {
        let c = Config::from_toml_str(SITE).unwrap();
        assert!(!c.concretizer.reuse);
        assert_eq!(c.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(c.compilers.len(), 2);
        assert_eq!(c.preferred_versions("hdf5")[0].to_string(), "1.12.2");
        assert_eq!(c.variant_preferences("hdf5").unwrap().to_string(), "+mpi");
        assert_eq!(c.provider_order("mpi"), ["openmpi".to_string()]);
        assert_eq!(c.arch_for_target("zen2"), ArchSpec::new("linux", "ubuntu22.04", "zen2"));
    }

    #[test]
    fn scopes_merge_with_later_winning() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site.toml");
        let user = dir.path().join("user.toml");
        fs::write(&site, SITE).unwrap();
        fs::write(&user, USER).unwrap();

        let c = Config::load_scopes(&[site, dir.path().join("missing.toml"), user]).unwrap();
        assert!(c.concretizer.reuse);
        assert_eq!(c.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(c.provider_order("mpi"), ["mpich".to_string(), "openmpi".to_string()]);
        // Tables merge: hdf5 keeps its version preference and gains a requirement.
        assert_eq!(c.preferred_versions("hdf5").len(), 1);
        assert_eq!(c.requirement("hdf5").unwrap().to_string(), "@1.12:");
    }

    #[test]
    fn compiler_order_follows_preferences() {
        let mut c = Config::from_toml_str(SITE).unwrap();
        let names: Vec<&str> = c.compiler_order("zlib").iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["gcc", "clang"]);
        c.packages.entry("zlib".into()).or_default().compiler = vec!["clang".into()];
        let names: Vec<&str> = c.compiler_order("zlib").iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["clang", "gcc"]);
    }

    #[test]
    fn target_order_follows_preferences() {
        let mut c = Config::from_toml_str(SITE).unwrap();
        assert_eq!(c.target_order("zlib"), ["x86_64", "zen2"]);
        c.packages.entry("zlib".into()).or_default().target = vec!["zen2".into()];
        assert_eq!(c.target_order("zlib"), ["zen2", "x86_64"]);
    }

    #[test]
    fn malformed_values_rejected() {
        assert!(Config::from_toml_str("[packages.x]\nrequire = \"hdf5 zlib\"").is_err());
        assert!(Config::from_toml_str("[concretizer]\nbogus = 1").is_err());
    }
}
