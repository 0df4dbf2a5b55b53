//! Build systems as a closed set of tagged variants.
//!
//! A recipe names its build system; the builder for that tag drives a
//! [`BuildContext`], which is the only way a build touches the outside world.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::BuildRequest;
use crate::variant::VariantValue;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("required program `{0}` not found")]
    MissingProgram(String),
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with status {status:?}")]
    CommandFailed { program: String, status: Option<i32> },
    #[error("failed to edit {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Capabilities a builder may use.
pub trait BuildContext {
    /// Run `program` with `args` in `cwd`, failing on a non-zero exit.
    fn run(&mut self, program: &Path, args: &[String], cwd: &Path) -> Result<(), BuildError>;

    /// Find an executable on the search path.
    fn which(&self, name: &str) -> Option<PathBuf>;

    /// Replace every match of `pattern` in `path`; returns the number of
    /// replacements.
    fn filter_file(&mut self, path: &Path, pattern: &str, replacement: &str) -> Result<usize, BuildError>;

    fn require(&self, name: &str) -> Result<PathBuf, BuildError> {
        self.which(name)
            .ok_or_else(|| BuildError::MissingProgram(name.to_string()))
    }
}

/// Phases every build system implements.
pub trait Builder {
    fn configure(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError>;
    fn build(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError>;
    fn install(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    Autotools,
    CMake,
    Makefile,
    Python,
    /// Nothing to build; the package only groups dependencies.
    #[default]
    Bundle,
}

impl BuildSystem {
    /// Run configure, build and install in order.
    pub fn run(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError> {
        let span = tracing::info_span!("build", package = %request.node.name, system = ?self);
        let _enter = span.enter();
        self.configure(request, ctx)?;
        self.build(request, ctx)?;
        self.install(request, ctx)?;
        tracing::info!(prefix = %request.prefix.display(), "installed");
        Ok(())
    }
}

fn cmake_build_dir(request: &BuildRequest) -> PathBuf {
    request.source_dir.join("spackle-build")
}

fn prefix_arg(request: &BuildRequest) -> String {
    request.prefix.display().to_string()
}

fn bool_variants(request: &BuildRequest) -> impl Iterator<Item = (&str, bool)> {
    request.node.variants.iter().filter_map(|(name, value)| match value {
        VariantValue::Bool(b) => Some((name.as_str(), *b)),
        _ => None,
    })
}

impl Builder for BuildSystem {
    fn configure(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError> {
        let src = &request.source_dir;
        match self {
            BuildSystem::Autotools => {
                let mut args = vec![format!("--prefix={}", prefix_arg(request))];
                for (name, on) in bool_variants(request) {
                    let verb = if on { "enable" } else { "disable" };
                    args.push(format!("--{verb}-{name}"));
                }
                ctx.run(&src.join("configure"), &args, src)
            }
            BuildSystem::CMake => {
                let cmake = ctx.require("cmake")?;
                let build_type = match request.node.variants.get("build_type") {
                    Some(VariantValue::Single(t)) => t.clone(),
                    _ => "Release".to_string(),
                };
                let prefix_path = request
                    .dependencies
                    .values()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(";");
                let mut args = vec![
                    "-S".to_string(),
                    src.display().to_string(),
                    "-B".to_string(),
                    cmake_build_dir(request).display().to_string(),
                    format!("-DCMAKE_INSTALL_PREFIX={}", prefix_arg(request)),
                    format!("-DCMAKE_BUILD_TYPE={build_type}"),
                ];
                if !prefix_path.is_empty() {
                    args.push(format!("-DCMAKE_PREFIX_PATH={prefix_path}"));
                }
                for (name, on) in bool_variants(request) {
                    let value = if on { "ON" } else { "OFF" };
                    args.push(format!("-D{}={value}", name.to_uppercase()));
                }
                ctx.run(&cmake, &args, src)
            }
            BuildSystem::Makefile => {
                let replacement = format!("PREFIX = {}", prefix_arg(request));
                ctx.filter_file(&src.join("Makefile"), r"^PREFIX\s*\??=.*$", &replacement)?;
                Ok(())
            }
            BuildSystem::Python | BuildSystem::Bundle => Ok(()),
        }
    }

    fn build(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError> {
        let src = &request.source_dir;
        match self {
            BuildSystem::Autotools | BuildSystem::Makefile => {
                let make = ctx.require("make")?;
                ctx.run(&make, &[], src)
            }
            BuildSystem::CMake => {
                let cmake = ctx.require("cmake")?;
                let args = vec!["--build".to_string(), cmake_build_dir(request).display().to_string()];
                ctx.run(&cmake, &args, src)
            }
            BuildSystem::Python | BuildSystem::Bundle => Ok(()),
        }
    }

    fn install(&self, request: &BuildRequest, ctx: &mut dyn BuildContext) -> Result<(), BuildError> {
        let src = &request.source_dir;
        match self {
            BuildSystem::Autotools | BuildSystem::Makefile => {
                let make = ctx.require("make")?;
                ctx.run(&make, &["install".to_string()], src)
            }
            BuildSystem::CMake => {
                let cmake = ctx.require("cmake")?;
                let args = vec!["--install".to_string(), cmake_build_dir(request).display().to_string()];
                ctx.run(&cmake, &args, src)
            }
            BuildSystem::Python => {
                // Prefer the interpreter the node depends on.
                let python = match request.dependencies.get("python") {
                    Some(prefix) => prefix.join("bin").join("python3"),
                    None => ctx.require("python3")?,
                };
                let args = [
                    "-m",
                    "pip",
                    "install",
                    "--no-deps",
                    "--no-build-isolation",
                    &format!("--prefix={}", prefix_arg(request)),
                    ".",
                ]
                .map(str::to_string);
                ctx.run(&python, &args, src)
            }
            BuildSystem::Bundle => Ok(()),
        }
    }
}

/// Runs real processes.
#[derive(Debug, Default)]
pub struct ProcessContext;

impl BuildContext for ProcessContext {
    fn run(&mut self, program: &Path, args: &[String], cwd: &Path) -> Result<(), BuildError> {
        tracing::debug!(program = %program.display(), ?args, cwd = %cwd.display(), "run");
        let status = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .status()
            .map_err(|source| BuildError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        if !status.success() {
            return Err(BuildError::CommandFailed {
                program: program.display().to_string(),
                status: status.code(),
            });
        }
        Ok(())
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn filter_file(&mut self, path: &Path, pattern: &str, replacement: &str) -> Result<usize, BuildError> {
        let io = |source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        };
        let text = fs::read_to_string(path).map_err(io)?;
        let (edited, count) = substitute(&text, pattern, replacement)?;
        if count > 0 {
            fs::write(path, edited).map_err(io)?;
        }
        Ok(count)
    }
}

fn substitute(text: &str, pattern: &str, replacement: &str) -> Result<(String, usize), BuildError> {
    let re = RegexBuilder::new(pattern).multi_line(true).build()?;
    let count = re.find_iter(text).count();
    Ok((re.replace_all(text, replacement).into_owned(), count))
}

/// A command captured by [`RecordingContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Records commands and edits in memory instead of touching the system.
#[derive(Debug, Default)]
pub struct RecordingContext {
    /// Programs [`BuildContext::which`] will find, under `/usr/bin`.
    pub programs: BTreeSet<String>,
    /// Files visible to [`BuildContext::filter_file`].
    pub files: BTreeMap<PathBuf, String>,
    pub commands: Vec<RecordedCommand>,
}

impl RecordingContext {
    pub fn with_programs(programs: &[&str]) -> Self {
        Self {
            programs: programs.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl BuildContext for RecordingContext {
    fn run(&mut self, program: &Path, args: &[String], cwd: &Path) -> Result<(), BuildError> {
        self.commands.push(RecordedCommand {
            program: program.to_path_buf(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        });
        Ok(())
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        self.programs
            .contains(name)
            .then(|| Path::new("/usr/bin").join(name))
    }

    fn filter_file(&mut self, path: &Path, pattern: &str, replacement: &str) -> Result<usize, BuildError> {
        let text = self.files.get(path).ok_or_else(|| BuildError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        let (edited, count) = substitute(text, pattern, replacement)?;
        self.files.insert(path.to_path_buf(), edited);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::dag::{CompilerId, ConcreteNode};
    use crate::spec::ArchSpec;
    use crate::version::Version;

    fn request(variants: &[(&str, VariantValue)]) -> BuildRequest {
        BuildRequest {
            node: ConcreteNode {
                name: "zlib".into(),
                version: Version::parse("1.3").unwrap(),
                variants: variants.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                compiler: CompilerId {
                    name: "gcc".into(),
                    version: Version::parse("12.2.0").unwrap(),
                },
                arch: ArchSpec::new("linux", "ubuntu22.04", "x86_64"),
                hash: "abcdefgh".into(),
            },
            prefix: PathBuf::from("/opt/zlib"),
            source_dir: PathBuf::from("/stage/zlib"),
            dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn autotools_maps_boolean_variants() {
        let req = request(&[("shared", VariantValue::Bool(true)), ("pic", VariantValue::Bool(false))]);
        let mut ctx = RecordingContext::with_programs(&["make"]);
        BuildSystem::Autotools.run(&req, &mut ctx).unwrap();
        assert_eq!(ctx.commands.len(), 3);
        assert_eq!(ctx.commands[0].program, PathBuf::from("/stage/zlib/configure"));
        assert_eq!(
            ctx.commands[0].args,
            ["--prefix=/opt/zlib", "--disable-pic", "--enable-shared"]
        );
        assert_eq!(ctx.commands[2].args, ["install"]);
    }

    #[test]
    fn cmake_uses_build_type_and_dependency_prefixes() {
        let mut req = request(&[("build_type", VariantValue::Single("Debug".into()))]);
        req.dependencies.insert("openssl".into(), PathBuf::from("/opt/openssl"));
        let mut ctx = RecordingContext::with_programs(&["cmake"]);
        BuildSystem::CMake.run(&req, &mut ctx).unwrap();
        let configure = &ctx.commands[0].args;
        assert!(configure.contains(&"-DCMAKE_BUILD_TYPE=Debug".to_string()));
        assert!(configure.contains(&"-DCMAKE_PREFIX_PATH=/opt/openssl".to_string()));
        assert_eq!(ctx.commands[1].args[0], "--build");
        assert_eq!(ctx.commands[2].args[0], "--install");
    }

    #[test]
    fn makefile_edits_prefix() {
        let req = request(&[]);
        let makefile = PathBuf::from("/stage/zlib/Makefile");
        let mut ctx = RecordingContext::with_programs(&["make"]);
        ctx.files
            .insert(makefile.clone(), "CC = cc\nPREFIX ?= /usr/local\n".into());
        BuildSystem::Makefile.run(&req, &mut ctx).unwrap();
        assert_eq!(ctx.files[&makefile], "CC = cc\nPREFIX = /opt/zlib\n");
        assert_eq!(ctx.commands.len(), 2);
    }

    #[test]
    fn missing_program_is_reported() {
        let req = request(&[]);
        let mut ctx = RecordingContext::default();
        let err = BuildSystem::CMake.run(&req, &mut ctx).unwrap_err();
        assert!(matches!(err, BuildError::MissingProgram(p) if p == "cmake"));
    }

    #[test]
    fn python_prefers_dependency_interpreter() {
        let mut req = request(&[]);
        req.dependencies.insert("python".into(), PathBuf::from("/opt/python"));
        let mut ctx = RecordingContext::default();
        BuildSystem::Python.run(&req, &mut ctx).unwrap();
        assert_eq!(ctx.commands[0].program, PathBuf::from("/opt/python/bin/python3"));
    }

    #[test]
    fn bundle_runs_nothing() {
        let mut ctx = RecordingContext::default();
        BuildSystem::Bundle.run(&request(&[]), &mut ctx).unwrap();
        assert!(ctx.commands.is_empty());
    }

    #[test]
    fn process_context_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.h");
        fs::write(&path, "#define A 1\n#define B 1\n").unwrap();
        let mut ctx = ProcessContext;
        let n = ctx.filter_file(&path, r"1$", "2").unwrap();
        assert_eq!(n, 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "#define A 2\n#define B 2\n");
    }

    #[test]
    fn tags_deserialize_lowercase() {
        #[derive(Deserialize)]
        struct T {
            b: BuildSystem,
        }
        let t: T = toml::from_str("b = \"cmake\"").unwrap();
        assert_eq!(t.b, BuildSystem::CMake);
    }
}
