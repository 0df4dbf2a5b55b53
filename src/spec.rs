//! Abstract and concrete package specs.
//!
//! A [`Spec`] describes a package build with any subset of its fields
//! fixed. User requests, recipe `when` conditions and dependency
//! constraints are all specs; a concretized node is a spec where every
//! field holds a single value.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ConflictError, ParseError};
use crate::variant::VariantValue;
use crate::version::VersionList;

/// Dependency edge types: a subset of build, link, run and test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepTypes(u8);

impl DepTypes {
    pub const BUILD: DepTypes = DepTypes(1);
    pub const LINK: DepTypes = DepTypes(2);
    pub const RUN: DepTypes = DepTypes(4);
    pub const TEST: DepTypes = DepTypes(8);

    const NAMES: [(DepTypes, &'static str); 4] = [
        (DepTypes::BUILD, "build"),
        (DepTypes::LINK, "link"),
        (DepTypes::RUN, "run"),
        (DepTypes::TEST, "test"),
    ];

    pub const fn empty() -> Self {
        DepTypes(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: DepTypes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: DepTypes) -> bool {
        self.0 & other.0 != 0
    }

    /// Only the test type.
    pub fn is_test_only(self) -> bool {
        self == DepTypes::TEST
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(t, _)| self.contains(*t))
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES.iter().find(|(_, n)| *n == name).map(|(t, _)| *t)
    }
}

impl Default for DepTypes {
    fn default() -> Self {
        DepTypes::BUILD | DepTypes::LINK
    }
}

impl BitOr for DepTypes {
    type Output = DepTypes;

    fn bitor(self, rhs: DepTypes) -> DepTypes {
        DepTypes(self.0 | rhs.0)
    }
}

impl fmt::Display for DepTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

impl Serialize for DepTypes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DepTypes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }
        let names = match Raw::deserialize(deserializer)? {
            Raw::One(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
            Raw::Many(v) => v,
        };
        let mut types = DepTypes::empty();
        for name in names {
            types = types
                | DepTypes::from_name(&name)
                    .ok_or_else(|| serde::de::Error::custom(format!("unknown dependency type `{name}`")))?;
        }
        Ok(types)
    }
}

/// A compiler constraint such as `gcc@12:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilerSpec {
    pub name: String,
    pub versions: VersionList,
}

impl CompilerSpec {
    fn intersect(&self, other: &CompilerSpec, package: &str) -> Result<CompilerSpec, ConflictError> {
        if self.name != other.name {
            return Err(ConflictError {
                package: package.to_string(),
                field: "compiler".to_string(),
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        let versions = self.versions.intersection(&other.versions);
        if versions.is_empty() {
            return Err(ConflictError {
                package: package.to_string(),
                field: "compiler version".to_string(),
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        Ok(CompilerSpec {
            name: self.name.clone(),
            versions,
        })
    }

    pub fn satisfies(&self, other: &CompilerSpec) -> bool {
        self.name == other.name && self.versions.is_subset_of(&other.versions)
    }
}

impl fmt::Display for CompilerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        Ok(())
    }
}

/// Platform, operating system and target microarchitecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchSpec {
    pub platform: Option<String>,
    pub os: Option<String>,
    pub target: Option<String>,
}

impl ArchSpec {
    pub fn new(platform: &str, os: &str, target: &str) -> Self {
        Self {
            platform: Some(platform.to_string()),
            os: Some(os.to_string()),
            target: Some(target.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }

    pub fn is_concrete(&self) -> bool {
        self.platform.is_some() && self.os.is_some() && self.target.is_some()
    }

    fn fields(&self) -> [(&'static str, &Option<String>); 3] {
        [("platform", &self.platform), ("os", &self.os), ("target", &self.target)]
    }

    fn intersect(&self, other: &ArchSpec, package: &str) -> Result<ArchSpec, ConflictError> {
        for ((field, a), (_, b)) in self.fields().into_iter().zip(other.fields()) {
            if let (Some(a), Some(b)) = (a, b) {
                if a != b {
                    return Err(ConflictError {
                        package: package.to_string(),
                        field: field.to_string(),
                        left: a.clone(),
                        right: b.clone(),
                    });
                }
            }
        }
        Ok(ArchSpec {
            platform: self.platform.clone().or_else(|| other.platform.clone()),
            os: self.os.clone().or_else(|| other.os.clone()),
            target: self.target.clone().or_else(|| other.target.clone()),
        })
    }

    pub fn satisfies(&self, other: &ArchSpec) -> bool {
        self.fields()
            .into_iter()
            .zip(other.fields())
            .all(|((_, a), (_, b))| b.is_none() || a == b)
    }
}

impl fmt::Display for ArchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(p), Some(o), Some(t)) = (&self.platform, &self.os, &self.target) {
            return write!(f, "arch={p}-{o}-{t}");
        }
        let mut first = true;
        for (field, value) in self.fields() {
            if let Some(value) = value {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{field}={value}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A package build description, abstract or concrete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spec {
    pub name: Option<String>,
    pub versions: VersionList,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: Option<CompilerSpec>,
    pub arch: ArchSpec,
    /// `^` constraints on dependencies, one per name.
    pub dependencies: Vec<Spec>,
}

impl Spec {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Parse a single spec string such as `hdf5@1.14 +mpi ^zlib@1.3`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        crate::parser::parse_spec(s)
    }

    /// The name, or an empty string for anonymous specs.
    pub fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "anonymous spec".to_string())
    }

    /// This spec without its `^` constraints.
    pub fn own(&self) -> Spec {
        Spec {
            dependencies: Vec::new(),
            ..self.clone()
        }
    }

    pub fn dependency(&self, name: &str) -> Option<&Spec> {
        self.dependencies.iter().find(|d| d.name.as_deref() == Some(name))
    }

    /// True when the spec constrains nothing beyond, possibly, its name.
    pub fn is_unconstrained(&self) -> bool {
        self.versions.is_any()
            && self.variants.is_empty()
            && self.compiler.is_none()
            && self.arch.is_empty()
            && self.dependencies.is_empty()
    }

    /// Merge `self` and `other` into a spec satisfying both.
    pub fn intersect(&self, other: &Spec) -> Result<Spec, ConflictError> {
        let package = self.name.clone().or_else(|| other.name.clone());
        let label = package.clone().unwrap_or_else(|| "anonymous spec".to_string());

        if let (Some(a), Some(b)) = (&self.name, &other.name) {
            if a != b {
                return Err(ConflictError {
                    package: label,
                    field: "name".to_string(),
                    left: a.clone(),
                    right: b.clone(),
                });
            }
        }

        let versions = self.versions.intersection(&other.versions);
        if versions.is_empty() {
            return Err(ConflictError {
                package: label,
                field: "version".to_string(),
                left: self.versions.to_string(),
                right: other.versions.to_string(),
            });
        }

        let mut variants = self.variants.clone();
        for (key, theirs) in &other.variants {
            let merged = match variants.get(key) {
                Some(ours) => ours.intersect(theirs).ok_or_else(|| ConflictError {
                    package: label.clone(),
                    field: format!("variant '{key}'"),
                    left: ours.value_string(),
                    right: theirs.value_string(),
                })?,
                None => theirs.clone(),
            };
            variants.insert(key.clone(), merged);
        }

        let compiler = match (&self.compiler, &other.compiler) {
            (Some(a), Some(b)) => Some(a.intersect(b, &label)?),
            (a, b) => a.clone().or_else(|| b.clone()),
        };

        let arch = self.arch.intersect(&other.arch, &label)?;

        let mut dependencies = self.dependencies.clone();
        for dep in &other.dependencies {
            match dependencies.iter_mut().find(|d| d.name == dep.name) {
                Some(existing) => *existing = existing.intersect(dep)?,
                None => dependencies.push(dep.clone()),
            }
        }

        Ok(Spec {
            name: package,
            versions,
            variants,
            compiler,
            arch,
            dependencies,
        })
    }

    /// Narrow `self` in place by `other`.
    pub fn constrain(&mut self, other: &Spec) -> Result<(), ConflictError> {
        *self = self.intersect(other)?;
        Ok(())
    }

    pub fn intersects(&self, other: &Spec) -> bool {
        self.intersect(other).is_ok()
    }

    /// Every constraint of `other` is implied by `self`.
    pub fn satisfies(&self, other: &Spec) -> bool {
        if let Some(name) = &other.name {
            if self.name.as_ref() != Some(name) {
                return false;
            }
        }
        if !self.versions.is_subset_of(&other.versions) {
            return false;
        }
        for (key, value) in &other.variants {
            match self.variants.get(key) {
                Some(ours) if ours.satisfies(value) => {}
                _ => return false,
            }
        }
        if let Some(c) = &other.compiler {
            match &self.compiler {
                Some(ours) if ours.satisfies(c) => {}
                _ => return false,
            }
        }
        if !self.arch.satisfies(&other.arch) {
            return false;
        }
        other.dependencies.iter().all(|dep| {
            dep.name
                .as_deref()
                .and_then(|n| self.dependency(n))
                .is_some_and(|ours| ours.satisfies(dep))
        })
    }

    /// Every field holds exactly one value, recursively.
    pub fn is_concrete(&self) -> bool {
        self.name.is_some()
            && self.versions.concrete().is_some()
            && self
                .compiler
                .as_ref()
                .is_some_and(|c| c.versions.concrete().is_some())
            && self.arch.is_concrete()
            && self.dependencies.iter().all(Spec::is_concrete)
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if let Some(name) = &self.name {
            out.push_str(name);
        }
        if !self.versions.is_any() {
            out.push('@');
            out.push_str(&self.versions.to_string());
        }
        if let Some(c) = &self.compiler {
            out.push('%');
            out.push_str(&c.to_string());
        }
        for (key, value) in &self.variants {
            if let VariantValue::Bool(b) = value {
                out.push(if *b { '+' } else { '~' });
                out.push_str(key);
            }
        }
        for (key, value) in &self.variants {
            if matches!(value, VariantValue::Bool(_)) {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            let v = value.value_string();
            if v.chars().any(char::is_whitespace) {
                out.push_str(&format!("{key}=\"{v}\""));
            } else {
                out.push_str(&format!("{key}={v}"));
            }
        }
        if !self.arch.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&self.arch.to_string());
        }
        f.write_str(&out)
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f)?;
        for dep in &self.dependencies {
            write!(f, " ^")?;
            dep.fmt_node(f)?;
        }
        Ok(())
    }
}

impl FromStr for Spec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Spec::parse(s)
    }
}

impl Serialize for Spec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Spec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Spec::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Displays a spec's name, or `anonymous spec`.
pub struct SpecLabel<'a>(pub &'a Spec);

impl fmt::Display for SpecLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.label())
    }
}
