//! Package recipes and the read-only index the concretizer queries.
//!
//! A [`Recipe`] is a plain data record: versions, variants, and the
//! `depends_on` / `conflicts` / `provides` / `requires` declarations of one
//! package. [`RecipeIndex`] is the lookup interface; [`InMemoryRecipeIndex`]
//! holds recipes built in code or loaded from directories of TOML files.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::build_system::BuildSystem;
use crate::error::{InvalidVariantError, InvalidVariantReason};
use crate::spec::{DepTypes, Spec};
use crate::variant::{VariantDef, VariantDomain, VariantValue};
use crate::version::Version;

/// Failure to load or validate a recipe.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed recipe {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid recipe `{package}`: {message}")]
    Invalid { package: String, message: String },
}

/// One declared version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDecl {
    pub version: Version,
    pub preferred: bool,
    pub deprecated: bool,
    pub checksum: Option<String>,
}

/// `depends_on(spec, type=..., when=...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDecl {
    pub spec: Spec,
    pub types: DepTypes,
    pub when: Option<Spec>,
}

impl DependencyDecl {
    pub fn name(&self) -> &str {
        self.spec.name_str()
    }
}

/// `conflicts(spec, when=..., msg=...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDecl {
    pub spec: Spec,
    pub when: Option<Spec>,
    pub msg: Option<String>,
}

impl ConflictDecl {
    /// The combined condition under which the conflict fires, `None` when
    /// `spec` and `when` can never hold together.
    pub fn trigger(&self) -> Option<Spec> {
        let mut trigger = self.spec.clone();
        trigger.name = None;
        match &self.when {
            Some(when) => {
                let mut when = when.clone();
                when.name = None;
                trigger.intersect(&when).ok()
            }
            None => Some(trigger),
        }
    }
}

/// `provides(virtual, when=...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvidesDecl {
    /// Named virtual with the version range provided.
    pub spec: Spec,
    pub when: Option<Spec>,
}

impl ProvidesDecl {
    pub fn virtual_name(&self) -> &str {
        self.spec.name_str()
    }
}

/// How many alternatives of a `requires` declaration must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirePolicy {
    OneOf,
    AnyOf,
}

/// `requires(*specs, policy=..., when=..., msg=...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequiresDecl {
    pub alternatives: Vec<Spec>,
    pub policy: RequirePolicy,
    pub when: Option<Spec>,
    pub msg: Option<String>,
}

/// Everything the concretizer knows about one package.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub name: String,
    pub versions: Vec<VersionDecl>,
    pub variants: BTreeMap<String, VariantDef>,
    pub dependencies: Vec<DependencyDecl>,
    pub conflicts: Vec<ConflictDecl>,
    pub provides: Vec<ProvidesDecl>,
    pub requires: Vec<RequiresDecl>,
    pub build_system: BuildSystem,
}

impl Recipe {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versions: Vec::new(),
            variants: BTreeMap::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            build_system: BuildSystem::default(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.versions.push(VersionDecl {
            version,
            preferred: false,
            deprecated: false,
            checksum: None,
        });
        self
    }

    pub fn with_version_decl(mut self, decl: VersionDecl) -> Self {
        self.versions.push(decl);
        self
    }

    pub fn with_variant(mut self, def: VariantDef) -> Self {
        self.variants.insert(def.name.clone(), def);
        self
    }

    pub fn with_dependency(mut self, spec: Spec, types: DepTypes, when: Option<Spec>) -> Self {
        self.dependencies.push(DependencyDecl { spec, types, when });
        self
    }

    pub fn with_conflict(mut self, spec: Spec, when: Option<Spec>, msg: Option<String>) -> Self {
        self.conflicts.push(ConflictDecl { spec, when, msg });
        self
    }

    pub fn with_provides(mut self, spec: Spec, when: Option<Spec>) -> Self {
        self.provides.push(ProvidesDecl { spec, when });
        self
    }

    pub fn with_requires(mut self, decl: RequiresDecl) -> Self {
        self.requires.push(decl);
        self
    }

    pub fn with_build_system(mut self, build_system: BuildSystem) -> Self {
        self.build_system = build_system;
        self
    }

    pub fn version_decl(&self, version: &Version) -> Option<&VersionDecl> {
        self.versions.iter().find(|d| &d.version == version)
    }

    /// Validate assigning `value` to variant `variant` on a node currently
    /// described by `partial`.
    pub fn check_variant(
        &self,
        variant: &str,
        value: &VariantValue,
        partial: &Spec,
    ) -> Result<VariantValue, InvalidVariantError> {
        let def = self.variants.get(variant).ok_or_else(|| InvalidVariantError {
            package: self.name.clone(),
            variant: variant.to_string(),
            reason: InvalidVariantReason::Undeclared,
        })?;
        if let Some(when) = &def.when {
            let mut anonymous = when.clone();
            anonymous.name = None;
            let mut own = partial.clone();
            own.name = None;
            if !own.intersects(&anonymous) {
                return Err(InvalidVariantError {
                    package: self.name.clone(),
                    variant: variant.to_string(),
                    reason: InvalidVariantReason::ConditionUnmet {
                        when: when.to_string(),
                    },
                });
            }
        }
        def.check(&self.name, value)
    }

    /// Parse a recipe from its TOML form.
    pub fn from_toml_str(text: &str) -> Result<Self, RecipeError> {
        Self::from_toml_at(text, Path::new("<inline>"))
    }

    fn from_toml_at(text: &str, path: &Path) -> Result<Self, RecipeError> {
        let raw: RawRecipe = toml::from_str(text).map_err(|source| RecipeError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        raw.into_recipe()
    }

    fn validate(&self) -> Result<(), RecipeError> {
        let invalid = |message: String| RecipeError::Invalid {
            package: self.name.clone(),
            message,
        };
        if self.versions.is_empty() {
            return Err(invalid("no versions declared".to_string()));
        }
        for dep in &self.dependencies {
            if dep.spec.name.is_none() {
                return Err(invalid(format!("dependency `{}` has no name", dep.spec)));
            }
            if dep.types.is_empty() {
                return Err(invalid(format!("dependency `{}` has no types", dep.spec)));
            }
        }
        for p in &self.provides {
            if p.spec.name.is_none() {
                return Err(invalid(format!("provides `{}` has no virtual name", p.spec)));
            }
        }
        let own = |s: &Spec| s.name.as_deref().is_none_or(|n| n == self.name);
        for c in &self.conflicts {
            if !own(&c.spec) {
                return Err(invalid(format!("conflict `{}` names another package", c.spec)));
            }
        }
        for r in &self.requires {
            if r.alternatives.is_empty() {
                return Err(invalid("requires without alternatives".to_string()));
            }
            if let Some(bad) = r.alternatives.iter().find(|s| !own(s)) {
                return Err(invalid(format!("requirement `{bad}` names another package")));
            }
        }
        for def in self.variants.values() {
            def.check(&self.name, &def.default)
                .map_err(|e| invalid(format!("default of variant `{}`: {}", def.name, e.reason)))?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecipe {
    name: String,
    #[serde(default)]
    build_system: BuildSystem,
    #[serde(default)]
    versions: Vec<RawVersion>,
    #[serde(default)]
    variants: BTreeMap<String, RawVariant>,
    #[serde(default)]
    depends_on: Vec<RawDependency>,
    #[serde(default)]
    conflicts: Vec<RawConflict>,
    #[serde(default)]
    provides: Vec<RawProvides>,
    #[serde(default)]
    requires: Vec<RawRequires>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVersion {
    version: Version,
    #[serde(default)]
    preferred: bool,
    #[serde(default)]
    deprecated: bool,
    sha256: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDefault {
    Bool(bool),
    Text(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVariant {
    default: RawDefault,
    values: Option<Vec<String>>,
    #[serde(default)]
    multi: bool,
    when: Option<Spec>,
    #[serde(default)]
    sticky: bool,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependency {
    spec: Spec,
    #[serde(rename = "type")]
    types: Option<DepTypes>,
    when: Option<Spec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConflict {
    spec: Spec,
    when: Option<Spec>,
    msg: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProvides {
    spec: Spec,
    when: Option<Spec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequires {
    spec: Option<Spec>,
    one_of: Option<Vec<Spec>>,
    any_of: Option<Vec<Spec>>,
    when: Option<Spec>,
    msg: Option<String>,
}

impl RawRecipe {
    fn into_recipe(self) -> Result<Recipe, RecipeError> {
        let name = self.name;
        let invalid = |message: String| RecipeError::Invalid {
            package: name.clone(),
            message,
        };

        let mut variants = BTreeMap::new();
        for (vname, raw) in self.variants {
            let (default, domain) = match (raw.default, raw.values) {
                (RawDefault::Bool(b), None) => (VariantValue::Bool(b), VariantDomain::Bool),
                (RawDefault::Bool(_), Some(_)) => {
                    return Err(invalid(format!("boolean variant `{vname}` lists values")));
                }
                (RawDefault::Text(t), values) => {
                    let default = if raw.multi {
                        VariantValue::Multi(t.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                    } else {
                        VariantValue::Single(t)
                    };
                    let domain = values.map_or(VariantDomain::Any, VariantDomain::Values);
                    (default, domain)
                }
            };
            variants.insert(
                vname.clone(),
                VariantDef {
                    name: vname,
                    default,
                    domain,
                    multi: raw.multi,
                    when: raw.when,
                    sticky: raw.sticky,
                    description: raw.description,
                },
            );
        }

        let mut requires = Vec::new();
        for raw in self.requires {
            let (alternatives, policy) = match (raw.spec, raw.one_of, raw.any_of) {
                (Some(spec), None, None) => (vec![spec], RequirePolicy::AnyOf),
                (None, Some(specs), None) => (specs, RequirePolicy::OneOf),
                (None, None, Some(specs)) => (specs, RequirePolicy::AnyOf),
                _ => return Err(invalid("requires needs exactly one of spec, one_of, any_of".to_string())),
            };
            requires.push(RequiresDecl {
                alternatives,
                policy,
                when: raw.when,
                msg: raw.msg,
            });
        }

        let recipe = Recipe {
            name: name.clone(),
            versions: self
                .versions
                .into_iter()
                .map(|v| VersionDecl {
                    version: v.version,
                    preferred: v.preferred,
                    deprecated: v.deprecated,
                    checksum: v.sha256,
                })
                .collect(),
            variants,
            dependencies: self
                .depends_on
                .into_iter()
                .map(|d| DependencyDecl {
                    spec: d.spec,
                    types: d.types.unwrap_or_default(),
                    when: d.when,
                })
                .collect(),
            conflicts: self
                .conflicts
                .into_iter()
                .map(|c| ConflictDecl {
                    spec: c.spec,
                    when: c.when,
                    msg: c.msg,
                })
                .collect(),
            provides: self
                .provides
                .into_iter()
                .map(|p| ProvidesDecl {
                    spec: p.spec,
                    when: p.when,
                })
                .collect(),
            requires,
            build_system: self.build_system,
        };
        recipe.validate()?;
        Ok(recipe)
    }
}

/// Read-only recipe lookup.
///
/// Implementations must be safe to share across threads: independent
/// solves may query one index concurrently.
pub trait RecipeIndex: Send + Sync {
    /// The recipe for a concrete (non-virtual) package.
    fn recipe(&self, name: &str) -> Option<&Recipe>;

    /// All package names with a recipe, sorted.
    fn package_names(&self) -> Vec<String>;

    /// Packages with at least one `provides` declaration for `virtual_name`.
    fn providers_of(&self, virtual_name: &str) -> BTreeSet<String> {
        self.package_names()
            .into_iter()
            .filter(|name| {
                self.recipe(name)
                    .is_some_and(|r| r.provides.iter().any(|p| p.virtual_name() == virtual_name))
            })
            .collect()
    }

    fn is_virtual(&self, name: &str) -> bool {
        self.recipe(name).is_none() && !self.providers_of(name).is_empty()
    }

    /// Known either as a package or as a virtual.
    fn contains(&self, name: &str) -> bool {
        self.recipe(name).is_some() || self.is_virtual(name)
    }

    /// Declared versions, ascending.
    fn versions_of(&self, name: &str) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .recipe(name)
            .map(|r| r.versions.iter().map(|d| d.version.clone()).collect())
            .unwrap_or_default();
        versions.sort();
        versions.dedup();
        versions
    }

    fn variants_of(&self, name: &str) -> BTreeMap<String, VariantDef> {
        self.recipe(name).map(|r| r.variants.clone()).unwrap_or_default()
    }

    /// Dependencies whose `when` condition is implied by `assignment`.
    fn dependencies_of(&self, name: &str, assignment: &Spec) -> Vec<DependencyDecl> {
        let Some(recipe) = self.recipe(name) else {
            return Vec::new();
        };
        let mut own = assignment.clone();
        own.name = None;
        recipe
            .dependencies
            .iter()
            .filter(|d| {
                d.when.as_ref().is_none_or(|w| {
                    let mut w = w.clone();
                    w.name = None;
                    own.satisfies(&w)
                })
            })
            .cloned()
            .collect()
    }
}

/// Recipes held in memory, optionally loaded from recipe directories.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecipeIndex {
    recipes: BTreeMap<String, Recipe>,
    providers: BTreeMap<String, BTreeSet<String>>,
}

impl InMemoryRecipeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a recipe.
    pub fn add(&mut self, recipe: Recipe) {
        if let Some(old) = self.recipes.remove(&recipe.name) {
            for p in &old.provides {
                if let Some(set) = self.providers.get_mut(p.virtual_name()) {
                    set.remove(&old.name);
                }
            }
        }
        for p in &recipe.provides {
            self.providers
                .entry(p.virtual_name().to_string())
                .or_default()
                .insert(recipe.name.clone());
        }
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Load every `*.toml` file of one recipe directory.
    pub fn load_dir(dir: &Path) -> Result<Self, RecipeError> {
        Self::load_repos(&[dir.to_path_buf()])
    }

    /// Load several recipe directories. A package defined in more than one
    /// directory is taken from the first.
    pub fn load_repos(dirs: &[PathBuf]) -> Result<Self, RecipeError> {
        let mut index = Self::new();
        for dir in dirs {
            let entries = fs::read_dir(dir).map_err(|source| RecipeError::Io {
                path: dir.clone(),
                source,
            })?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            files.sort();
            for path in files {
                let text = fs::read_to_string(&path).map_err(|source| RecipeError::Io {
                    path: path.clone(),
                    source,
                })?;
                let recipe = Recipe::from_toml_at(&text, &path)?;
                if index.recipes.contains_key(&recipe.name) {
                    tracing::debug!(package = %recipe.name, path = %path.display(), "shadowed by an earlier repository");
                    continue;
                }
                index.add(recipe);
            }
        }
        Ok(index)
    }
}

impl FromIterator<Recipe> for InMemoryRecipeIndex {
    fn from_iter<I: IntoIterator<Item = Recipe>>(iter: I) -> Self {
        let mut index = Self::new();
        for recipe in iter {
            index.add(recipe);
        }
        index
    }
}

impl RecipeIndex for InMemoryRecipeIndex {
    fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name)
    }

    fn package_names(&self) -> Vec<String> {
        self.recipes.keys().cloned().collect()
    }

    fn providers_of(&self, virtual_name: &str) -> BTreeSet<String> {
        self.providers.get(virtual_name).cloned().unwrap_or_default()
    }
}
