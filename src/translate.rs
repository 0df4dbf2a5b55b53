//! Translation of root specs and recipes into a resolvo problem.
//!
//! Every package in the transitive closure of the roots becomes several
//! solver names (see [`NodeName`]): its version, one per variant, one per
//! value of a multi-valued variant, its compiler and its target. Recipe
//! declarations are attached to the package's version candidates:
//!
//! - `depends_on` becomes requirements, conditioned on the non-version
//!   atoms of its `when` clause. The version part of every `when` clause is
//!   evaluated eagerly against the candidate it is attached to.
//! - `conflicts` becomes an exclusion (version-only), an inverted
//!   `constrains` entry (one atom) or a guard candidate required under all
//!   atoms but one and constraining the last (several atoms).
//! - `requires` becomes one guard per alternative and a union requirement.
//! - `provides` becomes candidates of the virtual's choice name.
//!
//! Constraints that come from the user or from a recipe carry an [`Origin`];
//! the translator can leave any subset of them out, which is how
//! [`unsat_core`](crate::unsat_core) searches for a minimal conflicting core.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

use resolvo::{
    Condition, ConditionId, ConditionalRequirement, LogicalOperator, Problem, Requirement, SolvableId,
    VersionSetId,
};

use crate::config::Config;
use crate::error::{ConcretizeError, InvalidVariantError, InvalidVariantReason, ParseError, Result};
use crate::pool::{Constraint, InstalledPolicy, InstalledSet, NodeName, SolvableRecord, VersionSet};
use crate::provider::SpackleProvider;
use crate::recipe::{DependencyDecl, Recipe, RecipeIndex, RequirePolicy};
use crate::spec::Spec;
use crate::variant::{VariantDef, VariantDomain};
use crate::version::{Version, VersionList};

/// Where a constraint of the problem comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    /// The root spec at `index`, without its `^` constraints.
    Root { index: usize },
    /// A `^package` constraint of the root at `index`.
    RootDependency { index: usize, package: String },
    /// `packages.<package>.require` from configuration.
    Requirement { package: String },
    /// The `depends_on` declaration at `index` of `package`.
    Dependency { package: String, index: usize },
    Conflict { package: String, index: usize },
    Requires { package: String, index: usize },
}

impl Origin {
    /// A sentence naming the constraint, for error reports.
    pub fn describe(&self, roots: &[Spec], index: &dyn RecipeIndex, config: &Config) -> String {
        let recipe = |package: &str| index.recipe(package);
        let when = |w: &Option<Spec>| match w {
            Some(w) => format!(" when `{w}`"),
            None => String::new(),
        };
        match self {
            Origin::Root { index } => match roots.get(*index) {
                Some(root) => format!("`{}` was requested", root.own()),
                None => format!("root #{index} was requested"),
            },
            Origin::RootDependency { index, package } => {
                let root = roots.get(*index);
                let dep = root.and_then(|r| r.dependency(package));
                match (root, dep) {
                    (Some(root), Some(dep)) => {
                        format!("`^{dep}` was requested with `{}`", root.name_str())
                    }
                    _ => format!("`^{package}` was requested"),
                }
            }
            Origin::Requirement { package } => match config.requirement(package) {
                Some(spec) => format!("configuration requires `{package}` to satisfy `{spec}`"),
                None => format!("configuration requirement on `{package}`"),
            },
            Origin::Dependency { package, index } => {
                match recipe(package).and_then(|r| r.dependencies.get(*index)) {
                    Some(dep) => format!("`{package}` depends on `{}`{}", dep.spec, when(&dep.when)),
                    None => format!("`{package}` dependency #{index}"),
                }
            }
            Origin::Conflict { package, index } => {
                match recipe(package).and_then(|r| r.conflicts.get(*index)) {
                    Some(c) => {
                        let mut text = format!("`{package}` conflicts with `{}`{}", c.spec, when(&c.when));
                        if let Some(msg) = &c.msg {
                            text.push_str(&format!(" ({msg})"));
                        }
                        text
                    }
                    None => format!("`{package}` conflict #{index}"),
                }
            }
            Origin::Requires { package, index } => {
                match recipe(package).and_then(|r| r.requires.get(*index)) {
                    Some(r) => {
                        let alternatives: Vec<String> = r.alternatives.iter().map(|a| format!("`{a}`")).collect();
                        let policy = match r.policy {
                            RequirePolicy::OneOf => "exactly one of",
                            RequirePolicy::AnyOf => "one of",
                        };
                        let mut text = format!(
                            "`{package}` requires {policy} {}{}",
                            alternatives.join(", "),
                            when(&r.when)
                        );
                        if let Some(msg) = &r.msg {
                            text.push_str(&format!(" ({msg})"));
                        }
                        text
                    }
                    None => format!("`{package}` requirement #{index}"),
                }
            }
        }
    }
}

/// A translated problem, ready for [`resolvo::Solver`].
pub struct Translation {
    pub provider: SpackleProvider,
    pub requirements: Vec<ConditionalRequirement>,
    pub constraints: Vec<VersionSetId>,
    /// Every origin the problem could contain, enabled or not.
    pub origins: BTreeSet<Origin>,
}

impl Translation {
    pub fn into_parts(self) -> (SpackleProvider, Problem<std::iter::Empty<SolvableId>>) {
        let problem = Problem::new()
            .requirements(self.requirements)
            .constraints(self.constraints);
        (self.provider, problem)
    }
}

/// A single test on one solver name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Atom {
    name: NodeName,
    constraint: Constraint,
}

impl Atom {
    fn new(name: NodeName, constraint: Constraint) -> Self {
        Self { name, constraint }
    }

    /// An atom no candidate can satisfy.
    fn never(package: &str) -> Self {
        Self::new(
            NodeName::Package(package.to_string()),
            Constraint::Versions(VersionList::from_items([])),
        )
    }
}

/// Builds [`Translation`]s for one recipe index and configuration.
pub struct Translator<'a> {
    index: &'a dyn RecipeIndex,
    config: &'a Config,
    installed: &'a InstalledSet,
    tests: bool,
}

impl<'a> Translator<'a> {
    pub fn new(index: &'a dyn RecipeIndex, config: &'a Config, installed: &'a InstalledSet, tests: bool) -> Self {
        Self {
            index,
            config,
            installed,
            tests,
        }
    }

    /// Check `roots` against the index and build the problem. `enabled`
    /// restricts which origin-tagged constraints are emitted; `None` emits
    /// all of them.
    pub fn translate(
        &self,
        roots: &[Spec],
        enabled: Option<&BTreeSet<Origin>>,
        deadline: Option<Instant>,
    ) -> Result<Translation> {
        let roots = self.check_roots(roots)?;
        if self.config.compilers.is_empty() {
            return Err(ConcretizeError::NoCompilers);
        }
        let root_names: BTreeSet<String> = roots.iter().map(|r| r.name_str().to_string()).collect();
        let (packages, virtuals) = self.closure(&roots, &root_names)?;

        let mut ctx = TranslateContext {
            index: self.index,
            config: self.config,
            tests: self.tests,
            root_names,
            packages,
            virtuals,
            enabled,
            origins: BTreeSet::new(),
            provider: SpackleProvider::new(deadline),
            versions: BTreeMap::new(),
            members: BTreeMap::new(),
            installed: BTreeMap::new(),
            requirements: Vec::new(),
            constraints: Vec::new(),
        };
        ctx.collect_installed(self.installed);
        ctx.add_candidates(&roots);
        ctx.add_virtual_choices();
        ctx.add_declarations();
        ctx.add_roots(&roots);
        ctx.add_config_requirements();
        ctx.apply_installed();

        tracing::debug!(
            packages = ctx.packages.len(),
            virtuals = ctx.virtuals.len(),
            names = ctx.provider.pool().name_count(),
            solvables = ctx.provider.pool().solvable_count(),
            dependencies = ctx.provider.dependency_count(),
            requirements = ctx.requirements.len(),
            "translated problem"
        );

        Ok(Translation {
            provider: ctx.provider,
            requirements: ctx.requirements,
            constraints: ctx.constraints,
            origins: ctx.origins,
        })
    }

    /// Reject unknown names and invalid variants; return the roots with
    /// variant values normalized to their declared shape.
    fn check_roots(&self, roots: &[Spec]) -> Result<Vec<Spec>> {
        let mut checked = Vec::with_capacity(roots.len());
        for root in roots {
            let Some(name) = root.name.as_deref() else {
                let text = root.to_string();
                return Err(ParseError::new(&text, 0, "cannot concretize an anonymous spec").into());
            };
            if !self.index.contains(name) {
                return Err(ConcretizeError::UnknownPackage {
                    name: name.to_string(),
                    needed_by: "the request".to_string(),
                });
            }
            let mut root = root.clone();
            self.check_node_variants(&mut root)?;
            for dep in &mut root.dependencies {
                let dep_name = dep.name_str().to_string();
                if !self.index.contains(&dep_name) {
                    return Err(ConcretizeError::UnknownPackage {
                        name: dep_name,
                        needed_by: name.to_string(),
                    });
                }
                self.check_node_variants(dep)?;
            }
            checked.push(root);
        }
        Ok(checked)
    }

    fn check_node_variants(&self, spec: &mut Spec) -> Result<()> {
        let name = spec.name_str().to_string();
        let Some(recipe) = self.index.recipe(&name) else {
            // Virtuals carry no variants.
            if let Some(variant) = spec.variants.keys().next() {
                return Err(InvalidVariantError {
                    package: name,
                    variant: variant.clone(),
                    reason: InvalidVariantReason::Undeclared,
                }
                .into());
            }
            return Ok(());
        };
        let own = spec.own();
        let mut normalized = BTreeMap::new();
        for (variant, value) in &spec.variants {
            normalized.insert(variant.clone(), recipe.check_variant(variant, value, &own)?);
        }
        spec.variants = normalized;
        Ok(())
    }

    /// Every package and virtual reachable from the roots through any
    /// `depends_on`, regardless of its `when` clause.
    fn closure(
        &self,
        roots: &[Spec],
        root_names: &BTreeSet<String>,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut packages = BTreeSet::new();
        let mut virtuals = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for root in roots {
            queue.push_back(root.name_str().to_string());
            queue.extend(root.dependencies.iter().map(|d| d.name_str().to_string()));
        }

        while let Some(name) = queue.pop_front() {
            if let Some(recipe) = self.index.recipe(&name) {
                if !packages.insert(name.clone()) {
                    continue;
                }
                for dep in &recipe.dependencies {
                    if !follows(self.tests, root_names, &name, dep) {
                        continue;
                    }
                    let mut needed = vec![dep.name()];
                    needed.extend(dep.spec.dependencies.iter().map(Spec::name_str));
                    for dep_name in needed {
                        if !self.index.contains(dep_name) {
                            return Err(ConcretizeError::UnknownPackage {
                                name: dep_name.to_string(),
                                needed_by: name.clone(),
                            });
                        }
                        queue.push_back(dep_name.to_string());
                    }
                }
            } else if self.index.is_virtual(&name) {
                if virtuals.insert(name.clone()) {
                    queue.extend(self.index.providers_of(&name));
                }
            }
        }
        Ok((packages, virtuals))
    }
}

/// Whether the dependency `dep` of `package` takes part in the solve.
pub(crate) fn follows(tests: bool, roots: &BTreeSet<String>, package: &str, dep: &DependencyDecl) -> bool {
    !dep.types.is_test_only() || (tests && roots.contains(package))
}

struct TranslateContext<'t> {
    index: &'t dyn RecipeIndex,
    config: &'t Config,
    tests: bool,
    root_names: BTreeSet<String>,
    packages: BTreeSet<String>,
    virtuals: BTreeSet<String>,
    enabled: Option<&'t BTreeSet<Origin>>,
    origins: BTreeSet<Origin>,
    provider: SpackleProvider,
    /// Version candidates per package.
    versions: BTreeMap<String, Vec<(Version, SolvableId)>>,
    /// Values with membership candidates, per multi-valued (package, variant).
    members: BTreeMap<(String, String), Vec<String>>,
    installed: BTreeMap<String, (crate::dag::ConcreteNode, InstalledPolicy)>,
    requirements: Vec<ConditionalRequirement>,
    constraints: Vec<VersionSetId>,
}

impl<'t> TranslateContext<'t> {
    /// Record `origin` and report whether its constraints are emitted.
    fn enabled(&mut self, origin: Origin) -> bool {
        let on = self.enabled.is_none_or(|set| set.contains(&origin));
        self.origins.insert(origin);
        on
    }

    fn variant_def(&self, package: &str, variant: &str) -> Option<&'t VariantDef> {
        let index = self.index;
        index.recipe(package).and_then(|r| r.variants.get(variant))
    }

    fn members(&self, package: &str, variant: &str) -> Vec<String> {
        self.members
            .get(&(package.to_string(), variant.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn collect_installed(&mut self, installed: &InstalledSet) {
        for (node, policy) in &installed.nodes {
            if !self.packages.contains(&node.name) || self.installed.contains_key(&node.name) {
                continue;
            }
            if !self.config.concretizer.reuse && *policy == InstalledPolicy::Favored {
                continue;
            }
            self.installed.insert(node.name.clone(), (node.clone(), *policy));
        }
    }

    // --- candidates ---

    /// Variant values mentioned anywhere in the request, recipes,
    /// configuration or installed nodes, per (package, variant).
    fn mentioned_tokens(&self, roots: &[Spec]) -> BTreeMap<(String, String), BTreeSet<String>> {
        let mut mentions: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        let mut mention = |package: &str, spec: &Spec| {
            for (variant, value) in &spec.variants {
                mentions
                    .entry((package.to_string(), variant.clone()))
                    .or_default()
                    .extend(value.tokens());
            }
        };
        for root in roots {
            mention(root.name_str(), root);
            for dep in &root.dependencies {
                mention(dep.name_str(), dep);
            }
        }
        for package in &self.packages {
            let Some(recipe) = self.index.recipe(package) else { continue };
            for dep in &recipe.dependencies {
                mention(dep.name(), &dep.spec);
                for sub in &dep.spec.dependencies {
                    mention(sub.name_str(), sub);
                }
            }
            for requires in &recipe.requires {
                for alternative in &requires.alternatives {
                    mention(package, alternative);
                }
            }
            if let Some(prefs) = self.config.variant_preferences(package) {
                mention(package, prefs);
            }
            if let Some(req) = self.config.requirement(package) {
                mention(package, req);
            }
        }
        for (node, _) in self.installed.values() {
            for (variant, value) in &node.variants {
                mentions
                    .entry((node.name.clone(), variant.clone()))
                    .or_default()
                    .extend(value.tokens());
            }
        }
        mentions
    }

    /// Whether a root or one of its `^` constraints names `variant` of `package`.
    fn root_mentions(roots: &[Spec], package: &str, variant: &str) -> bool {
        roots.iter().any(|root| {
            std::iter::once(root)
                .chain(root.dependencies.iter())
                .any(|s| s.name_str() == package && s.variants.contains_key(variant))
        })
    }

    fn add_candidates(&mut self, roots: &[Spec]) {
        let mentions = self.mentioned_tokens(roots);
        let index = self.index;
        let packages: Vec<String> = self.packages.iter().cloned().collect();
        for package in packages {
            let Some(recipe) = index.recipe(&package) else { continue };
            let installed = self.installed.get(&package).map(|(n, _)| n.clone());

            // Versions.
            let mut versions = index.versions_of(&package);
            if let Some(node) = &installed {
                if !versions.contains(&node.version) {
                    versions.push(node.version.clone());
                }
            }
            for version in versions {
                let sid = self.provider.add_candidate(
                    NodeName::Package(package.clone()),
                    SolvableRecord::Package {
                        name: package.clone(),
                        version: version.clone(),
                    },
                );
                self.versions.entry(package.clone()).or_default().push((version, sid));
            }
            let prefs = &mut self.provider.preferences;
            prefs
                .versions
                .insert(package.clone(), self.config.preferred_versions(&package).to_vec());
            prefs.recipe_preferred.insert(
                package.clone(),
                recipe.versions.iter().filter(|d| d.preferred).map(|d| d.version.clone()).collect(),
            );
            prefs.deprecated.insert(
                package.clone(),
                recipe.versions.iter().filter(|d| d.deprecated).map(|d| d.version.clone()).collect(),
            );

            // Variants.
            for def in recipe.variants.values() {
                let key = (package.clone(), def.name.clone());
                let mut tokens = def.domain_tokens();
                if def.domain == VariantDomain::Any {
                    for token in mentions.get(&key).into_iter().flatten() {
                        if !tokens.contains(token) {
                            tokens.push(token.clone());
                        }
                    }
                }
                let defaults = def.default.tokens();
                let sticky = def.sticky && !Self::root_mentions(roots, &package, &def.name);
                let preferred: Vec<String> = self
                    .config
                    .variant_preferences(&package)
                    .and_then(|s| s.variants.get(&def.name))
                    .map(|v| v.tokens().into_iter().collect())
                    .unwrap_or_else(|| defaults.iter().cloned().collect());
                self.provider.preferences.variants.insert(key, preferred);

                let mut created = Vec::new();
                if def.multi {
                    self.members.insert((package.clone(), def.name.clone()), tokens.clone());
                    for token in &tokens {
                        let states: &[bool] = if sticky {
                            if defaults.contains(token) { &[true] } else { &[false] }
                        } else {
                            &[true, false]
                        };
                        for &present in states {
                            created.push(self.provider.add_candidate(
                                NodeName::Member {
                                    package: package.clone(),
                                    variant: def.name.clone(),
                                    value: token.clone(),
                                },
                                SolvableRecord::Member {
                                    package: package.clone(),
                                    variant: def.name.clone(),
                                    value: token.clone(),
                                    present,
                                },
                            ));
                        }
                    }
                } else {
                    let allowed: Vec<String> = if sticky {
                        defaults.iter().cloned().collect()
                    } else {
                        tokens.clone()
                    };
                    for token in allowed {
                        created.push(self.provider.add_candidate(
                            NodeName::Variant {
                                package: package.clone(),
                                variant: def.name.clone(),
                            },
                            SolvableRecord::Variant {
                                package: package.clone(),
                                variant: def.name.clone(),
                                value: token,
                            },
                        ));
                    }
                }

                // A conditional variant's values only exist under its condition.
                if let Some(when) = &def.when {
                    let mut atoms = vec![Atom::new(
                        NodeName::Package(package.clone()),
                        Constraint::Versions(when.versions.clone()),
                    )];
                    atoms.extend(self.clause_atoms(&package, when));
                    for sid in created {
                        for atom in &atoms {
                            let vs = self.version_set(atom, false);
                            self.provider.dependencies_mut(sid).requirements.push(ConditionalRequirement {
                                condition: None,
                                requirement: Requirement::Single(vs),
                            });
                        }
                    }
                }
            }

            // Compilers, in configuration order.
            let mut compilers: Vec<(String, Version)> = self
                .config
                .compiler_order(&package)
                .into_iter()
                .map(|c| (c.name.clone(), c.version.clone()))
                .collect();
            if let Some(node) = &installed {
                let entry = (node.compiler.name.clone(), node.compiler.version.clone());
                if !compilers.contains(&entry) {
                    compilers.push(entry);
                }
            }
            for (compiler, version) in &compilers {
                self.provider.add_candidate(
                    NodeName::Compiler(package.clone()),
                    SolvableRecord::Compiler {
                        package: package.clone(),
                        compiler: compiler.clone(),
                        version: version.clone(),
                    },
                );
            }
            self.provider.preferences.compilers.insert(package.clone(), compilers);

            // Targets.
            let targets = self.config.target_order(&package);
            let mut arches: Vec<_> = targets.iter().map(|t| self.config.arch_for_target(t)).collect();
            if let Some(node) = &installed {
                if !arches.contains(&node.arch) {
                    arches.push(node.arch.clone());
                }
            }
            for arch in arches {
                self.provider.add_candidate(
                    NodeName::Target(package.clone()),
                    SolvableRecord::Target {
                        package: package.clone(),
                        arch,
                    },
                );
            }
            self.provider.preferences.targets.insert(package.clone(), targets);
        }
    }

    fn add_virtual_choices(&mut self) {
        let index = self.index;
        let virtuals: Vec<String> = self.virtuals.iter().cloned().collect();
        for virtual_name in virtuals {
            self.provider.preferences.providers.insert(
                virtual_name.clone(),
                self.config.provider_order(&virtual_name).to_vec(),
            );
            for provider in index.providers_of(&virtual_name) {
                let Some(recipe) = index.recipe(&provider) else { continue };
                let versions = self.versions.get(&provider).cloned().unwrap_or_default();
                for decl in recipe.provides.iter().filter(|d| d.virtual_name() == virtual_name) {
                    for (version, _) in &versions {
                        if decl.when.as_ref().is_some_and(|w| !w.versions.contains(version)) {
                            continue;
                        }
                        let sid = self.provider.add_candidate(
                            NodeName::Virtual(virtual_name.clone()),
                            SolvableRecord::Provider {
                                virtual_name: virtual_name.clone(),
                                provider: provider.clone(),
                                version: version.clone(),
                                provided: decl.spec.versions.clone(),
                            },
                        );
                        let mut atoms = vec![Atom::new(
                            NodeName::Package(provider.clone()),
                            Constraint::Versions(VersionList::exact(version.clone())),
                        )];
                        if let Some(when) = &decl.when {
                            atoms.extend(self.clause_atoms(&provider, when));
                        }
                        self.require_all(sid, None, &atoms);
                    }
                }
            }
        }
    }

    // --- atoms ---

    /// Variant, compiler and target atoms of `spec` applied to `package`.
    fn node_atoms(&self, package: &str, spec: &Spec) -> Vec<Atom> {
        let mut atoms = Vec::new();
        for (variant, value) in &spec.variants {
            let tokens = value.tokens();
            match self.variant_def(package, variant) {
                Some(def) if def.multi => {
                    for token in tokens {
                        atoms.push(Atom::new(
                            NodeName::Member {
                                package: package.to_string(),
                                variant: variant.clone(),
                                value: token,
                            },
                            Constraint::Present(true),
                        ));
                    }
                }
                _ => {
                    let tokens = if tokens.len() > 1 { BTreeSet::new() } else { tokens };
                    atoms.push(Atom::new(
                        NodeName::Variant {
                            package: package.to_string(),
                            variant: variant.clone(),
                        },
                        Constraint::Values(tokens),
                    ));
                }
            }
        }
        if let Some(compiler) = &spec.compiler {
            atoms.push(Atom::new(
                NodeName::Compiler(package.to_string()),
                Constraint::Compiler(compiler.clone()),
            ));
        }
        if !spec.arch.is_empty() {
            atoms.push(Atom::new(
                NodeName::Target(package.to_string()),
                Constraint::Arch(spec.arch.clone()),
            ));
        }
        atoms
    }

    /// Atoms requiring the named `spec` to be in the graph.
    fn dependency_atoms(&self, spec: &Spec) -> Vec<Atom> {
        let name = spec.name_str();
        let mut atoms = Vec::new();
        if self.index.recipe(name).is_none() && self.index.is_virtual(name) {
            atoms.push(Atom::new(
                NodeName::Virtual(name.to_string()),
                Constraint::Providers {
                    providers: None,
                    versions: spec.versions.clone(),
                },
            ));
        } else {
            atoms.push(Atom::new(
                NodeName::Package(name.to_string()),
                Constraint::Versions(spec.versions.clone()),
            ));
            atoms.extend(self.node_atoms(name, spec));
        }
        for sub in &spec.dependencies {
            atoms.extend(self.dependency_atoms(sub));
        }
        atoms
    }

    /// Non-version atoms of a clause on `package` itself, `^` constraints included.
    fn clause_atoms(&self, package: &str, spec: &Spec) -> Vec<Atom> {
        let mut atoms = self.node_atoms(package, spec);
        for dep in &spec.dependencies {
            atoms.extend(self.dependency_atoms(dep));
        }
        atoms
    }

    fn version_set(&mut self, atom: &Atom, inverted: bool) -> VersionSetId {
        let pool = &mut self.provider.pool;
        let name = pool.intern_name(atom.name.clone());
        let set = VersionSet {
            constraint: atom.constraint.clone(),
            inverted,
        };
        pool.intern_version_set(name, set)
    }

    /// The conjunction of `atoms`, `None` when empty.
    fn condition(&mut self, atoms: &[Atom]) -> Option<ConditionId> {
        let mut acc: Option<ConditionId> = None;
        for atom in atoms {
            let vs = self.version_set(atom, false);
            let pool = &mut self.provider.pool;
            let leaf = pool.intern_condition(Condition::Requirement(vs));
            acc = Some(match acc {
                None => leaf,
                Some(prev) => pool.intern_condition(Condition::Binary(LogicalOperator::And, prev, leaf)),
            });
        }
        acc
    }

    fn require_all(&mut self, sid: SolvableId, condition: Option<ConditionId>, atoms: &[Atom]) {
        for atom in atoms {
            let vs = self.version_set(atom, false);
            self.provider.dependencies_mut(sid).requirements.push(ConditionalRequirement {
                condition,
                requirement: Requirement::Single(vs),
            });
        }
    }

    fn forbid(&mut self, sid: SolvableId, atom: &Atom) {
        let vs = self.version_set(atom, true);
        self.provider.dependencies_mut(sid).constrains.push(vs);
    }

    fn guard(&mut self, label: String) -> (SolvableId, Atom) {
        let name = NodeName::Guard(label.clone());
        let sid = self.provider.add_candidate(name.clone(), SolvableRecord::Guard { label });
        (sid, Atom::new(name, Constraint::Any))
    }

    // --- declarations ---

    fn add_declarations(&mut self) {
        let index = self.index;
        let packages: Vec<String> = self.packages.iter().cloned().collect();
        for package in packages {
            let Some(recipe) = index.recipe(&package) else { continue };
            let versions = self.versions.get(&package).cloned().unwrap_or_default();
            for (version, sid) in versions {
                self.add_node_requirements(recipe, &version, sid);
                self.add_dependencies(recipe, &version, sid);
                self.add_provides(recipe, &version, sid);
                self.add_conflicts(recipe, &version, sid);
                self.add_requires(recipe, &version, sid);
            }
        }
    }

    /// A chosen version needs a compiler, a target and a value for every
    /// variant whose condition holds.
    fn add_node_requirements(&mut self, recipe: &'t Recipe, version: &Version, sid: SolvableId) {
        let package = recipe.name.as_str();
        let always = [
            Atom::new(NodeName::Compiler(package.to_string()), Constraint::Any),
            Atom::new(NodeName::Target(package.to_string()), Constraint::Any),
        ];
        self.require_all(sid, None, &always);

        for def in recipe.variants.values() {
            let condition = match &def.when {
                Some(when) if !when.versions.contains(version) => continue,
                Some(when) => {
                    let atoms = self.clause_atoms(package, when);
                    self.condition(&atoms)
                }
                None => None,
            };
            if def.multi {
                let mut present = Vec::new();
                for value in self.members(package, &def.name) {
                    let member = NodeName::Member {
                        package: package.to_string(),
                        variant: def.name.clone(),
                        value,
                    };
                    let any = self.version_set(&Atom::new(member.clone(), Constraint::Any), false);
                    self.provider.dependencies_mut(sid).requirements.push(ConditionalRequirement {
                        condition,
                        requirement: Requirement::Single(any),
                    });
                    present.push(self.version_set(&Atom::new(member, Constraint::Present(true)), false));
                }
                if !def.default.tokens().is_empty() && !present.is_empty() {
                    let union = self.provider.pool.intern_version_set_union(present);
                    self.provider.dependencies_mut(sid).requirements.push(ConditionalRequirement {
                        condition,
                        requirement: Requirement::Union(union),
                    });
                }
            } else {
                let atom = Atom::new(
                    NodeName::Variant {
                        package: package.to_string(),
                        variant: def.name.clone(),
                    },
                    Constraint::Any,
                );
                self.require_all(sid, condition, &[atom]);
            }
        }
    }

    fn add_dependencies(&mut self, recipe: &Recipe, version: &Version, sid: SolvableId) {
        let package = recipe.name.as_str();
        for (index, dep) in recipe.dependencies.iter().enumerate() {
            if !follows(self.tests, &self.root_names, package, dep) {
                continue;
            }
            if !self.enabled(Origin::Dependency {
                package: package.to_string(),
                index,
            }) {
                continue;
            }
            let condition = match &dep.when {
                Some(when) if !when.versions.contains(version) => continue,
                Some(when) => {
                    let atoms = self.clause_atoms(package, when);
                    self.condition(&atoms)
                }
                None => None,
            };
            let atoms = self.dependency_atoms(&dep.spec);
            self.require_all(sid, condition, &atoms);
        }
    }

    /// A package that unconditionally provides a virtual pins the virtual's
    /// choice to itself.
    fn add_provides(&mut self, recipe: &Recipe, version: &Version, sid: SolvableId) {
        for decl in &recipe.provides {
            let virtual_name = decl.virtual_name();
            if !self.virtuals.contains(virtual_name) {
                continue;
            }
            let unconditional = decl.when.as_ref().is_none_or(|when| {
                when.versions.contains(version)
                    && when.variants.is_empty()
                    && when.compiler.is_none()
                    && when.arch.is_empty()
                    && when.dependencies.is_empty()
            });
            if !unconditional {
                continue;
            }
            let atom = Atom::new(
                NodeName::Virtual(virtual_name.to_string()),
                Constraint::Providers {
                    providers: Some(BTreeSet::from([recipe.name.clone()])),
                    versions: VersionList::any(),
                },
            );
            let vs = self.version_set(&atom, false);
            self.provider.dependencies_mut(sid).constrains.push(vs);
        }
    }

    fn add_conflicts(&mut self, recipe: &Recipe, version: &Version, sid: SolvableId) {
        let package = recipe.name.as_str();
        for (index, conflict) in recipe.conflicts.iter().enumerate() {
            if !self.enabled(Origin::Conflict {
                package: package.to_string(),
                index,
            }) {
                continue;
            }
            let Some(trigger) = conflict.trigger() else { continue };
            if !trigger.versions.contains(version) {
                continue;
            }
            let mut atoms = self.clause_atoms(package, &trigger);
            match atoms.len() {
                0 => {
                    let reason = conflict
                        .msg
                        .clone()
                        .unwrap_or_else(|| format!("{package}@{version} conflicts with `{}`", conflict.spec));
                    self.provider.exclude(sid, reason);
                }
                1 => self.forbid(sid, &atoms[0]),
                _ => {
                    let Some(last) = atoms.pop() else { continue };
                    let (guard, guard_atom) = self.guard(format!("{package}@{version} conflict #{index}"));
                    self.forbid(guard, &last);
                    let condition = self.condition(&atoms);
                    self.require_all(sid, condition, &[guard_atom]);
                }
            }
        }
    }

    fn add_requires(&mut self, recipe: &Recipe, version: &Version, sid: SolvableId) {
        let package = recipe.name.as_str();
        for (index, requires) in recipe.requires.iter().enumerate() {
            if !self.enabled(Origin::Requires {
                package: package.to_string(),
                index,
            }) {
                continue;
            }
            let condition = match &requires.when {
                Some(when) if !when.versions.contains(version) => continue,
                Some(when) => {
                    let atoms = self.clause_atoms(package, when);
                    self.condition(&atoms)
                }
                None => None,
            };

            let alternatives: Vec<Vec<Atom>> = requires
                .alternatives
                .iter()
                .filter(|alt| alt.versions.contains(version))
                .map(|alt| self.clause_atoms(package, alt))
                .collect();
            if alternatives.is_empty() {
                match condition {
                    None => {
                        let reason = requires
                            .msg
                            .clone()
                            .unwrap_or_else(|| format!("{package}@{version} cannot meet requirement #{index}"));
                        self.provider.exclude(sid, reason);
                    }
                    Some(_) => self.require_all(sid, condition, &[Atom::never(package)]),
                }
                continue;
            }
            if requires.policy == RequirePolicy::AnyOf && alternatives.iter().any(Vec::is_empty) {
                continue;
            }

            let mut guards = Vec::with_capacity(alternatives.len());
            for (n, atoms) in alternatives.iter().enumerate() {
                let (guard, guard_atom) = self.guard(format!("{package}@{version} requirement #{index} option {n}"));
                self.require_all(guard, None, atoms);
                guards.push((guard, guard_atom));
            }
            if requires.policy == RequirePolicy::OneOf {
                for (i, (guard, _)) in guards.iter().enumerate() {
                    for (j, (_, other)) in guards.iter().enumerate() {
                        if i == j {
                            continue;
                        }
                        self.forbid(*guard, other);
                        if let [single] = alternatives[j].as_slice() {
                            self.forbid(*guard, single);
                        }
                    }
                }
            }
            let sets: Vec<VersionSetId> = guards.iter().map(|(_, atom)| self.version_set(atom, false)).collect();
            let requirement = if sets.len() == 1 {
                Requirement::Single(sets[0])
            } else {
                Requirement::Union(self.provider.pool.intern_version_set_union(sets))
            };
            self.provider
                .dependencies_mut(sid)
                .requirements
                .push(ConditionalRequirement { condition, requirement });
        }
    }

    // --- problem-level inputs ---

    fn add_roots(&mut self, roots: &[Spec]) {
        for (index, root) in roots.iter().enumerate() {
            if self.enabled(Origin::Root { index }) {
                let mut atoms = self.dependency_atoms(&root.own());
                atoms.extend(self.exact_members(root));
                self.push_requirements(&atoms);
            }
            for dep in &root.dependencies {
                let origin = Origin::RootDependency {
                    index,
                    package: dep.name_str().to_string(),
                };
                if self.enabled(origin) {
                    let mut atoms = self.dependency_atoms(dep);
                    atoms.extend(self.exact_members(dep));
                    self.push_requirements(&atoms);
                }
            }
        }
    }

    /// Requested multi-valued variants hold exactly the requested values.
    fn exact_members(&self, spec: &Spec) -> Vec<Atom> {
        let package = spec.name_str();
        let mut atoms = Vec::new();
        for variant in spec.variants.keys() {
            let Some(def) = self.variant_def(package, variant) else { continue };
            if !def.multi {
                continue;
            }
            let requested = spec.variants[variant].tokens();
            for value in self.members(package, variant) {
                if !requested.contains(&value) {
                    atoms.push(Atom::new(
                        NodeName::Member {
                            package: package.to_string(),
                            variant: variant.clone(),
                            value,
                        },
                        Constraint::Present(false),
                    ));
                }
            }
        }
        atoms
    }

    fn push_requirements(&mut self, atoms: &[Atom]) {
        for atom in atoms {
            let vs = self.version_set(atom, false);
            self.requirements.push(ConditionalRequirement {
                condition: None,
                requirement: Requirement::Single(vs),
            });
        }
    }

    fn add_config_requirements(&mut self) {
        let packages: Vec<String> = self.packages.iter().cloned().collect();
        for package in packages {
            let Some(spec) = self.config.requirement(&package) else { continue };
            if !self.enabled(Origin::Requirement {
                package: package.clone(),
            }) {
                continue;
            }
            let mut atoms = vec![Atom::new(
                NodeName::Package(package.clone()),
                Constraint::Versions(spec.versions.clone()),
            )];
            atoms.extend(self.node_atoms(&package, spec));
            for atom in atoms {
                let vs = self.version_set(&atom, false);
                self.constraints.push(vs);
            }
        }
    }

    /// Favor or lock the candidates that reproduce installed nodes.
    fn apply_installed(&mut self) {
        let installed: Vec<_> = self.installed.values().cloned().collect();
        for (node, policy) in installed {
            let package = node.name.clone();
            let mut wanted: Vec<(NodeName, SolvableRecord)> = vec![
                (
                    NodeName::Package(package.clone()),
                    SolvableRecord::Package {
                        name: package.clone(),
                        version: node.version.clone(),
                    },
                ),
                (
                    NodeName::Compiler(package.clone()),
                    SolvableRecord::Compiler {
                        package: package.clone(),
                        compiler: node.compiler.name.clone(),
                        version: node.compiler.version.clone(),
                    },
                ),
                (
                    NodeName::Target(package.clone()),
                    SolvableRecord::Target {
                        package: package.clone(),
                        arch: node.arch.clone(),
                    },
                ),
            ];
            for (variant, value) in &node.variants {
                let Some(def) = self.variant_def(&package, variant) else {
                    tracing::warn!(package = %package, variant = %variant, "installed variant no longer declared");
                    continue;
                };
                let tokens = value.tokens();
                if def.multi {
                    for member in self.members(&package, variant) {
                        wanted.push((
                            NodeName::Member {
                                package: package.clone(),
                                variant: variant.clone(),
                                value: member.clone(),
                            },
                            SolvableRecord::Member {
                                package: package.clone(),
                                variant: variant.clone(),
                                present: tokens.contains(&member),
                                value: member,
                            },
                        ));
                    }
                } else if let Some(token) = tokens.into_iter().next() {
                    wanted.push((
                        NodeName::Variant {
                            package: package.clone(),
                            variant: variant.clone(),
                        },
                        SolvableRecord::Variant {
                            package: package.clone(),
                            variant: variant.clone(),
                            value: token,
                        },
                    ));
                }
            }

            for (name, record) in wanted {
                let found = self
                    .provider
                    .candidates_of(&name)
                    .iter()
                    .copied()
                    .find(|&sid| *self.provider.record(sid) == record);
                match (found, policy) {
                    (Some(sid), InstalledPolicy::Favored) => self.provider.favor(sid),
                    (Some(sid), InstalledPolicy::Locked) => self.provider.lock(sid),
                    (None, _) => {
                        tracing::warn!(package = %package, candidate = %record, "installed value not available for reuse");
                    }
                }
            }
        }
    }
}
