//! The concretizer: roots in, concrete graphs out.
//!
//! A solve translates the request (see [`translate`](crate::translate)),
//! hands it to resolvo, decodes the chosen candidates into an
//! [`Assignment`], builds the [`ConcreteDag`] and re-checks it with
//! [`validate`](crate::validate). When no solution exists the request is
//! re-solved with subsets of its constraints to name a minimal conflicting
//! core.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use rayon::prelude::*;
use resolvo::{SolvableId, Solver, UnsolvableOrCancelled};

use crate::config::Config;
use crate::dag::{AssignedNode, Assignment, CompilerId, ConcreteDag, ProviderChoice};
use crate::error::{ConcretizeError, Result, UnsatisfiableError};
use crate::parser::parse_specs;
use crate::pool::{InstalledSet, SolvableRecord};
use crate::provider::SpackleProvider;
use crate::recipe::RecipeIndex;
use crate::spec::{ArchSpec, Spec};
use crate::translate::Translator;
use crate::unsat_core::{minimal_core, CoreConstraint};
use crate::validate;
use crate::version::Version;

/// Resolves abstract specs against a recipe index and configuration.
///
/// ```
/// use spackle::{CompilerEntry, Concretizer, Config, InMemoryRecipeIndex, Recipe, Version};
///
/// let index: InMemoryRecipeIndex = [Recipe::new("zlib")
///     .with_version(Version::parse("1.2.13").unwrap())
///     .with_version(Version::parse("1.3").unwrap())]
/// .into_iter()
/// .collect();
/// let mut config = Config::default();
/// config.compilers.push(CompilerEntry {
///     name: "gcc".into(),
///     version: Version::parse("12.2.0").unwrap(),
/// });
///
/// let dag = Concretizer::new(&index, &config).concretize_str("zlib").unwrap();
/// assert_eq!(dag.root("zlib").unwrap().version, Version::parse("1.3").unwrap());
/// ```
pub struct Concretizer<'a> {
    index: &'a dyn RecipeIndex,
    config: &'a Config,
    installed: InstalledSet,
    tests: bool,
}

impl<'a> Concretizer<'a> {
    pub fn new(index: &'a dyn RecipeIndex, config: &'a Config) -> Self {
        Self {
            index,
            config,
            installed: InstalledSet::default(),
            tests: config.concretizer.tests,
        }
    }

    /// Consider `installed` nodes for reuse.
    pub fn with_installed(mut self, installed: InstalledSet) -> Self {
        self.installed = installed;
        self
    }

    /// Include `test` dependencies of the roots.
    pub fn with_tests(mut self, tests: bool) -> Self {
        self.tests = tests;
        self
    }

    pub fn concretize_str(&self, text: &str) -> Result<ConcreteDag> {
        let roots = parse_specs(text)?;
        self.concretize(&roots)
    }

    /// Solve all `roots` together: every package appears once in the result.
    pub fn concretize(&self, roots: &[Spec]) -> Result<ConcreteDag> {
        let label = roots.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
        let span = tracing::info_span!("concretize", roots = %label);
        let _guard = span.enter();

        let started = Instant::now();
        let budget = self.config.timeout();
        let deadline = budget.map(|b| started + b);
        let translator = Translator::new(self.index, self.config, &self.installed, self.tests);
        let translation = translator.translate(roots, None, deadline)?;
        let origins = translation.origins.clone();
        let (provider, problem) = translation.into_parts();

        let mut solver = Solver::new(provider);
        match solver.solve(problem) {
            Ok(solution) => {
                let assignment = decode(self.index, solver.provider(), &solution)?;
                let dag = ConcreteDag::build(self.index, &assignment, roots, self.tests)?;
                let violations = validate::check(&dag, self.index, roots, self.tests, &self.installed);
                if !violations.is_empty() {
                    let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
                    return Err(ConcretizeError::Inconsistent(messages.join("; ")));
                }
                tracing::info!(
                    nodes = dag.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "concretized"
                );
                Ok(dag)
            }
            Err(UnsolvableOrCancelled::Unsolvable(conflict)) => {
                let explanation = conflict.display_user_friendly(&solver).to_string();
                let core = minimal_core(&translator, roots, &origins, deadline, budget.unwrap_or_default())?;
                let core: Vec<CoreConstraint> = core
                    .into_iter()
                    .map(|origin| CoreConstraint {
                        description: origin.describe(roots, self.index, self.config),
                        origin,
                    })
                    .collect();
                tracing::info!(
                    core = core.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request is unsatisfiable"
                );
                Err(UnsatisfiableError { core, explanation }.into())
            }
            Err(UnsolvableOrCancelled::Cancelled(_)) => {
                tracing::info!(budget = ?budget, "solve cancelled");
                Err(ConcretizeError::SolveTimeout {
                    budget: budget.unwrap_or_default(),
                })
            }
        }
    }

    /// One independent solve per root, run in parallel. Results keep the
    /// order of `roots`.
    pub fn concretize_separately(&self, roots: &[Spec]) -> Vec<Result<ConcreteDag>> {
        roots
            .par_iter()
            .map(|root| self.concretize(std::slice::from_ref(root)))
            .collect()
    }

    /// Together or separately, as `concretizer.unify` says. Fails on the
    /// first root that fails.
    pub fn concretize_all(&self, roots: &[Spec]) -> Result<Vec<ConcreteDag>> {
        if self.config.concretizer.unify {
            return Ok(vec![self.concretize(roots)?]);
        }
        self.concretize_separately(roots).into_iter().collect()
    }
}

/// Per-package values read off the chosen candidates.
#[derive(Default)]
struct Decoded {
    version: Option<Version>,
    variants: BTreeMap<String, BTreeSet<String>>,
    compiler: Option<CompilerId>,
    arch: Option<ArchSpec>,
}

fn decode(index: &dyn RecipeIndex, provider: &SpackleProvider, solution: &[SolvableId]) -> Result<Assignment> {
    let mut packages: BTreeMap<String, Decoded> = BTreeMap::new();
    let mut providers = BTreeMap::new();
    for &sid in solution {
        match provider.record(sid) {
            SolvableRecord::Package { name, version } => {
                packages.entry(name.clone()).or_default().version = Some(version.clone());
            }
            SolvableRecord::Variant { package, variant, value } => {
                packages
                    .entry(package.clone())
                    .or_default()
                    .variants
                    .entry(variant.clone())
                    .or_default()
                    .insert(value.clone());
            }
            SolvableRecord::Member {
                package,
                variant,
                value,
                present,
            } => {
                let tokens = packages
                    .entry(package.clone())
                    .or_default()
                    .variants
                    .entry(variant.clone())
                    .or_default();
                if *present {
                    tokens.insert(value.clone());
                }
            }
            SolvableRecord::Compiler {
                package,
                compiler,
                version,
            } => {
                packages.entry(package.clone()).or_default().compiler = Some(CompilerId {
                    name: compiler.clone(),
                    version: version.clone(),
                });
            }
            SolvableRecord::Target { package, arch } => {
                packages.entry(package.clone()).or_default().arch = Some(arch.clone());
            }
            SolvableRecord::Provider {
                virtual_name,
                provider,
                provided,
                ..
            } => {
                providers.insert(
                    virtual_name.clone(),
                    ProviderChoice {
                        provider: provider.clone(),
                        provided: provided.clone(),
                    },
                );
            }
            SolvableRecord::Guard { .. } => {}
        }
    }

    let mut nodes = BTreeMap::new();
    for (name, decoded) in packages {
        let incomplete = |what: &str| ConcretizeError::Inconsistent(format!("no {what} chosen for `{name}`"));
        let Some(version) = decoded.version else {
            // Variant or compiler choices of a package that is not in the
            // solution carry no meaning.
            continue;
        };
        let compiler = decoded.compiler.ok_or_else(|| incomplete("compiler"))?;
        let arch = decoded.arch.ok_or_else(|| incomplete("target"))?;
        let defs = index.variants_of(&name);
        let mut variants = BTreeMap::new();
        for (variant, tokens) in decoded.variants {
            let def = defs.get(&variant).ok_or_else(|| {
                ConcretizeError::Inconsistent(format!("solver chose undeclared variant `{variant}` of `{name}`"))
            })?;
            variants.insert(variant, def.value_from_tokens(&tokens));
        }
        nodes.insert(
            name,
            AssignedNode {
                version,
                variants,
                compiler,
                arch,
            },
        );
    }
    Ok(Assignment { nodes, providers })
}
