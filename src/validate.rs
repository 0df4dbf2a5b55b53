//! Independent soundness check of a concretized graph.
//!
//! The checker re-reads the recipes and verifies the graph directly, without
//! going through the solver encoding. The concretizer runs it on every
//! result and turns a violation into [`ConcretizeError::Inconsistent`].
//!
//! [`ConcretizeError::Inconsistent`]: crate::ConcretizeError::Inconsistent

use std::collections::BTreeSet;
use std::fmt;

use crate::dag::{ConcreteDag, ConcreteNode};
use crate::pool::InstalledSet;
use crate::recipe::{RecipeIndex, RequirePolicy};
use crate::spec::Spec;
use crate::translate::follows;
use crate::variant::VariantValue;

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub package: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.package, self.message)
    }
}

fn anonymous(spec: &Spec) -> Spec {
    let mut spec = spec.clone();
    spec.name = None;
    spec
}

struct Checker<'a> {
    dag: &'a ConcreteDag,
    index: &'a dyn RecipeIndex,
    installed: &'a InstalledSet,
    root_names: BTreeSet<String>,
    tests: bool,
    violations: Vec<Violation>,
}

impl Checker<'_> {
    fn violation(&mut self, package: &str, message: String) {
        self.violations.push(Violation {
            package: package.to_string(),
            message,
        });
    }

    fn check_roots(&mut self, roots: &[Spec]) {
        for root in roots {
            let name = root.name_str();
            let Some(node) = self.dag.root(name) else {
                self.violation(name, "requested root missing from the graph".into());
                continue;
            };
            if self.index.is_virtual(name) {
                self.check_virtual(name, &root.versions, &node.name);
            } else if !node.to_spec().satisfies(&root.own()) {
                self.violation(name, format!("does not satisfy the request `{}`", root.own()));
            }
            for dep in &root.dependencies {
                self.check_constraint(name, dep);
            }
        }
    }

    /// A `^dep` constraint holds wherever `dep` is in the graph.
    fn check_constraint(&mut self, parent: &str, dep: &Spec) {
        let name = dep.name_str();
        if self.index.is_virtual(name) {
            if let Some(choice) = self.dag.providers().get(name) {
                let provider = choice.provider.clone();
                self.check_virtual(name, &dep.versions, &provider);
            }
            return;
        }
        if let Some(node) = self.dag.node(name) {
            if !node.to_spec().satisfies(&dep.own()) {
                self.violation(parent, format!("`{}` does not satisfy `^{}`", node.name, dep.own()));
            }
        }
    }

    fn check_virtual(&mut self, virtual_name: &str, wanted: &crate::version::VersionList, provider: &str) {
        match self.dag.providers().get(virtual_name) {
            Some(choice) if choice.provider == provider => {
                if !choice.provided.intersects(wanted) {
                    self.violation(
                        provider,
                        format!("provides {virtual_name}@{} but {virtual_name}@{wanted} is needed", choice.provided),
                    );
                }
            }
            _ => self.violation(provider, format!("not recorded as the provider of `{virtual_name}`")),
        }
    }

    fn check_node(&mut self, node: &ConcreteNode) {
        let name = node.name.as_str();
        let Some(recipe) = self.index.recipe(name) else {
            self.violation(name, "no recipe".into());
            return;
        };
        let reused = self
            .installed
            .get(name)
            .is_some_and(|(installed, _)| installed.version == node.version);
        if recipe.version_decl(&node.version).is_none() && !reused {
            self.violation(name, format!("version {} is not declared", node.version));
        }
        let Some(snapshot) = self.dag.snapshot(name) else {
            return;
        };
        let view = anonymous(&snapshot);

        for (variant, value) in &node.variants {
            let Some(def) = recipe.variants.get(variant) else {
                self.violation(name, format!("undeclared variant `{variant}`"));
                continue;
            };
            if let Err(err) = def.check(name, value) {
                self.violation(name, err.to_string());
            }
            if let Some(when) = &def.when {
                if !view.satisfies(&anonymous(when)) {
                    self.violation(name, format!("variant `{variant}` set although `{when}` does not hold"));
                }
            }
            if def.multi && matches!(value, VariantValue::Multi(v) if v.is_empty()) && !def.default.tokens().is_empty() {
                self.violation(name, format!("variant `{variant}` has no value"));
            }
        }
        for (variant, def) in &recipe.variants {
            let active = def.when.as_ref().is_none_or(|w| view.satisfies(&anonymous(w)));
            if active && !node.variants.contains_key(variant) {
                self.violation(name, format!("variant `{variant}` has no value"));
            }
        }

        for dep in self.index.dependencies_of(name, &snapshot) {
            if !follows(self.tests, &self.root_names, name, &dep) {
                continue;
            }
            let dep_name = dep.name();
            if self.index.is_virtual(dep_name) {
                match self.dag.providers().get(dep_name) {
                    Some(choice) => {
                        let provider = choice.provider.clone();
                        self.check_virtual(dep_name, &dep.spec.versions, &provider);
                        self.check_edge(name, &provider);
                    }
                    None => self.violation(name, format!("no provider for `{dep_name}`")),
                }
            } else {
                match self.dag.node(dep_name) {
                    Some(child) if child.to_spec().satisfies(&dep.spec.own()) => self.check_edge(name, dep_name),
                    Some(child) => self.violation(
                        name,
                        format!("dependency `{child}` does not satisfy `{}`", dep.spec.own()),
                    ),
                    None => self.violation(name, format!("missing dependency `{dep_name}`")),
                }
            }
            for nested in &dep.spec.dependencies {
                self.check_constraint(name, nested);
            }
        }

        for conflict in &recipe.conflicts {
            let Some(trigger) = conflict.trigger() else {
                continue;
            };
            if view.satisfies(&trigger) {
                let reason = conflict.msg.as_deref().unwrap_or("declared conflict");
                self.violation(name, format!("conflicts with `{trigger}`: {reason}"));
            }
        }

        for requires in &recipe.requires {
            if requires
                .when
                .as_ref()
                .is_some_and(|w| !view.satisfies(&anonymous(w)))
            {
                continue;
            }
            let held = requires
                .alternatives
                .iter()
                .filter(|alt| view.satisfies(&anonymous(alt)))
                .count();
            let ok = match requires.policy {
                RequirePolicy::OneOf => held == 1,
                RequirePolicy::AnyOf => held >= 1,
            };
            if !ok {
                let alternatives: Vec<String> = requires.alternatives.iter().map(ToString::to_string).collect();
                self.violation(
                    name,
                    format!("{held} of the required alternatives [{}] hold", alternatives.join(", ")),
                );
            }
        }
    }

    fn check_edge(&mut self, parent: &str, child: &str) {
        if !self.dag.dependencies(parent).iter().any(|(n, _)| n.name == child) {
            self.violation(parent, format!("edge to `{child}` missing"));
        }
    }
}

/// Every rule of the recipes, the request and the virtual bindings that
/// `dag` breaks. Empty for a sound graph.
pub fn check(
    dag: &ConcreteDag,
    index: &dyn RecipeIndex,
    roots: &[Spec],
    tests: bool,
    installed: &InstalledSet,
) -> Vec<Violation> {
    let mut checker = Checker {
        dag,
        index,
        installed,
        root_names: roots.iter().map(|r| r.name_str().to_string()).collect(),
        tests,
        violations: Vec::new(),
    };
    checker.check_roots(roots);
    for node in dag.nodes() {
        checker.check_node(node);
    }
    for (virtual_name, choice) in dag.providers() {
        let provides = index.recipe(&choice.provider).is_some_and(|recipe| {
            let view = dag.snapshot(&choice.provider).map(|s| anonymous(&s));
            recipe.provides.iter().any(|p| {
                p.virtual_name() == virtual_name
                    && p.when
                        .as_ref()
                        .is_none_or(|w| view.as_ref().is_some_and(|v| v.satisfies(&anonymous(w))))
            })
        });
        if !provides {
            checker.violation(&choice.provider, format!("does not provide `{virtual_name}`"));
        }
    }
    checker.violations
}
