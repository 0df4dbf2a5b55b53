//! Minimal conflicting cores for unsatisfiable requests.
//!
//! When a solve fails, the concretizer searches for a smallest set of
//! origin-tagged constraints (see [`Origin`]) that cannot hold together.
//! The search is QuickXplain: split the candidate constraints in halves and
//! re-solve problems translated with only a subset enabled, so the result is
//! minimal (dropping any member makes the rest satisfiable) after
//! `O(k log n)` probes for a core of size `k` out of `n` constraints.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use resolvo::{Solver, UnsolvableOrCancelled};

use crate::error::{ConcretizeError, Result};
use crate::spec::Spec;
use crate::translate::{Origin, Translator};

/// One member of a conflicting core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConstraint {
    pub origin: Origin,
    /// Human-readable account of the constraint.
    pub description: String,
}

struct Probe<'a, 't> {
    translator: &'a Translator<'t>,
    roots: &'a [Spec],
    deadline: Option<Instant>,
    budget: Duration,
    solves: usize,
}

impl Probe<'_, '_> {
    /// Whether the problem with only `enabled` constraints has a solution.
    fn consistent(&mut self, enabled: &BTreeSet<Origin>) -> Result<bool> {
        self.solves += 1;
        let translation = self.translator.translate(self.roots, Some(enabled), self.deadline)?;
        let (provider, problem) = translation.into_parts();
        let mut solver = Solver::new(provider);
        match solver.solve(problem) {
            Ok(_) => Ok(true),
            Err(UnsolvableOrCancelled::Unsolvable(_)) => Ok(false),
            Err(UnsolvableOrCancelled::Cancelled(_)) => Err(ConcretizeError::SolveTimeout { budget: self.budget }),
        }
    }

    fn quick_xplain(
        &mut self,
        background: &BTreeSet<Origin>,
        has_delta: bool,
        candidates: &[Origin],
    ) -> Result<BTreeSet<Origin>> {
        if has_delta && !self.consistent(background)? {
            return Ok(BTreeSet::new());
        }
        if candidates.len() == 1 {
            return Ok(candidates.iter().cloned().collect());
        }
        let (first, second) = candidates.split_at(candidates.len() / 2);

        let mut with_first = background.clone();
        with_first.extend(first.iter().cloned());
        let delta_second = self.quick_xplain(&with_first, !first.is_empty(), second)?;

        let mut with_second = background.clone();
        with_second.extend(delta_second.iter().cloned());
        let delta_first = self.quick_xplain(&with_second, !delta_second.is_empty(), first)?;

        let mut core = delta_first;
        core.extend(delta_second);
        Ok(core)
    }
}

/// A minimal subset of `origins` whose constraints cannot be satisfied
/// together. Empty when the problem is satisfiable with all of them, or when
/// the recipes conflict without any tagged constraint.
pub(crate) fn minimal_core(
    translator: &Translator<'_>,
    roots: &[Spec],
    origins: &BTreeSet<Origin>,
    deadline: Option<Instant>,
    budget: Duration,
) -> Result<Vec<Origin>> {
    let mut probe = Probe {
        translator,
        roots,
        deadline,
        budget,
        solves: 0,
    };
    let candidates: Vec<Origin> = origins.iter().cloned().collect();
    if candidates.is_empty() || probe.consistent(origins)? {
        return Ok(Vec::new());
    }
    let core = probe.quick_xplain(&BTreeSet::new(), false, &candidates)?;
    tracing::debug!(
        candidates = candidates.len(),
        core = core.len(),
        solves = probe.solves,
        "extracted conflicting core"
    );
    Ok(core.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompilerEntry, Config};
    use crate::pool::InstalledSet;
    use crate::recipe::{InMemoryRecipeIndex, Recipe};
    use crate::spec::DepTypes;
    use crate::version::Version;

    fn s(text: &str) -> Spec {
        Spec::parse(text).unwrap()
    }

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.compilers.push(CompilerEntry {
            name: "gcc".into(),
            version: v("12.2.0"),
        });
        config
    }

    fn core_of(index: &InMemoryRecipeIndex, config: &Config, roots: &[Spec]) -> Vec<Origin> {
        let installed = InstalledSet::default();
        let translator = Translator::new(index, config, &installed, false);
        let origins = translator.translate(roots, None, None).unwrap().origins;
        minimal_core(&translator, roots, &origins, None, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn satisfiable_problem_has_empty_core() {
        let index: InMemoryRecipeIndex = [
            Recipe::new("a")
                .with_version(v("1.0"))
                .with_dependency(s("d@1:"), DepTypes::default(), None),
            Recipe::new("d").with_version(v("1.0")),
        ]
        .into_iter()
        .collect();
        assert!(core_of(&index, &config(), &[s("a")]).is_empty());
    }

    #[test]
    fn core_drops_unrelated_constraints() {
        let index: InMemoryRecipeIndex = [
            Recipe::new("a")
                .with_version(v("1.0"))
                .with_dependency(s("d@2.0:"), DepTypes::default(), None)
                .with_dependency(s("e"), DepTypes::default(), None),
            Recipe::new("d").with_version(v("1.0")).with_version(v("2.0")),
            Recipe::new("e").with_version(v("1.0")),
        ]
        .into_iter()
        .collect();
        let core = core_of(&index, &config(), &[s("a ^d@1.0")]);
        assert_eq!(
            core,
            vec![
                Origin::Root { index: 0 },
                Origin::RootDependency {
                    index: 0,
                    package: "d".into()
                },
                Origin::Dependency {
                    package: "a".into(),
                    index: 0
                },
            ]
        );
    }

    #[test]
    fn conflict_declaration_in_core() {
        let index: InMemoryRecipeIndex = [Recipe::new("a")
            .with_version(v("1.0"))
            .with_variant(crate::variant::VariantDef::boolean("x", false))
            .with_conflict(s("+x"), None, Some("x is broken".into()))]
        .into_iter()
        .collect();
        let core = core_of(&index, &config(), &[s("a+x")]);
        assert_eq!(
            core,
            vec![
                Origin::Root { index: 0 },
                Origin::Conflict {
                    package: "a".into(),
                    index: 0
                },
            ]
        );
    }

    #[test]
    fn core_search_honors_the_deadline() {
        let index: InMemoryRecipeIndex = [
            Recipe::new("a")
                .with_version(v("1.0"))
                .with_dependency(s("d@2.0:"), DepTypes::default(), None),
            Recipe::new("d").with_version(v("1.0")).with_version(v("2.0")),
        ]
        .into_iter()
        .collect();
        let config = config();
        let installed = InstalledSet::default();
        let translator = Translator::new(&index, &config, &installed, false);
        let roots = [s("a ^d@1.0")];
        let origins = translator.translate(&roots, None, None).unwrap().origins;

        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let budget = Duration::from_millis(1);
        let err = minimal_core(&translator, &roots, &origins, Some(deadline), budget).unwrap_err();
        assert!(matches!(err, ConcretizeError::SolveTimeout { budget: b } if b == budget), "{err}");
    }
}
