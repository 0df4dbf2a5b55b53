//! resolvo's [`DependencyProvider`](resolvo::DependencyProvider) over a
//! translated concretization problem.
//!
//! [`SpackleProvider`] is filled by the [`translate`](crate::translate)
//! module: every candidate, dependency list, exclusion and preference is
//! computed up front, so the provider itself is read-only during a solve.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use resolvo::{
    Candidates, Condition, Dependencies, HintDependenciesAvailable, KnownDependencies, NameId, SolvableId,
    SolverCache, StringId, VersionSetId, VersionSetUnionId,
};

use crate::pool::{NodeName, SolvableRecord, SolverPool};
use crate::version::Version;

/// Why a solve was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
}

/// Candidate ordering inputs, best first in every list.
#[derive(Debug, Default)]
pub(crate) struct Preferences {
    /// Versions preferred by configuration, per package.
    pub versions: HashMap<String, Vec<Version>>,
    /// Versions a recipe marks as preferred.
    pub recipe_preferred: HashMap<String, Vec<Version>>,
    pub deprecated: HashMap<String, Vec<Version>>,
    /// Preferred tokens per (package, variant).
    pub variants: HashMap<(String, String), Vec<String>>,
    /// Compiler `(name, version)` order per package.
    pub compilers: HashMap<String, Vec<(String, Version)>>,
    pub targets: HashMap<String, Vec<String>>,
    /// Provider order per virtual.
    pub providers: HashMap<String, Vec<String>>,
}

fn position<T>(list: Option<&Vec<T>>, pred: impl Fn(&T) -> bool) -> usize {
    list.and_then(|l| l.iter().position(pred)).unwrap_or(usize::MAX)
}

impl Preferences {
    fn version_key(&self, name: &str, version: &Version) -> (usize, bool, bool, bool, Reverse<Version>) {
        let configured = position(self.versions.get(name), |v| v == version || v.is_prefix_of(version));
        let preferred = self
            .recipe_preferred
            .get(name)
            .is_some_and(|vs| vs.contains(version));
        let deprecated = self.deprecated.get(name).is_some_and(|vs| vs.contains(version));
        (configured, !preferred, deprecated, version.is_develop(), Reverse(version.clone()))
    }

    /// Orders two candidates of the same name; `Less` is better.
    pub fn compare(&self, a: &SolvableRecord, b: &SolvableRecord) -> Ordering {
        use SolvableRecord as R;
        match (a, b) {
            (R::Package { name, version: va }, R::Package { version: vb, .. }) => {
                self.version_key(name, va).cmp(&self.version_key(name, vb))
            }
            (
                R::Variant { package, variant, value: va },
                R::Variant { value: vb, .. },
            ) => {
                let prefs = self.variants.get(&(package.clone(), variant.clone()));
                let key = |v: &String| (position(prefs, |p| p == v), v.clone());
                key(va).cmp(&key(vb))
            }
            (
                R::Member { package, variant, value, present: pa },
                R::Member { present: pb, .. },
            ) => {
                let wanted = self
                    .variants
                    .get(&(package.clone(), variant.clone()))
                    .is_some_and(|p| p.contains(value));
                (*pa != wanted).cmp(&(*pb != wanted))
            }
            (
                R::Compiler { package, compiler: ca, version: va },
                R::Compiler { compiler: cb, version: vb, .. },
            ) => {
                let prefs = self.compilers.get(package);
                let key = |c: &String, v: &Version| {
                    (position(prefs, |(n, pv)| n == c && pv == v), c.clone(), Reverse(v.clone()))
                };
                key(ca, va).cmp(&key(cb, vb))
            }
            (R::Target { package, arch: aa }, R::Target { arch: ab, .. }) => {
                let prefs = self.targets.get(package);
                let key = |t: &Option<String>| (position(prefs, |p| Some(p) == t.as_ref()), t.clone());
                key(&aa.target).cmp(&key(&ab.target))
            }
            (
                R::Provider { virtual_name, provider: pa, version: va, .. },
                R::Provider { provider: pb, version: vb, .. },
            ) => {
                let prefs = self.providers.get(virtual_name);
                let key = |p: &String, v: &Version| (position(prefs, |n| n == p), p.clone(), Reverse(v.clone()));
                key(pa, va).cmp(&key(pb, vb))
            }
            _ => Ordering::Equal,
        }
    }
}

/// Dependency provider for one concretization problem.
pub struct SpackleProvider {
    pub(crate) pool: SolverPool,
    candidates: HashMap<NameId, Vec<SolvableId>>,
    dependencies: HashMap<SolvableId, KnownDependencies>,
    /// Installed candidates, soft preference.
    favored: HashMap<NameId, SolvableId>,
    /// Installed candidates, hard constraint.
    locked: HashMap<NameId, SolvableId>,
    excluded: HashMap<NameId, Vec<(SolvableId, StringId)>>,
    pub(crate) preferences: Preferences,
    deadline: Option<Instant>,
}

impl SpackleProvider {
    pub(crate) fn new(deadline: Option<Instant>) -> Self {
        Self {
            pool: SolverPool::new(),
            candidates: HashMap::new(),
            dependencies: HashMap::new(),
            favored: HashMap::new(),
            locked: HashMap::new(),
            excluded: HashMap::new(),
            preferences: Preferences::default(),
            deadline,
        }
    }

    /// Add a candidate for `name`.
    pub(crate) fn add_candidate(&mut self, name: NodeName, record: SolvableRecord) -> SolvableId {
        let name_id = self.pool.intern_name(name);
        let sid = self.pool.intern_solvable(name_id, record);
        self.candidates.entry(name_id).or_default().push(sid);
        sid
    }

    pub(crate) fn candidates_of(&self, name: &NodeName) -> &[SolvableId] {
        self.pool
            .lookup_name(name)
            .and_then(|id| self.candidates.get(&id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn dependencies_mut(&mut self, solvable: SolvableId) -> &mut KnownDependencies {
        self.dependencies
            .entry(solvable)
            .or_insert_with(|| KnownDependencies {
                requirements: Vec::new(),
                constrains: Vec::new(),
            })
    }

    pub(crate) fn favor(&mut self, solvable: SolvableId) {
        let name = self.pool.solvable_name(solvable);
        self.favored.entry(name).or_insert(solvable);
    }

    pub(crate) fn lock(&mut self, solvable: SolvableId) {
        let name = self.pool.solvable_name(solvable);
        self.locked.entry(name).or_insert(solvable);
    }

    pub(crate) fn exclude(&mut self, solvable: SolvableId, reason: String) {
        let name = self.pool.solvable_name(solvable);
        let reason = self.pool.intern_string(reason);
        self.excluded.entry(name).or_default().push((solvable, reason));
    }

    pub fn pool(&self) -> &SolverPool {
        &self.pool
    }

    pub fn record(&self, solvable: SolvableId) -> &SolvableRecord {
        self.pool.resolve_solvable(solvable)
    }

    pub(crate) fn dependency_count(&self) -> usize {
        self.dependencies
            .values()
            .map(|d| d.requirements.len() + d.constrains.len())
            .sum()
    }
}

// --- Display wrappers ---

struct DisplaySolvable<'a>(&'a SolverPool, SolvableId);

impl fmt::Display for DisplaySolvable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_solvable(self.1))
    }
}

struct DisplayName<'a>(&'a SolverPool, NameId);

impl fmt::Display for DisplayName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_name(self.1))
    }
}

struct DisplayVersionSet<'a>(&'a SolverPool, VersionSetId);

impl fmt::Display for DisplayVersionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_version_set(self.1))
    }
}

struct DisplayString<'a>(&'a SolverPool, StringId);

impl fmt::Display for DisplayString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_string(self.1))
    }
}

// --- Interner ---

impl resolvo::Interner for SpackleProvider {
    fn display_solvable(&self, solvable: SolvableId) -> impl fmt::Display + '_ {
        DisplaySolvable(&self.pool, solvable)
    }

    fn display_name(&self, name: NameId) -> impl fmt::Display + '_ {
        DisplayName(&self.pool, name)
    }

    fn display_version_set(&self, version_set: VersionSetId) -> impl fmt::Display + '_ {
        DisplayVersionSet(&self.pool, version_set)
    }

    fn display_string(&self, string_id: StringId) -> impl fmt::Display + '_ {
        DisplayString(&self.pool, string_id)
    }

    fn version_set_name(&self, version_set: VersionSetId) -> NameId {
        self.pool.version_set_name(version_set)
    }

    fn solvable_name(&self, solvable: SolvableId) -> NameId {
        self.pool.solvable_name(solvable)
    }

    fn version_sets_in_union(&self, version_set_union: VersionSetUnionId) -> impl Iterator<Item = VersionSetId> {
        self.pool
            .resolve_version_set_union(version_set_union)
            .iter()
            .copied()
    }

    fn resolve_condition(&self, condition: resolvo::ConditionId) -> Condition {
        self.pool.resolve_condition(condition).clone()
    }
}

// --- DependencyProvider ---

impl resolvo::DependencyProvider for SpackleProvider {
    async fn get_candidates(&self, name: NameId) -> Option<Candidates> {
        let solvables = self.candidates.get(&name)?;
        Some(Candidates {
            candidates: solvables.clone(),
            favored: self.favored.get(&name).copied(),
            locked: self.locked.get(&name).copied(),
            hint_dependencies_available: HintDependenciesAvailable::All,
            excluded: self.excluded.get(&name).cloned().unwrap_or_default(),
        })
    }

    async fn sort_candidates(&self, _solver: &SolverCache<Self>, solvables: &mut [SolvableId]) {
        solvables.sort_by(|a, b| {
            self.preferences
                .compare(self.pool.resolve_solvable(*a), self.pool.resolve_solvable(*b))
        });
    }

    async fn filter_candidates(
        &self,
        candidates: &[SolvableId],
        version_set: VersionSetId,
        inverse: bool,
    ) -> Vec<SolvableId> {
        let set = self.pool.resolve_version_set(version_set);
        candidates
            .iter()
            .copied()
            .filter(|&sid| set.matches(self.pool.resolve_solvable(sid)) != inverse)
            .collect()
    }

    async fn get_dependencies(&self, solvable: SolvableId) -> Dependencies {
        match self.dependencies.get(&solvable) {
            Some(deps) => Dependencies::Known(deps.clone()),
            None => Dependencies::Known(KnownDependencies {
                requirements: Vec::new(),
                constrains: Vec::new(),
            }),
        }
    }

    fn should_cancel_with_value(&self) -> Option<Box<dyn std::any::Any>> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Some(Box::new(CancelReason::Timeout)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use resolvo::{ConditionalRequirement, DependencyProvider, Problem, Requirement, Solver};

    use super::*;
    use crate::pool::{Constraint, VersionSet};
    use crate::version::VersionList;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn package(provider: &mut SpackleProvider, name: &str, versions: &[&str]) -> Vec<SolvableId> {
        versions
            .iter()
            .map(|v| {
                provider.add_candidate(
                    NodeName::Package(name.into()),
                    SolvableRecord::Package {
                        name: name.into(),
                        version: version(v),
                    },
                )
            })
            .collect()
    }

    fn require(provider: &mut SpackleProvider, name: &str, range: &str) -> ConditionalRequirement {
        let name_id = provider.pool.intern_name(NodeName::Package(name.into()));
        let vs = provider.pool.intern_version_set(
            name_id,
            VersionSet::new(Constraint::Versions(VersionList::parse(range).unwrap())),
        );
        ConditionalRequirement {
            condition: None,
            requirement: Requirement::Single(vs),
        }
    }

    fn chosen(solver: &Solver<SpackleProvider>, solution: &[SolvableId]) -> Vec<String> {
        let mut out: Vec<String> = solution
            .iter()
            .map(|s| solver.provider().record(*s).to_string())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn newest_version_preferred() {
        let mut provider = SpackleProvider::new(None);
        package(&mut provider, "b", &["1.0", "1.5", "2.0", "2.1"]);
        let req = require(&mut provider, "b", "1.0:2.0");
        let mut solver = Solver::new(provider);
        let solution = solver.solve(Problem::new().requirements(vec![req])).unwrap();
        assert_eq!(chosen(&solver, &solution), ["b@2.0"]);
    }

    #[test]
    fn configured_and_develop_versions_ordered() {
        let mut provider = SpackleProvider::new(None);
        package(&mut provider, "b", &["1.0", "2.0", "develop"]);
        let req = require(&mut provider, "b", ":");
        let mut solver = Solver::new(provider);
        let solution = solver.solve(Problem::new().requirements(vec![req])).unwrap();
        assert_eq!(chosen(&solver, &solution), ["b@2.0"]);

        let mut provider = SpackleProvider::new(None);
        package(&mut provider, "b", &["1.0", "2.0", "develop"]);
        provider
            .preferences
            .versions
            .insert("b".into(), vec![version("1.0")]);
        let req = require(&mut provider, "b", ":");
        let mut solver = Solver::new(provider);
        let solution = solver.solve(Problem::new().requirements(vec![req])).unwrap();
        assert_eq!(chosen(&solver, &solution), ["b@1.0"]);
    }

    #[test]
    fn favored_beats_newer() {
        let mut provider = SpackleProvider::new(None);
        let ids = package(&mut provider, "b", &["1.0", "2.0"]);
        provider.favor(ids[0]);
        let req = require(&mut provider, "b", ":");
        let mut solver = Solver::new(provider);
        let solution = solver.solve(Problem::new().requirements(vec![req])).unwrap();
        assert_eq!(chosen(&solver, &solution), ["b@1.0"]);
    }

    #[test]
    fn excluded_candidates_skipped() {
        let mut provider = SpackleProvider::new(None);
        let ids = package(&mut provider, "b", &["1.0", "2.0"]);
        provider.exclude(ids[1], "broken release".into());
        let req = require(&mut provider, "b", ":");
        let mut solver = Solver::new(provider);
        let solution = solver.solve(Problem::new().requirements(vec![req])).unwrap();
        assert_eq!(chosen(&solver, &solution), ["b@1.0"]);
    }

    #[test]
    fn inverted_constrains_forbid_matches() {
        let mut provider = SpackleProvider::new(None);
        let a = package(&mut provider, "a", &["1.0"]);
        package(&mut provider, "b", &["1.0", "2.0"]);
        let b_name = provider.pool.intern_name(NodeName::Package("b".into()));
        let not_b2 = provider.pool.intern_version_set(
            b_name,
            VersionSet::inverted(Constraint::Versions(VersionList::parse("2.0").unwrap())),
        );
        let req_b = require(&mut provider, "b", ":");
        let deps = provider.dependencies_mut(a[0]);
        deps.requirements.push(req_b);
        deps.constrains.push(not_b2);
        let req = require(&mut provider, "a", ":");
        let mut solver = Solver::new(provider);
        let solution = solver.solve(Problem::new().requirements(vec![req])).unwrap();
        assert_eq!(chosen(&solver, &solution), ["a@1.0", "b@1.0"]);
    }

    #[test]
    fn expired_deadline_cancels() {
        let provider = SpackleProvider::new(Some(Instant::now()));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let reason = provider.should_cancel_with_value().unwrap();
        assert_eq!(reason.downcast_ref::<CancelReason>(), Some(&CancelReason::Timeout));
        assert!(SpackleProvider::new(None).should_cancel_with_value().is_none());
    }

    #[test]
    fn provider_order_follows_preferences() {
        let prefs = Preferences {
            providers: HashMap::from([("mpi".to_string(), vec!["mpich".to_string()])]),
            ..Preferences::default()
        };
        let choice = |provider: &str, v: &str| SolvableRecord::Provider {
            virtual_name: "mpi".into(),
            provider: provider.into(),
            version: version(v),
            provided: VersionList::any(),
        };
        assert_eq!(
            prefs.compare(&choice("mpich", "3.4"), &choice("openmpi", "5.0")),
            Ordering::Less
        );
        assert_eq!(
            prefs.compare(&choice("openmpi", "5.0"), &choice("openmpi", "4.1")),
            Ordering::Less
        );
    }
}
