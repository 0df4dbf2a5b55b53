//! Arena-based pool mapping resolvo IDs to concretizer values.
//!
//! [`SolverPool`] backs every resolvo identifier ([`NameId`], [`SolvableId`],
//! [`VersionSetId`], etc.) with a concrete value. The translator fills it and
//! the provider and interner implementations index into it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use resolvo::{ArenaId, Condition, ConditionId, NameId, SolvableId, StringId, VersionSetId, VersionSetUnionId};

use crate::dag::ConcreteNode;
use crate::spec::{ArchSpec, CompilerSpec};
use crate::version::{Version, VersionList};

/// What a solver name stands for.
///
/// Every package contributes several names: its version, one per variant
/// (one per value for multi-valued variants), its compiler and its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeName {
    Package(String),
    Variant { package: String, variant: String },
    /// Membership of `value` in a multi-valued variant.
    Member { package: String, variant: String, value: String },
    Compiler(String),
    Target(String),
    /// The provider choice of a virtual package.
    Virtual(String),
    /// Helper used to encode conflicts and `requires` groups.
    Guard(String),
}

impl NodeName {
    /// The package this name belongs to, if any.
    pub fn package(&self) -> Option<&str> {
        match self {
            NodeName::Package(p)
            | NodeName::Variant { package: p, .. }
            | NodeName::Member { package: p, .. }
            | NodeName::Compiler(p)
            | NodeName::Target(p) => Some(p),
            NodeName::Virtual(_) | NodeName::Guard(_) => None,
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeName::Package(p) => write!(f, "{p}"),
            NodeName::Variant { package, variant } => write!(f, "{package} variant {variant}"),
            NodeName::Member { package, variant, value } => write!(f, "{package} {variant}={value}"),
            NodeName::Compiler(p) => write!(f, "{p} compiler"),
            NodeName::Target(p) => write!(f, "{p} target"),
            NodeName::Virtual(v) => write!(f, "{v} provider"),
            NodeName::Guard(label) => write!(f, "{label}"),
        }
    }
}

/// One candidate value of a [`NodeName`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolvableRecord {
    Package { name: String, version: Version },
    Variant { package: String, variant: String, value: String },
    Member { package: String, variant: String, value: String, present: bool },
    Compiler { package: String, compiler: String, version: Version },
    Target { package: String, arch: ArchSpec },
    /// `provider@version` serving `virtual_name` at the `provided` versions.
    Provider {
        virtual_name: String,
        provider: String,
        version: Version,
        provided: VersionList,
    },
    Guard { label: String },
}

impl fmt::Display for SolvableRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolvableRecord::Package { name, version } => write!(f, "{name}@{version}"),
            SolvableRecord::Variant { package, variant, value } => {
                write!(f, "{package} {variant}={value}")
            }
            SolvableRecord::Member { package, variant, value, present } => {
                let verb = if *present { "with" } else { "without" };
                write!(f, "{package} {verb} {variant}={value}")
            }
            SolvableRecord::Compiler { package, compiler, version } => {
                write!(f, "{package}%{compiler}@{version}")
            }
            SolvableRecord::Target { package, arch } => write!(f, "{package} {arch}"),
            SolvableRecord::Provider { virtual_name, provider, version, provided } => {
                write!(f, "{provider}@{version} as {virtual_name}")?;
                if !provided.is_any() {
                    write!(f, "@{provided}")?;
                }
                Ok(())
            }
            SolvableRecord::Guard { label } => write!(f, "{label}"),
        }
    }
}

/// The candidate filter behind a [`VersionSetId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constraint {
    Versions(VersionList),
    Values(BTreeSet<String>),
    Present(bool),
    Compiler(CompilerSpec),
    Arch(ArchSpec),
    /// Provider choices by provider name and provided virtual version.
    Providers {
        providers: Option<BTreeSet<String>>,
        versions: VersionList,
    },
    Any,
}

impl Constraint {
    pub fn matches(&self, record: &SolvableRecord) -> bool {
        match (self, record) {
            (Constraint::Any, _) => true,
            (Constraint::Versions(vs), SolvableRecord::Package { version, .. }) => vs.contains(version),
            (Constraint::Values(values), SolvableRecord::Variant { value, .. }) => values.contains(value),
            (Constraint::Present(want), SolvableRecord::Member { present, .. }) => want == present,
            (Constraint::Compiler(spec), SolvableRecord::Compiler { compiler, version, .. }) => {
                spec.name == *compiler && spec.versions.contains(version)
            }
            (Constraint::Arch(spec), SolvableRecord::Target { arch, .. }) => arch.satisfies(spec),
            (
                Constraint::Providers { providers, versions },
                SolvableRecord::Provider { provider, provided, .. },
            ) => {
                providers.as_ref().is_none_or(|set| set.contains(provider))
                    && provided.intersects(versions)
            }
            _ => false,
        }
    }
}

/// A [`Constraint`] plus the negation flag used for `constrains` entries.
///
/// resolvo forbids the candidates a `constrains` version set does *not*
/// match. Conflicts need the opposite, so their version sets carry
/// `inverted = true` and the match result is flipped before resolvo's own
/// `inverse` flag is applied: a candidate is forbidden when it matches the
/// original constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionSet {
    pub constraint: Constraint,
    pub inverted: bool,
}

impl VersionSet {
    pub fn new(constraint: Constraint) -> Self {
        Self {
            constraint,
            inverted: false,
        }
    }

    pub fn inverted(constraint: Constraint) -> Self {
        Self {
            constraint,
            inverted: true,
        }
    }

    pub fn matches(&self, record: &SolvableRecord) -> bool {
        self.constraint.matches(record) != self.inverted
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "not ")?;
        }
        match &self.constraint {
            Constraint::Versions(vs) if vs.is_any() => write!(f, "*"),
            Constraint::Versions(vs) => write!(f, "@{vs}"),
            Constraint::Values(values) => {
                write!(f, "{}", values.iter().cloned().collect::<Vec<_>>().join("|"))
            }
            Constraint::Present(true) => write!(f, "set"),
            Constraint::Present(false) => write!(f, "unset"),
            Constraint::Compiler(c) => write!(f, "%{c}"),
            Constraint::Arch(a) => write!(f, "{a}"),
            Constraint::Providers { providers, versions } => {
                match providers {
                    Some(set) => write!(f, "{}", set.iter().cloned().collect::<Vec<_>>().join("|"))?,
                    None => write!(f, "any provider")?,
                }
                if !versions.is_any() {
                    write!(f, " @{versions}")?;
                }
                Ok(())
            }
            Constraint::Any => write!(f, "*"),
        }
    }
}

/// Arena-based storage for all resolvo-interned objects.
///
/// Every resolvo ID type is backed by a `Vec` here, indexed by the ID's
/// inner `usize`. Reverse-lookup `HashMap`s prevent duplicate interning.
#[derive(Default)]
pub struct SolverPool {
    pub(crate) names: Vec<NodeName>,
    pub(crate) names_rev: HashMap<NodeName, NameId>,

    pub(crate) solvables: Vec<SolvableRecord>,
    pub(crate) solvable_names: Vec<NameId>,

    pub(crate) version_sets: Vec<VersionSet>,
    pub(crate) version_set_names: Vec<NameId>,
    pub(crate) version_sets_rev: HashMap<(NameId, VersionSet), VersionSetId>,

    pub(crate) version_set_unions: Vec<Vec<VersionSetId>>,

    pub(crate) conditions: Vec<Condition>,

    pub(crate) strings: Vec<String>,
}

impl SolverPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning the existing ID if already interned.
    pub fn intern_name(&mut self, name: NodeName) -> NameId {
        if let Some(&id) = self.names_rev.get(&name) {
            return id;
        }
        let id = NameId::from_usize(self.names.len());
        self.names_rev.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn lookup_name(&self, name: &NodeName) -> Option<NameId> {
        self.names_rev.get(name).copied()
    }

    pub fn resolve_name(&self, id: NameId) -> &NodeName {
        &self.names[id.to_usize()]
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn intern_solvable(&mut self, name_id: NameId, record: SolvableRecord) -> SolvableId {
        let id = SolvableId::from_usize(self.solvables.len());
        self.solvables.push(record);
        self.solvable_names.push(name_id);
        id
    }

    pub fn resolve_solvable(&self, id: SolvableId) -> &SolvableRecord {
        &self.solvables[id.to_usize()]
    }

    pub fn solvable_name(&self, id: SolvableId) -> NameId {
        self.solvable_names[id.to_usize()]
    }

    pub fn solvable_count(&self) -> usize {
        self.solvables.len()
    }

    /// Intern a version set on `name_id`, deduplicating by value.
    pub fn intern_version_set(&mut self, name_id: NameId, set: VersionSet) -> VersionSetId {
        let key = (name_id, set);
        if let Some(&id) = self.version_sets_rev.get(&key) {
            return id;
        }
        let id = VersionSetId::from_usize(self.version_sets.len());
        self.version_sets.push(key.1.clone());
        self.version_set_names.push(name_id);
        self.version_sets_rev.insert(key, id);
        id
    }

    pub fn resolve_version_set(&self, id: VersionSetId) -> &VersionSet {
        &self.version_sets[id.to_usize()]
    }

    pub fn version_set_name(&self, id: VersionSetId) -> NameId {
        self.version_set_names[id.to_usize()]
    }

    /// Intern a union (OR) of version sets.
    pub fn intern_version_set_union(&mut self, sets: Vec<VersionSetId>) -> VersionSetUnionId {
        let id = VersionSetUnionId::from_usize(self.version_set_unions.len());
        self.version_set_unions.push(sets);
        id
    }

    pub fn resolve_version_set_union(&self, id: VersionSetUnionId) -> &[VersionSetId] {
        &self.version_set_unions[id.to_usize()]
    }

    pub fn intern_condition(&mut self, condition: Condition) -> ConditionId {
        let id = ConditionId::from_usize(self.conditions.len());
        self.conditions.push(condition);
        id
    }

    pub fn resolve_condition(&self, id: ConditionId) -> &Condition {
        &self.conditions[id.to_usize()]
    }

    /// Intern a string (used for exclusion reasons).
    pub fn intern_string(&mut self, s: String) -> StringId {
        let id = StringId::from_usize(self.strings.len());
        self.strings.push(s);
        id
    }

    pub fn resolve_string(&self, id: StringId) -> &str {
        &self.strings[id.to_usize()]
    }
}

/// Policy for how the solver treats an installed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstalledPolicy {
    /// Preferred, but the solver may choose something else.
    Favored,
    /// Must be kept exactly; the solve fails if impossible.
    Locked,
}

/// Concrete nodes already installed.
///
/// Versions, compilers and targets missing from the recipes or the
/// configuration are injected as extra candidates so the solver can still
/// pick them. Only the first node added for a package is used.
#[derive(Debug, Clone, Default)]
pub struct InstalledSet {
    pub(crate) nodes: Vec<(ConcreteNode, InstalledPolicy)>,
}

impl InstalledSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: ConcreteNode, policy: InstalledPolicy) {
        self.nodes.push((node, policy));
    }

    pub fn add_favored(&mut self, node: ConcreteNode) {
        self.add(node, InstalledPolicy::Favored);
    }

    pub fn add_locked(&mut self, node: ConcreteNode) {
        self.add(node, InstalledPolicy::Locked);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Only the locked entries.
    pub fn locked_only(&self) -> InstalledSet {
        InstalledSet {
            nodes: self
                .nodes
                .iter()
                .filter(|(_, p)| *p == InstalledPolicy::Locked)
                .cloned()
                .collect(),
        }
    }

    /// The first installed node of `package` with its policy.
    pub fn get(&self, package: &str) -> Option<(&ConcreteNode, InstalledPolicy)> {
        self.nodes
            .iter()
            .find(|(n, _)| n.name == package)
            .map(|(n, p)| (n, *p))
    }
}
