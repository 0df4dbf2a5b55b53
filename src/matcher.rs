//! Matching concrete graphs against the installed database.
//!
//! Installed nodes are matched by concrete hash: equal hashes mean equal
//! nodes with equal dependency subgraphs. The reverse direction,
//! [`installed_set`], feeds installed nodes back to the concretizer so it can
//! prefer them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::dag::{ConcreteDag, ConcreteNode};
use crate::database::{Database, DatabaseError, InstalledRecord, RecordStore};
use crate::layout::{BuildRequest, Layout};
use crate::pool::InstalledSet;

/// What to do for one node of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Already installed.
    Reuse(InstalledRecord),
    Build(BuildRequest),
}

impl PlanAction {
    pub fn node(&self) -> &ConcreteNode {
        match self {
            PlanAction::Reuse(record) => &record.node,
            PlanAction::Build(request) => &request.node,
        }
    }

    pub fn prefix(&self) -> &PathBuf {
        match self {
            PlanAction::Reuse(record) => &record.prefix,
            PlanAction::Build(request) => &request.prefix,
        }
    }
}

/// Every node of a graph, dependencies first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub steps: Vec<PlanAction>,
}

impl InstallPlan {
    pub fn builds(&self) -> impl Iterator<Item = &BuildRequest> {
        self.steps.iter().filter_map(|step| match step {
            PlanAction::Build(request) => Some(request),
            PlanAction::Reuse(_) => None,
        })
    }

    pub fn reused(&self) -> impl Iterator<Item = &InstalledRecord> {
        self.steps.iter().filter_map(|step| match step {
            PlanAction::Reuse(record) => Some(record),
            PlanAction::Build(_) => None,
        })
    }

    pub fn is_noop(&self) -> bool {
        self.builds().next().is_none()
    }
}

pub struct Matcher<'a, S> {
    db: &'a Database<S>,
    layout: &'a Layout,
}

impl<'a, S: RecordStore> Matcher<'a, S> {
    pub fn new(db: &'a Database<S>, layout: &'a Layout) -> Self {
        Self { db, layout }
    }

    /// The installed record identical to `node`, if any.
    pub fn match_node(&self, node: &ConcreteNode) -> Result<Option<InstalledRecord>, DatabaseError> {
        self.db.get(&node.hash)
    }

    /// Reuse what is installed and build the rest. Builds see the prefixes
    /// of reused dependencies where they actually are.
    pub fn plan(&self, dag: &ConcreteDag) -> Result<InstallPlan, DatabaseError> {
        let order = dag.install_order();
        let found: Vec<Option<InstalledRecord>> = self
            .db
            .read(|store| order.iter().map(|node| store.get(&node.hash).cloned()).collect())?;

        let mut prefixes: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut steps = Vec::with_capacity(order.len());
        for (node, record) in order.into_iter().zip(found) {
            let action = match record {
                Some(record) => PlanAction::Reuse(record),
                None => PlanAction::Build(BuildRequest {
                    node: node.clone(),
                    prefix: self.layout.prefix_for(node),
                    source_dir: self.layout.stage_dir(node),
                    dependencies: dag
                        .dependencies(&node.name)
                        .into_iter()
                        .map(|(child, _)| {
                            let prefix = prefixes
                                .get(&child.name)
                                .cloned()
                                .unwrap_or_else(|| self.layout.prefix_for(child));
                            (child.name.clone(), prefix)
                        })
                        .collect(),
                }),
            };
            prefixes.insert(node.name.clone(), action.prefix().clone());
            steps.push(action);
        }
        let plan = InstallPlan { steps };
        tracing::debug!(
            reuse = plan.reused().count(),
            build = plan.builds().count(),
            "planned installation"
        );
        Ok(plan)
    }
}

/// Installed nodes as reuse candidates, explicit installs first, then the
/// most recent.
pub fn installed_set<S: RecordStore>(db: &Database<S>) -> Result<InstalledSet, DatabaseError> {
    let mut records = db.all()?;
    records.sort_by(|a, b| {
        b.explicit
            .cmp(&a.explicit)
            .then_with(|| b.installed_at.cmp(&a.installed_at))
            .then_with(|| a.hash().cmp(b.hash()))
    });
    let mut set = InstalledSet::new();
    for record in records {
        set.add_favored(record.node);
    }
    Ok(set)
}
