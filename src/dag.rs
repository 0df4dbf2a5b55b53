//! Concrete dependency graphs.
//!
//! The solver's answer is an [`Assignment`]: one version, variant set,
//! compiler and target per package and one provider per virtual.
//! [`ConcreteDag::build`] turns it into a graph by re-evaluating every
//! recipe's `depends_on` declarations against the assignment, keeping one
//! node per package name, and hashing the nodes children first.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent, EdgeRef};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{ConcretizeError, Result};
use crate::hash::{node_hash, HashedDependency};
use crate::recipe::RecipeIndex;
use crate::spec::{ArchSpec, CompilerSpec, DepTypes, Spec};
use crate::translate::follows;
use crate::variant::VariantValue;
use crate::version::{Version, VersionList};

/// The compiler a node is built with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompilerId {
    pub name: String,
    pub version: Version,
}

impl CompilerId {
    pub fn to_spec(&self) -> CompilerSpec {
        CompilerSpec {
            name: self.name.clone(),
            versions: VersionList::exact(self.version.clone()),
        }
    }
}

impl fmt::Display for CompilerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A fully concrete package build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteNode {
    pub name: String,
    pub version: Version,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: CompilerId,
    pub arch: ArchSpec,
    /// Content hash over this node and its dependency subgraph.
    pub hash: String,
}

impl ConcreteNode {
    /// The node alone as a spec with every field pinned.
    pub fn to_spec(&self) -> Spec {
        Spec {
            name: Some(self.name.clone()),
            versions: VersionList::exact(self.version.clone()),
            variants: self.variants.clone(),
            compiler: Some(self.compiler.to_spec()),
            arch: self.arch.clone(),
            dependencies: Vec::new(),
        }
    }

    pub fn short_hash(&self) -> &str {
        self.hash.get(..7).unwrap_or(&self.hash)
    }
}

impl fmt::Display for ConcreteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_spec())?;
        if !self.hash.is_empty() {
            write!(f, " /{}", self.short_hash())?;
        }
        Ok(())
    }
}

/// Edge label: how the parent uses the child, and which virtuals the child
/// provides on this edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub types: DepTypes,
    pub virtuals: BTreeSet<String>,
}

impl DependencyEdge {
    fn empty() -> Self {
        Self {
            types: DepTypes::empty(),
            virtuals: BTreeSet::new(),
        }
    }
}

/// The values chosen for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedNode {
    pub version: Version,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: CompilerId,
    pub arch: ArchSpec,
}

impl AssignedNode {
    fn to_node(&self, name: &str) -> ConcreteNode {
        ConcreteNode {
            name: name.to_string(),
            version: self.version.clone(),
            variants: self.variants.clone(),
            compiler: self.compiler.clone(),
            arch: self.arch.clone(),
            hash: String::new(),
        }
    }
}

/// The package chosen for a virtual and the virtual versions it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChoice {
    pub provider: String,
    pub provided: VersionList,
}

/// A complete solver answer, before graph construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub nodes: BTreeMap<String, AssignedNode>,
    pub providers: BTreeMap<String, ProviderChoice>,
}

impl Assignment {
    /// Package name behind `name`, plus the virtual it was reached through.
    fn resolve<'a>(&'a self, name: &'a str) -> Option<(&'a str, Option<&'a str>)> {
        if self.nodes.contains_key(name) {
            return Some((name, None));
        }
        self.providers
            .get(name)
            .map(|choice| (choice.provider.as_str(), Some(name)))
    }

    /// Node `name` as a spec carrying every other assigned node, and every
    /// chosen virtual, as a `^` constraint. `when` clauses are evaluated
    /// against this view.
    pub fn snapshot(&self, name: &str) -> Option<Spec> {
        let own = self.nodes.get(name)?.to_node(name).to_spec();
        Some(with_context(
            own,
            self.nodes
                .iter()
                .filter(|(other, _)| other.as_str() != name)
                .map(|(other, node)| node.to_node(other).to_spec()),
            &self.providers,
        ))
    }
}

fn with_context(
    mut own: Spec,
    others: impl Iterator<Item = Spec>,
    providers: &BTreeMap<String, ProviderChoice>,
) -> Spec {
    own.dependencies.extend(others);
    own.dependencies
        .extend(providers.iter().map(|(virtual_name, choice)| Spec {
            versions: choice.provided.clone(),
            ..Spec::named(virtual_name)
        }));
    own
}

/// A concretized dependency graph: one node per package name, edges from
/// dependent to dependency.
#[derive(Debug, Clone)]
pub struct ConcreteDag {
    graph: DiGraph<ConcreteNode, DependencyEdge>,
    by_name: BTreeMap<String, NodeIndex>,
    /// Requested root name (possibly a virtual) and the node serving it.
    roots: Vec<(String, NodeIndex)>,
    providers: BTreeMap<String, ProviderChoice>,
}

impl ConcreteDag {
    /// Build the graph reachable from `roots` under `assignment`.
    pub fn build(index: &dyn RecipeIndex, assignment: &Assignment, roots: &[Spec], tests: bool) -> Result<Self> {
        let root_names: BTreeSet<String> = roots.iter().map(|r| r.name_str().to_string()).collect();
        let missing = |name: &str, needed_by: &str| {
            ConcretizeError::Inconsistent(format!("no assignment for `{name}` needed by {needed_by}"))
        };

        let mut dag = ConcreteDag {
            graph: DiGraph::new(),
            by_name: BTreeMap::new(),
            roots: Vec::new(),
            providers: BTreeMap::new(),
        };
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut root_targets = Vec::with_capacity(roots.len());
        for root in roots {
            let requested = root.name_str();
            let (package, via) = assignment
                .resolve(requested)
                .ok_or_else(|| missing(requested, "the request"))?;
            if let Some(virtual_name) = via {
                dag.providers
                    .insert(virtual_name.to_string(), assignment.providers[virtual_name].clone());
            }
            queue.push_back(package.to_string());
            root_targets.push((requested.to_string(), package.to_string()));
        }

        let mut edges: BTreeMap<(String, String), DependencyEdge> = BTreeMap::new();
        while let Some(name) = queue.pop_front() {
            if dag.by_name.contains_key(&name) {
                continue;
            }
            let assigned = assignment
                .nodes
                .get(&name)
                .ok_or_else(|| missing(&name, "the graph"))?;
            let idx = dag.graph.add_node(assigned.to_node(&name));
            dag.by_name.insert(name.clone(), idx);

            let snapshot = assignment.snapshot(&name).ok_or_else(|| missing(&name, "the graph"))?;
            for dep in index.dependencies_of(&name, &snapshot) {
                if !follows(tests, &root_names, &name, &dep) {
                    continue;
                }
                let (child, via) = assignment
                    .resolve(dep.name())
                    .ok_or_else(|| missing(dep.name(), &name))?;
                let edge = edges
                    .entry((name.clone(), child.to_string()))
                    .or_insert_with(DependencyEdge::empty);
                edge.types = edge.types | dep.types;
                if let Some(virtual_name) = via {
                    edge.virtuals.insert(virtual_name.to_string());
                    dag.providers
                        .insert(virtual_name.to_string(), assignment.providers[virtual_name].clone());
                }
                queue.push_back(child.to_string());
            }
        }

        for ((parent, child), edge) in edges {
            dag.graph
                .add_edge(dag.by_name[&parent], dag.by_name[&child], edge);
        }
        dag.roots = root_targets
            .into_iter()
            .map(|(requested, package)| {
                let idx = dag.by_name[&package];
                (requested, idx)
            })
            .collect();
        dag.assign_hashes()?;

        tracing::debug!(
            nodes = dag.graph.node_count(),
            edges = dag.graph.edge_count(),
            pruned = assignment.nodes.len() - dag.graph.node_count(),
            "built concrete graph"
        );
        Ok(dag)
    }

    fn assign_hashes(&mut self) -> Result<()> {
        let order = petgraph::algo::toposort(&self.graph, None).map_err(|cycle| ConcretizeError::CyclicDependency {
            cycle: self
                .example_cycle(cycle.node_id())
                .into_iter()
                .map(|idx| self.graph[idx].name.clone())
                .collect(),
        })?;
        for idx in order.into_iter().rev() {
            let hash = {
                let dependencies: Vec<HashedDependency<'_>> = self
                    .graph
                    .edges(idx)
                    .map(|e| {
                        let child = &self.graph[e.target()];
                        HashedDependency {
                            name: &child.name,
                            hash: &child.hash,
                            types: e.weight().types,
                        }
                    })
                    .collect();
                node_hash(&self.graph[idx], &dependencies)
                    .map_err(|e| ConcretizeError::Inconsistent(format!("cannot hash node: {e}")))?
            };
            self.graph[idx].hash = hash;
        }
        Ok(())
    }

    /// A cycle through `start`, first node repeated at the end.
    fn example_cycle(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut parent = vec![start; self.graph.node_count()];
        let found = depth_first_search(&self.graph, [start], |event| match event {
            DfsEvent::TreeEdge(u, v) => {
                parent[v.index()] = u;
                Control::Continue
            }
            DfsEvent::BackEdge(u, v) if v == start => Control::Break(u),
            _ => Control::Continue,
        });
        let Some(last) = found.break_value() else {
            return vec![start];
        };
        let mut cycle = vec![start];
        let mut current = last;
        while current != start {
            cycle.push(current);
            current = parent[current.index()];
        }
        cycle.push(start);
        cycle.reverse();
        cycle
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Requested names with the node serving each, in request order.
    pub fn roots(&self) -> impl Iterator<Item = (&str, &ConcreteNode)> {
        self.roots
            .iter()
            .map(|(name, idx)| (name.as_str(), &self.graph[*idx]))
    }

    /// The node serving requested root `name`.
    pub fn root(&self, name: &str) -> Option<&ConcreteNode> {
        self.roots
            .iter()
            .find(|(requested, _)| requested == name)
            .map(|(_, idx)| &self.graph[*idx])
    }

    pub fn node(&self, name: &str) -> Option<&ConcreteNode> {
        self.by_name.get(name).map(|idx| &self.graph[*idx])
    }

    /// All nodes, sorted by name.
    pub fn nodes(&self) -> impl Iterator<Item = &ConcreteNode> {
        self.by_name.values().map(|idx| &self.graph[*idx])
    }

    /// Direct dependencies of `name`, sorted by name.
    pub fn dependencies(&self, name: &str) -> Vec<(&ConcreteNode, &DependencyEdge)> {
        let Some(&idx) = self.by_name.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<_> = self
            .graph
            .edges(idx)
            .map(|e| (&self.graph[e.target()], e.weight()))
            .collect();
        deps.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        deps
    }

    /// Direct dependents of `name`, sorted by name.
    pub fn dependents(&self, name: &str) -> Vec<&ConcreteNode> {
        let Some(&idx) = self.by_name.get(name) else {
            return Vec::new();
        };
        let mut parents: Vec<_> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|p| &self.graph[p])
            .collect();
        parents.sort_by(|a, b| a.name.cmp(&b.name));
        parents
    }

    /// The provider chosen for `virtual_name`, if the graph uses it.
    pub fn provider_of(&self, virtual_name: &str) -> Option<&ConcreteNode> {
        self.providers
            .get(virtual_name)
            .and_then(|choice| self.node(&choice.provider))
    }

    pub fn providers(&self) -> &BTreeMap<String, ProviderChoice> {
        &self.providers
    }

    /// Dependencies before dependents; ties broken by name.
    pub fn install_order(&self) -> Vec<&ConcreteNode> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.graph.edges(idx).count()))
            .collect();
        let mut ready: BTreeSet<(&str, NodeIndex)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| (self.graph[*idx].name.as_str(), *idx))
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((_, idx)) = ready.pop_first() {
            order.push(&self.graph[idx]);
            for parent in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if let Some(count) = remaining.get_mut(&parent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((self.graph[parent].name.as_str(), parent));
                    }
                }
            }
        }
        order
    }

    /// Node `name` with its whole dependency subgraph as `^` constraints.
    pub fn to_spec(&self, name: &str) -> Option<Spec> {
        let &start = self.by_name.get(name)?;
        let mut spec = self.graph[start].to_spec();
        let mut seen = BTreeMap::new();
        let mut dfs = petgraph::visit::Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                let node = &self.graph[idx];
                seen.insert(node.name.clone(), node.to_spec());
            }
        }
        spec.dependencies = seen.into_values().collect();
        Some(spec)
    }

    /// Node `name` with every other node and every used virtual as `^`
    /// constraints, the same view the solver's `when` clauses see.
    pub fn snapshot(&self, name: &str) -> Option<Spec> {
        let own = self.node(name)?.to_spec();
        Some(with_context(
            own,
            self.nodes().filter(|n| n.name != name).map(ConcreteNode::to_spec),
            &self.providers,
        ))
    }

    fn write_tree(
        &self,
        f: &mut fmt::Formatter<'_>,
        idx: NodeIndex,
        depth: usize,
        printed: &mut BTreeSet<NodeIndex>,
    ) -> fmt::Result {
        let node = &self.graph[idx];
        let indent = "    ".repeat(depth);
        let caret = if depth == 0 { "" } else { "^" };
        if !printed.insert(idx) {
            return writeln!(f, "{indent}{caret}{}@{} /{}", node.name, node.version, node.short_hash());
        }
        writeln!(f, "{indent}{caret}{node}")?;
        for (child, _) in self.dependencies(&node.name) {
            self.write_tree(f, self.by_name[&child.name], depth + 1, printed)?;
        }
        Ok(())
    }
}

/// Indented tree from each root; repeated subtrees are abbreviated.
impl fmt::Display for ConcreteDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printed = BTreeSet::new();
        for (_, idx) in &self.roots {
            self.write_tree(f, *idx, 0, &mut printed)?;
        }
        Ok(())
    }
}
