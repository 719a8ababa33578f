//! Subtask dependency graph.
//!
//! `TaskGraph` validates and normalizes a proposed plan into a set of
//! subtasks with unique identifiers and acyclic dependency edges, and keeps
//! a dependency-respecting total order used by the scheduler for dispatch.
//! The graph only ever grows: subtasks registered at runtime are appended.

use crate::core::task::{Subtask, SubtaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Default maximum number of planned subtasks.
pub const DEFAULT_MAX_SUBTASKS: usize = 10;

/// Traversal marker for the iterative depth-first sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// The validated subtask graph.
///
/// Nodes are subtasks; an edge `a -> b` means `b` depends on `a`.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Subtask, ()>,
    /// Index mapping from SubtaskId to NodeIndex for fast lookups.
    index: HashMap<SubtaskId, NodeIndex>,
    /// Dependency-respecting total order.
    order: Vec<SubtaskId>,
    /// Declared dependencies that name no subtask in the graph, per subtask.
    missing: BTreeMap<SubtaskId, Vec<SubtaskId>>,
}

impl TaskGraph {
    /// Validate and normalize a candidate plan.
    ///
    /// Empty input is replaced by one synthetic subtask covering the whole
    /// `task_description`. Plans longer than `max_subtasks` are truncated.
    /// Invalid or duplicate ids are dropped with a warning, and repeated
    /// dependencies collapse to one.
    ///
    /// A dependency on an id that is not in the graph (never planned, or lost
    /// to truncation or id repair) is kept as declared. It can never be
    /// satisfied, so the subtask is listed by [`TaskGraph::unsatisfiable`]
    /// and must not run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicDependency`] if the dependencies form a cycle.
    pub fn build(
        candidates: Vec<Subtask>,
        task_description: &str,
        max_subtasks: usize,
    ) -> Result<Self> {
        let mut candidates = candidates;
        let max_subtasks = max_subtasks.max(1);

        if candidates.len() > max_subtasks {
            warn!(
                planned = candidates.len(),
                max = max_subtasks,
                "plan exceeds subtask limit, truncating"
            );
            candidates.truncate(max_subtasks);
        }

        let mut seen = HashSet::new();
        let mut subtasks: Vec<Subtask> = Vec::with_capacity(candidates.len());
        for subtask in candidates {
            if !subtask.id.is_valid() {
                warn!(title = %subtask.title, "dropping subtask with invalid id 0");
                continue;
            }
            if !seen.insert(subtask.id) {
                warn!(subtask_id = %subtask.id, "dropping duplicate subtask id");
                continue;
            }
            subtasks.push(subtask);
        }

        if subtasks.is_empty() {
            warn!("plan has no usable subtasks, substituting a single subtask");
            subtasks.push(Subtask::synthetic(task_description));
            seen.insert(SubtaskId::FIRST);
        }

        let mut missing: BTreeMap<SubtaskId, Vec<SubtaskId>> = BTreeMap::new();
        for subtask in &mut subtasks {
            let mut kept = HashSet::new();
            subtask.dependencies.retain(|dep| kept.insert(*dep));
            for dep in &subtask.dependencies {
                if !seen.contains(dep) {
                    warn!(
                        subtask_id = %subtask.id,
                        dependency = %dep,
                        "dependency does not exist, subtask cannot run"
                    );
                    missing.entry(subtask.id).or_default().push(*dep);
                }
            }
        }

        let order = topological_order(&subtasks)?;

        let mut graph = DiGraph::with_capacity(subtasks.len(), subtasks.len());
        let mut index = HashMap::with_capacity(subtasks.len());
        for subtask in subtasks {
            let id = subtask.id;
            index.insert(id, graph.add_node(subtask));
        }
        for &to in index.values() {
            let deps = graph[to].dependencies.clone();
            for dep in deps {
                if let Some(&from) = index.get(&dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Ok(Self {
            graph,
            index,
            order,
            missing,
        })
    }

    /// Append a subtask discovered at runtime.
    ///
    /// All dependencies must already be in the graph, so the appended node
    /// can go to the end of the order without violating it.
    pub fn append(&mut self, subtask: Subtask) -> Result<()> {
        if !subtask.id.is_valid() {
            return Err(Error::Validation(format!(
                "Subtask id must be positive, got {}",
                subtask.id
            )));
        }
        if self.index.contains_key(&subtask.id) {
            return Err(Error::DuplicateSubtask(subtask.id));
        }
        if let Some(missing) = subtask
            .dependencies
            .iter()
            .find(|dep| !self.index.contains_key(*dep))
        {
            return Err(Error::UnknownSubtask(*missing));
        }

        let id = subtask.id;
        let deps = subtask.dependencies.clone();
        let node = self.graph.add_node(subtask);
        for dep in deps {
            self.graph.add_edge(self.index[&dep], node, ());
        }
        self.index.insert(id, node);
        self.order.push(id);
        Ok(())
    }

    /// Get a subtask by its ID.
    pub fn get(&self, id: &SubtaskId) -> Option<&Subtask> {
        self.index
            .get(id)
            .and_then(|&node| self.graph.node_weight(node))
    }

    /// Check if the graph contains a subtask.
    pub fn contains(&self, id: &SubtaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Subtask ids in dependency-respecting order.
    pub fn order(&self) -> &[SubtaskId] {
        &self.order
    }

    /// Subtasks in dependency-respecting order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &Subtask> + '_ {
        self.order.iter().filter_map(move |id| self.get(id))
    }

    /// Subtask ids in ascending id order.
    pub fn ids(&self) -> Vec<SubtaskId> {
        let mut ids: Vec<SubtaskId> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Declared dependencies of a subtask, empty when the id is unknown.
    pub fn dependencies_of(&self, id: &SubtaskId) -> &[SubtaskId] {
        self.get(id)
            .map(|s| s.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Declared dependencies of `id` that name no subtask in the graph.
    pub fn missing_dependencies(&self, id: &SubtaskId) -> &[SubtaskId] {
        self.missing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Subtasks with at least one missing dependency, in ascending id order.
    pub fn unsatisfiable(&self) -> impl Iterator<Item = (SubtaskId, &[SubtaskId])> + '_ {
        self.missing.iter().map(|(id, deps)| (*id, deps.as_slice()))
    }

    /// Direct dependents of a subtask.
    pub fn dependents_of(&self, id: &SubtaskId) -> Vec<SubtaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<SubtaskId> = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Largest id in the graph.
    pub fn max_id(&self) -> SubtaskId {
        self.index
            .keys()
            .copied()
            .max()
            .unwrap_or(SubtaskId(0))
    }

    /// Number of subtasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("subtasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .field("order", &self.order)
            .field("unsatisfiable", &self.missing.len())
            .finish()
    }
}

/// Iterative depth-first topological sort.
///
/// Roots are visited in input order and dependencies in declared order, so
/// independent subtasks keep their planned relative order. Revisiting a node
/// that is still on the stack reports the cycle path. Dependencies outside
/// `subtasks` are not followed.
fn topological_order(subtasks: &[Subtask]) -> Result<Vec<SubtaskId>> {
    let deps: HashMap<SubtaskId, &[SubtaskId]> = subtasks
        .iter()
        .map(|s| (s.id, s.dependencies.as_slice()))
        .collect();
    let mut marks: HashMap<SubtaskId, Mark> = HashMap::with_capacity(subtasks.len());
    let mut order = Vec::with_capacity(subtasks.len());

    for root in subtasks.iter().map(|s| s.id) {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        let mut stack: Vec<(SubtaskId, usize)> = vec![(root, 0)];

        while let Some(&mut (id, ref mut next)) = stack.last_mut() {
            let edges = deps.get(&id).copied().unwrap_or(&[]);
            if *next < edges.len() {
                let dep = edges[*next];
                *next += 1;
                if !deps.contains_key(&dep) {
                    continue;
                }
                match marks.get(&dep) {
                    Some(Mark::Visited) => {}
                    Some(Mark::Visiting) => {
                        let start = stack
                            .iter()
                            .position(|(on_stack, _)| *on_stack == dep)
                            .unwrap_or(0);
                        let mut cycle: Vec<SubtaskId> =
                            stack[start..].iter().map(|(s, _)| *s).collect();
                        cycle.push(dep);
                        return Err(Error::CyclicDependency { cycle });
                    }
                    None => {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            } else {
                stack.pop();
                marks.insert(id, Mark::Visited);
                order.push(id);
            }
        }
    }

    Ok(order)
}
