//! # Work Graph
//!
//! The dependency graph between units of build work. Edges are validated when they
//! are inserted, so the graph is acyclic at every point in time and a rejected edge
//! leaves it untouched. Lazy inputs and outputs are attached without being resolved;
//! binding an input adds an edge from every producer of the lazy value.

use super::lazy::{Lazy, LazyBinding};
use crate::models::WorkId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The executable body of a work node. Only reachable through an `ExecutionPlan`.
pub type WorkAction = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Errors raised while wiring the work graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The edge `from -> to` would close a cycle.
    #[error("Adding '{from}' -> '{to}' would create a cycle: {path}")]
    CycleDetected {
        /// Name of the node that would have to run first.
        from: String,
        /// Name of the node that would have to run second.
        to: String,
        /// The full cycle, e.g. `a -> b -> c -> a`.
        path: String,
    },
    /// A node with the same name already exists.
    #[error("A work node named '{name}' already exists.")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },
    /// The identifier does not belong to this graph.
    #[error("Work node {id} does not exist in this graph.")]
    UnknownNode {
        /// The unknown identifier.
        id: WorkId,
    },
    /// No node has the requested name.
    #[error("No work node named '{name}' exists.")]
    NotFound {
        /// The requested name.
        name: String,
    },
}

type GraphResult<T> = Result<T, GraphError>;

/// A schedulable unit of build work.
#[derive(Clone)]
pub struct WorkNode {
    id: WorkId,
    name: String,
    kind: String,
    group: Option<String>,
    description: Option<String>,
    action: Option<WorkAction>,
    predecessors: Vec<WorkId>,
    successors: Vec<WorkId>,
    inputs: Vec<Arc<dyn LazyBinding>>,
    outputs: Vec<Arc<dyn LazyBinding>>,
    realized: bool,
}

impl WorkNode {
    fn new(id: WorkId, name: String, kind: String, realized: bool) -> Self {
        Self {
            id,
            name,
            kind,
            group: None,
            description: None,
            action: None,
            predecessors: Vec::new(),
            successors: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            realized,
        }
    }

    /// The identifier of the node.
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// The unique name of the node within its project.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind of work, e.g. `compile`, `link` or `lifecycle`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The display group of the node.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// A human readable description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Nodes that must complete before this one, in insertion order.
    pub fn predecessors(&self) -> &[WorkId] {
        &self.predecessors
    }

    /// Nodes that wait for this one, in insertion order.
    pub fn successors(&self) -> &[WorkId] {
        &self.successors
    }

    /// Lazy values consumed by this node.
    pub fn inputs(&self) -> &[Arc<dyn LazyBinding>] {
        &self.inputs
    }

    /// Lazy values produced by this node.
    pub fn outputs(&self) -> &[Arc<dyn LazyBinding>] {
        &self.outputs
    }

    /// Whether the node's definition has been materialized.
    pub fn is_realized(&self) -> bool {
        self.realized
    }

    /// Whether an action has been attached.
    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    pub(crate) fn action(&self) -> Option<WorkAction> {
        self.action.clone()
    }

    /// Sets the display group.
    pub fn set_group(&mut self, group: impl Into<String>) -> &mut Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the description.
    pub fn set_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = Some(description.into());
        self
    }

    /// Attaches the action run by the scheduler.
    pub fn set_action<F>(&mut self, action: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

impl fmt::Debug for WorkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("predecessors", &self.predecessors)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("realized", &self.realized)
            .finish()
    }
}

/// The acyclic dependency graph of one project.
#[derive(Debug, Clone, Default)]
pub struct WorkGraph {
    nodes: Vec<WorkNode>,
    by_name: HashMap<String, WorkId>,
}

impl WorkGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a realized node.
    ///
    /// # Errors
    /// `DuplicateName` if the name is taken.
    pub fn create(
        &mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> GraphResult<WorkId> {
        self.insert(name.into(), kind.into(), true)
    }

    /// Adds a node whose definition will be materialized later.
    ///
    /// # Errors
    /// `DuplicateName` if the name is taken.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> GraphResult<WorkId> {
        self.insert(name.into(), kind.into(), false)
    }

    fn insert(&mut self, name: String, kind: String, realized: bool) -> GraphResult<WorkId> {
        if self.by_name.contains_key(&name) {
            return Err(GraphError::DuplicateName { name });
        }
        let id = WorkId(self.nodes.len());
        log::trace!("Adding work node '{}' ({}) as {}.", name, kind, id);
        self.by_name.insert(name.clone(), id);
        self.nodes.push(WorkNode::new(id, name, kind, realized));
        Ok(id)
    }

    /// Flags a declared node as realized. Returns `false` if it already was.
    pub fn mark_realized(&mut self, id: WorkId) -> GraphResult<bool> {
        let node = self.node_mut(id)?;
        let changed = !node.realized;
        node.realized = true;
        Ok(changed)
    }

    /// The node with identifier `id`.
    pub fn node(&self, id: WorkId) -> GraphResult<&WorkNode> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode { id })
    }

    /// Mutable access to the node with identifier `id`.
    pub fn node_mut(&mut self, id: WorkId) -> GraphResult<&mut WorkNode> {
        self.nodes.get_mut(id.0).ok_or(GraphError::UnknownNode { id })
    }

    /// The identifier of the node named `name`, if any.
    pub fn find(&self, name: &str) -> Option<WorkId> {
        self.by_name.get(name).copied()
    }

    /// The identifier of the node named `name`.
    ///
    /// # Errors
    /// `NotFound` if no node has that name.
    pub fn id_of(&self, name: &str) -> GraphResult<WorkId> {
        self.find(name).ok_or_else(|| GraphError::NotFound {
            name: name.to_string(),
        })
    }

    /// All nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkNode> {
        self.nodes.iter()
    }

    /// All identifiers in registration order.
    pub fn ids(&self) -> Vec<WorkId> {
        self.nodes.iter().map(WorkNode::id).collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records that `from` must complete before `to` runs.
    ///
    /// Returns `false` if the edge already existed.
    ///
    /// # Errors
    /// `CycleDetected` if `from` is reachable from `to` (or `from == to`); the graph
    /// is left unchanged.
    pub fn add_edge(&mut self, from: WorkId, to: WorkId) -> GraphResult<bool> {
        self.check_edge(from, to)?;
        if self.node(to)?.predecessors.contains(&from) {
            return Ok(false);
        }
        log::trace!(
            "Wiring '{}' -> '{}'.",
            self.node(from)?.name,
            self.node(to)?.name
        );
        self.node_mut(to)?.predecessors.push(from);
        self.node_mut(from)?.successors.push(to);
        Ok(true)
    }

    /// Validates the edge `from -> to` without inserting it.
    pub fn check_edge(&self, from: WorkId, to: WorkId) -> GraphResult<()> {
        let from_node = self.node(from)?;
        let to_node = self.node(to)?;
        if let Some(path) = self.path_between(to, from) {
            let mut names = vec![from_node.name.clone()];
            for id in path {
                names.push(self.node(id)?.name.clone());
            }
            return Err(GraphError::CycleDetected {
                from: from_node.name.clone(),
                to: to_node.name.clone(),
                path: names.join(" -> "),
            });
        }
        Ok(())
    }

    /// Whether `later` transitively waits for `earlier`.
    pub fn depends_on(&self, later: WorkId, earlier: WorkId) -> bool {
        later != earlier && self.path_between(earlier, later).is_some()
    }

    /// Attaches `lazy` as an input of `work` and adds an edge from each of its
    /// producers. The value is not resolved. Either every implied edge is added or
    /// none is.
    ///
    /// # Errors
    /// `UnknownNode` or `CycleDetected` for any implied edge.
    pub fn bind_input<T: Clone + Send + 'static>(
        &mut self,
        work: WorkId,
        lazy: &Lazy<T>,
    ) -> GraphResult<()> {
        self.bind_input_erased(work, Arc::new(lazy.clone()))
    }

    /// Type-erased form of [`WorkGraph::bind_input`].
    pub fn bind_input_erased(
        &mut self,
        work: WorkId,
        binding: Arc<dyn LazyBinding>,
    ) -> GraphResult<()> {
        self.node(work)?;
        for producer in binding.producers() {
            self.check_edge(*producer, work)?;
        }
        for producer in binding.producers() {
            self.add_edge(*producer, work)?;
        }
        log::trace!("Bound input '{}' to {}.", binding.label(), work);
        self.node_mut(work)?.inputs.push(binding);
        Ok(())
    }

    /// Attaches `lazy` as an output of `work` and returns a handle to the same node
    /// that names `work` as its producer. The value is not resolved.
    ///
    /// # Errors
    /// `UnknownNode` if `work` is not part of the graph.
    pub fn bind_output<T: Clone + Send + 'static>(
        &mut self,
        work: WorkId,
        lazy: &Lazy<T>,
    ) -> GraphResult<Lazy<T>> {
        let produced = lazy.produced_by(work);
        self.node_mut(work)?.outputs.push(Arc::new(produced.clone()));
        Ok(produced)
    }

    /// A topological order of every node. Ties are broken by registration order, so
    /// the result is deterministic.
    ///
    /// # Errors
    /// `CycleDetected` if the graph contains a cycle, which edge validation rules out.
    pub fn linearize(&self) -> GraphResult<Vec<WorkId>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.predecessors.len()).collect();
        let mut ready: BTreeSet<WorkId> = self
            .nodes
            .iter()
            .filter(|n| n.predecessors.is_empty())
            .map(WorkNode::id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for successor in &self.node(id)?.successors {
                if let Some(degree) = in_degree.get_mut(successor.0) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(*successor);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| !order.contains(&n.id))
                .map(|n| n.name.clone())
                .collect();
            return Err(GraphError::CycleDetected {
                from: stuck.first().cloned().unwrap_or_default(),
                to: stuck.last().cloned().unwrap_or_default(),
                path: stuck.join(" -> "),
            });
        }
        Ok(order)
    }

    /// Depth-first search over successor edges. Returns the path `start ..= goal`.
    fn path_between(&self, start: WorkId, goal: WorkId) -> Option<Vec<WorkId>> {
        let mut parents: HashMap<WorkId, WorkId> = HashMap::new();
        let mut visited = HashSet::from([start]);
        let mut to_visit = vec![start];

        while let Some(current) = to_visit.pop() {
            if current == goal {
                let mut path = vec![goal];
                let mut cursor = goal;
                while cursor != start {
                    cursor = *parents.get(&cursor)?;
                    path.push(cursor);
                }
                path.reverse();
                return Some(path);
            }
            for next in &self.nodes.get(current.0)?.successors {
                if visited.insert(*next) {
                    parents.insert(*next, current);
                    to_visit.push(*next);
                }
            }
        }
        None
    }
}
