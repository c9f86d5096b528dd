// src/core/plan.rs

//! The frozen hand-off between configuration and the scheduler.

use super::graph_display::WorkTree;
use super::work_graph::{GraphError, WorkAction, WorkGraph, WorkNode};
use crate::models::WorkId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The finalized, read-only work graph of one project plus its run order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    project_id: Uuid,
    project: String,
    graph: WorkGraph,
    order: Vec<WorkId>,
}

/// Serializable view of a plan, as consumed by an external scheduler.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanSummary {
    /// Identity of the planned project.
    pub project_id: Uuid,
    /// Name of the planned project.
    pub project: String,
    /// Nodes in execution order.
    pub nodes: Vec<NodeSummary>,
}

/// One node of a [`PlanSummary`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeSummary {
    /// Identifier within the project graph.
    pub id: WorkId,
    /// Unique node name, e.g. `linkUnitTest`.
    pub name: String,
    /// Free-form node type, e.g. `link`.
    pub kind: String,
    /// Display group, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Human readable description, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Names of the direct predecessors.
    pub depends_on: Vec<String>,
    /// Labels of the bound lazy inputs.
    pub inputs: Vec<String>,
    /// Labels of the bound lazy outputs.
    pub outputs: Vec<String>,
    /// Whether the node carries an action to run.
    pub has_action: bool,
}

impl ExecutionPlan {
    pub(crate) fn new(
        project_id: Uuid,
        project: String,
        graph: WorkGraph,
    ) -> Result<Self, GraphError> {
        let order = graph.linearize()?;
        Ok(Self {
            project_id,
            project,
            graph,
            order,
        })
    }

    /// Identity of the project this plan was built from.
    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Name of the project this plan was built from.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// A valid execution order; every node appears after all its predecessors.
    pub fn order(&self) -> &[WorkId] {
        &self.order
    }

    /// The frozen graph.
    pub fn graph(&self) -> &WorkGraph {
        &self.graph
    }

    /// The node `id` of the frozen graph.
    pub fn node(&self, id: WorkId) -> Result<&WorkNode, GraphError> {
        self.graph.node(id)
    }

    /// Position of `id` in [`ExecutionPlan::order`].
    pub fn position(&self, id: WorkId) -> Option<usize> {
        self.order.iter().position(|x| *x == id)
    }

    /// The action of node `id`, if it has one. This is the only way to reach it.
    pub fn action(&self, id: WorkId) -> Result<Option<WorkAction>, GraphError> {
        Ok(self.graph.node(id)?.action())
    }

    /// Forces every lazy input of `id`. The scheduler calls this right before the
    /// node's action.
    pub fn resolve_inputs(&self, id: WorkId) -> anyhow::Result<()> {
        let node = self.graph.node(id)?;
        for input in node.inputs() {
            input.force().with_context(|| {
                format!("Failed to resolve input '{}' of '{}'", input.label(), node.name())
            })?;
        }
        Ok(())
    }

    /// Resolves the inputs of `id` and runs its action, if it has one.
    pub fn execute(&self, id: WorkId) -> anyhow::Result<()> {
        self.resolve_inputs(id)?;
        if let Some(action) = self.action(id)? {
            let name = self.graph.node(id)?.name();
            log::debug!("Running '{}' of project '{}'.", name, self.project);
            action().with_context(|| format!("Work node '{}' failed", name))?;
        }
        Ok(())
    }

    /// Serializable view of the plan, nodes in execution order.
    pub fn summary(&self) -> PlanSummary {
        let name_of = |id: &WorkId| {
            self.graph
                .node(*id)
                .map(|n| n.name().to_string())
                .unwrap_or_else(|_| id.to_string())
        };
        let nodes = self
            .order
            .iter()
            .filter_map(|id| self.graph.node(*id).ok())
            .map(|node| NodeSummary {
                id: node.id(),
                name: node.name().to_string(),
                kind: node.kind().to_string(),
                group: node.group().map(str::to_string),
                description: node.description().map(str::to_string),
                depends_on: node.predecessors().iter().map(name_of).collect(),
                inputs: node.inputs().iter().map(|b| b.label().to_string()).collect(),
                outputs: node.outputs().iter().map(|b| b.label().to_string()).collect(),
                has_action: node.has_action(),
            })
            .collect();
        PlanSummary {
            project_id: self.project_id,
            project: self.project.clone(),
            nodes,
        }
    }

    /// [`ExecutionPlan::summary`] as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.summary())
    }

    /// ASCII tree of the graph, one root per node nothing depends on.
    pub fn render_tree(&self) -> String {
        WorkTree::new(&self.graph).to_string()
    }
}
