// src/core/graph_display.rs

use super::work_graph::{WorkGraph, WorkNode};
use crate::models::WorkId;
use std::collections::HashSet;
use std::fmt;

/// Displays an ASCII tree of a work graph.
///
/// Roots are the nodes nothing else waits for; the children of a node are the
/// nodes it waits for. A node reachable through more than one path is expanded the
/// first time and marked with `(*)` afterwards.
#[derive(Debug)]
pub struct WorkTree<'a> {
    graph: &'a WorkGraph,
}

impl<'a> WorkTree<'a> {
    /// A tree view borrowing `graph`.
    pub fn new(graph: &'a WorkGraph) -> Self {
        Self { graph }
    }

    fn sorted(&self, ids: &[WorkId]) -> Vec<&'a WorkNode> {
        let mut nodes: Vec<&WorkNode> = ids
            .iter()
            .filter_map(|id| self.graph.node(*id).ok())
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Recursive function to print a tree node and what it waits for.
    fn write_node(
        &self,
        f: &mut fmt::Formatter<'_>,
        node: &WorkNode,
        prefix: &str,
        is_last: bool,
        shown: &mut HashSet<WorkId>,
    ) -> fmt::Result {
        let connector = if is_last { "└─" } else { "├─" };
        let first_visit = shown.insert(node.id());
        let repeated_marker = if first_visit { "" } else { " (*)" };

        writeln!(
            f,
            "{}{}{} [{}]{}",
            prefix,
            connector,
            node.name(),
            node.kind(),
            repeated_marker
        )?;
        if !first_visit {
            return Ok(());
        }

        // Prepare the prefix for the children of this node
        let child_prefix = format!("{}{}", prefix, if is_last { "   " } else { "│  " });
        let children = self.sorted(node.predecessors());
        for (i, child) in children.iter().enumerate() {
            let is_last_child = i + 1 == children.len();
            self.write_node(f, child, &child_prefix, is_last_child, shown)?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.graph.is_empty() {
            return writeln!(f, "(no work nodes)");
        }
        let roots: Vec<WorkId> = self
            .graph
            .nodes()
            .filter(|node| node.successors().is_empty())
            .map(WorkNode::id)
            .collect();
        let roots = self.sorted(&roots);
        let mut shown = HashSet::new();
        for (i, root) in roots.iter().enumerate() {
            let is_last = i + 1 == roots.len();
            self.write_node(f, root, "", is_last, &mut shown)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_shape() {
        let mut graph = WorkGraph::new();
        let compile = graph.create("compileDebugCpp", "compile").unwrap();
        let link = graph.create("linkUnitTest", "link").unwrap();
        let run = graph.create("runUnitTest", "run-test").unwrap();
        let check = graph.create("check", "lifecycle").unwrap();
        let assemble = graph.create("assemble", "lifecycle").unwrap();
        graph.add_edge(compile, link).unwrap();
        graph.add_edge(link, run).unwrap();
        graph.add_edge(run, check).unwrap();
        graph.add_edge(compile, assemble).unwrap();

        let expected = "\
├─assemble [lifecycle]
│  └─compileDebugCpp [compile]
└─check [lifecycle]
   └─runUnitTest [run-test]
      └─linkUnitTest [link]
         └─compileDebugCpp [compile] (*)
";
        assert_eq!(WorkTree::new(&graph).to_string(), expected);
    }

    #[test]
    fn test_empty_graph() {
        let graph = WorkGraph::new();
        assert_eq!(WorkTree::new(&graph).to_string(), "(no work nodes)\n");
    }
}
