// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;

// --- GRAPH IDENTITY ---

/// Identifies a work node inside the graph of a single project.
///
/// Identifiers are handed out in registration order and are never reused,
/// so they double as a stable tie-breaker when linearizing the graph.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(pub(crate) usize);

impl WorkId {
    /// The position of the node in registration order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// --- OBSERVABLE STATES ---

/// The observable state of a lazy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyState {
    /// Nothing has demanded the value yet.
    Unresolved,
    /// A resolution is in flight.
    Resolving,
    /// The value has been computed and cached.
    Resolved,
    /// The computation failed; the error is cached.
    Failed,
}

/// The configuration phase of a project.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Plugins are being applied; finalization callbacks may be queued.
    #[default]
    Open,
    /// Finalization callbacks are running; the queue no longer accepts entries.
    Running,
    /// The graph is frozen and has been handed to the scheduler.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Running => "running",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}
