//! # Finalization Phase Controller
//!
//! Holds the ordered queue of after-evaluation callbacks and the phase of the
//! project: `Open` while plugins are applied, `Running` while callbacks drain, and
//! `Closed` once the graph is frozen.

use super::project::ProjectAction;
use crate::models::Phase;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Errors raised by operations that are not allowed in the current phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    /// A configuration mutation was attempted after finalization.
    #[error("Cannot {operation}: the configuration has been finalized.")]
    ConfigurationClosed {
        /// What the caller tried to do.
        operation: String,
    },
    /// The queue no longer accepts callbacks, or finalize was called twice.
    #[error("The finalization phase has already started.")]
    PhaseClosed,
    /// Finalize was called while a plugin's apply function was still running.
    #[error("Cannot finalize while plugin '{plugin}' is still being applied.")]
    PluginsStillApplying {
        /// The plugin still on the apply stack.
        plugin: String,
    },
    /// An earlier configuration step failed, so the project is left unfinished.
    #[error("Cannot {operation}: the configuration of this project failed earlier: {reason}")]
    ConfigurationFailed {
        /// What the caller tried to do.
        operation: String,
        /// The rendered first failure.
        reason: String,
    },
}

/// The after-evaluation queue of one project.
#[derive(Default)]
pub struct FinalizationQueue {
    phase: Phase,
    callbacks: VecDeque<ProjectAction>,
}

impl FinalizationQueue {
    /// Creates an open, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of queued callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether no callbacks are queued.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Appends a callback. Callbacks run in the order they were enqueued.
    ///
    /// # Errors
    /// `PhaseClosed` unless the queue is `Open`. A callback that tries to queue
    /// another callback while the queue drains gets this error.
    pub fn enqueue(&mut self, callback: ProjectAction) -> Result<(), PhaseError> {
        if self.phase != Phase::Open {
            return Err(PhaseError::PhaseClosed);
        }
        self.callbacks.push_back(callback);
        Ok(())
    }

    /// Moves from `Open` to `Running` and hands over the queued callbacks.
    ///
    /// # Errors
    /// `PhaseClosed` if finalization already started.
    pub fn begin(&mut self) -> Result<VecDeque<ProjectAction>, PhaseError> {
        if self.phase != Phase::Open {
            return Err(PhaseError::PhaseClosed);
        }
        self.phase = Phase::Running;
        Ok(std::mem::take(&mut self.callbacks))
    }

    /// Freezes the configuration. Irreversible.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.callbacks.clear();
    }

    /// Fails with `ConfigurationClosed` if the configuration is frozen.
    pub fn ensure_not_closed(&self, operation: &str) -> Result<(), PhaseError> {
        if self.phase == Phase::Closed {
            return Err(PhaseError::ConfigurationClosed {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for FinalizationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizationQueue")
            .field("phase", &self.phase)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lazy::Lazy;
    use crate::core::plugins::Plugin;
    use crate::core::project::{Project, ProjectError};
    use std::sync::{Arc, Mutex};

    fn noop() -> ProjectAction {
        Box::new(|_| Ok(()))
    }

    #[test]
    fn test_phase_transitions() {
        let mut queue = FinalizationQueue::new();
        assert_eq!(queue.phase(), Phase::Open);
        queue.enqueue(noop()).unwrap();
        queue.enqueue(noop()).unwrap();

        let drained = queue.begin().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.phase(), Phase::Running);
        assert_eq!(queue.enqueue(noop()).unwrap_err(), PhaseError::PhaseClosed);
        assert!(queue.ensure_not_closed("add a node").is_ok());

        queue.close();
        assert!(matches!(queue.begin(), Err(PhaseError::PhaseClosed)));
        assert_eq!(
            queue.ensure_not_closed("add a node").unwrap_err(),
            PhaseError::ConfigurationClosed {
                operation: "add a node".to_string()
            }
        );
    }

    #[test]
    fn test_callbacks_run_in_order_and_see_earlier_effects() {
        let mut project = Project::new("app");
        let seen = Arc::new(Mutex::new(Vec::new()));
        project
            .after_evaluate(|p| {
                p.create_work("generated", "lifecycle")?;
                Ok(())
            })
            .unwrap();
        {
            let seen = Arc::clone(&seen);
            project
                .after_evaluate(move |p| {
                    seen.lock().unwrap().push(p.work_id("generated").is_some());
                    Ok(())
                })
                .unwrap();
        }

        project.finalize().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(project.phase(), Phase::Closed);
    }

    #[test]
    fn test_enqueue_during_running_is_rejected() {
        let mut project = Project::new("app");
        let outcome = Arc::new(Mutex::new(None));
        {
            let outcome = Arc::clone(&outcome);
            project
                .after_evaluate(move |p| {
                    let result = p.after_evaluate(|_| Ok(()));
                    *outcome.lock().unwrap() = Some(result.is_err());
                    Ok(())
                })
                .unwrap();
        }
        project.finalize().unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }

    #[derive(Default)]
    struct Marker;
    impl Plugin for Marker {
        fn apply(&self, _project: &mut Project) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn is_closed<T>(result: Result<T, ProjectError>) -> bool {
        matches!(
            result,
            Err(ProjectError::Phase(PhaseError::ConfigurationClosed { .. }))
        )
    }

    fn is_closed_anyhow<T>(result: anyhow::Result<T>) -> bool {
        match result {
            Ok(_) => false,
            Err(error) => matches!(
                error.downcast_ref::<PhaseError>(),
                Some(PhaseError::ConfigurationClosed { .. })
            ),
        }
    }

    #[test]
    fn test_mutations_after_close_fail() {
        let mut project = Project::new("app");
        let compile = project.create_work("compile", "compile").unwrap();
        let link = project.create_work("link", "link").unwrap();
        project.finalize().unwrap();

        assert!(is_closed(project.create_work("late", "lifecycle")));
        assert!(is_closed(project.after_evaluate(|_| Ok(()))));
        assert!(is_closed(project.register_extension("late", 1_u32)));
        assert!(is_closed(project.add_edge(compile, link)));
        assert!(is_closed(project.bind_input(link, &Lazy::of(1_u32))));
        assert!(is_closed(project.bind_output(compile, &Lazy::of(2_u32))));
        assert!(is_closed(project.work_mut(compile)));
        assert!(is_closed_anyhow(project.on_applied::<Marker, _>(|_| Ok(()))));
        assert!(is_closed_anyhow(project.apply::<Marker>()));
        assert!(!project.has_plugin::<Marker>());
        assert!(project.finalize().is_err());
        assert!(project.graph().node(link).unwrap().predecessors().is_empty());
    }

    #[test]
    fn test_failing_callback_still_closes_the_phase() {
        let mut project = Project::new("app");
        let later_ran = Arc::new(Mutex::new(false));
        project
            .after_evaluate(|_| Err(anyhow::anyhow!("toolchain lookup failed")))
            .unwrap();
        {
            let later_ran = Arc::clone(&later_ran);
            project
                .after_evaluate(move |_| {
                    *later_ran.lock().unwrap() = true;
                    Ok(())
                })
                .unwrap();
        }
        let error = project.finalize().unwrap_err();
        assert!(format!("{:#}", error).contains("toolchain lookup failed"));
        assert!(!*later_ran.lock().unwrap());
        assert_eq!(project.phase(), Phase::Closed);
    }
}
