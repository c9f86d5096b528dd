//! # Lazy Value Graph
//!
//! Deferred, memoized computation nodes. A `Lazy<T>` is a cheap handle to a shared
//! node; cloning the handle never clones the computation. The first `get()` runs the
//! node's transformation inline on the calling thread and caches the value or the
//! error, every later `get()` (from any handle, on any thread) returns the cache.
//!
//! Nodes resolve behind a mutex + condition variable, so a node shared between
//! projects that are configured on different threads still evaluates exactly once.
//! Re-entrant resolution on the same thread is detected through a thread-local
//! resolution stack and reported as a cycle instead of deadlocking. A cycle that
//! spans threads (A resolves `x` and waits for `y` while B resolves `y` and waits
//! for `x`) is caught by a process-wide wait-for graph checked before blocking.

use crate::models::{LazyState, WorkId};
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use thiserror::Error;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The nodes currently being evaluated on this thread, outermost first.
    static RESOLUTION_STACK: RefCell<Vec<(u64, String)>> =
        const { RefCell::new(Vec::new()) };
}

/// Which thread evaluates which node, and which node each blocked thread waits for.
///
/// Lock order: a node's state lock may be held while taking this lock, never the
/// other way around.
#[derive(Debug, Default)]
struct WaitGraph {
    owners: HashMap<u64, (ThreadId, String)>,
    waiting: HashMap<ThreadId, u64>,
}

impl WaitGraph {
    /// Follows owner -> awaited node -> owner starting at `id`. Returns the chain
    /// `a -> b -> a` if the walk comes back to `current`.
    fn cycle_from(&self, id: u64, current: ThreadId) -> Option<String> {
        let mut path: Vec<&str> = Vec::new();
        let mut node = id;
        for _ in 0..=self.owners.len() {
            let (owner, label) = self.owners.get(&node)?;
            path.push(label.as_str());
            if *owner == current {
                let mut chain = vec![label.as_str()];
                chain.extend(path);
                return Some(chain.join(" -> "));
            }
            node = *self.waiting.get(owner)?;
        }
        None
    }
}

lazy_static! {
    static ref WAIT_GRAPH: Mutex<WaitGraph> = Mutex::new(WaitGraph::default());
}

fn wait_graph() -> MutexGuard<'static, WaitGraph> {
    WAIT_GRAPH.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors produced while resolving a lazy node.
///
/// The type is `Clone` because a failure is cached in the node and handed out again
/// to every later reader, and to every downstream node that depends on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LazyError {
    /// The node was demanded while it was already being resolved on the same stack.
    #[error("Circular evaluation detected: {chain}")]
    CycleDetected {
        /// The chain of node labels, starting and ending with the repeated node.
        chain: String,
    },
    /// A transformation function returned an error.
    #[error("Evaluation of '{node}' failed: {message}")]
    Failed {
        /// The label of the node whose transformation failed.
        node: String,
        /// The rendered error chain of the transformation.
        message: String,
    },
    /// A transformation function panicked while the node was resolving.
    #[error("Evaluation of '{node}' panicked; its value is unavailable.")]
    Poisoned {
        /// The label of the node that was resolving.
        node: String,
    },
}

impl LazyError {
    /// Wraps an error raised by the transformation of `node`.
    pub fn failed(node: &str, error: &anyhow::Error) -> Self {
        Self::Failed {
            node: node.to_string(),
            message: format!("{:#}", error),
        }
    }

    /// The label of the node where the failure originated, if it is known.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Failed { node, .. } | Self::Poisoned { node } => Some(node),
            Self::CycleDetected { .. } => None,
        }
    }
}

type Thunk<T> = Box<dyn FnOnce(&str) -> Result<T, LazyError> + Send>;

enum NodeState<T> {
    Unresolved(Thunk<T>),
    Resolving,
    Resolved(T),
    Failed(LazyError),
}

struct Node<T> {
    id: u64,
    label: String,
    state: Mutex<NodeState<T>>,
    settled: Condvar,
}

impl<T> Node<T> {
    fn lock_state(&self) -> MutexGuard<'_, NodeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: NodeState<T>) {
        *self.lock_state() = outcome;
        self.settled.notify_all();
    }
}

/// A handle to a deferred, memoized value.
///
/// Besides the shared node, a handle carries the work nodes that produce the value.
/// Wiring a handle as the input of another work node adds an execution edge from
/// each producer, so data dependencies imply ordering without explicit `depends_on`.
pub struct Lazy<T> {
    node: Arc<Node<T>>,
    producers: Vec<WorkId>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            producers: self.producers.clone(),
        }
    }
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("id", &self.node.id)
            .field("label", &self.node.label)
            .field("state", &self.state())
            .field("producers", &self.producers)
            .finish()
    }
}

impl<T> Lazy<T> {
    /// Diagnostic label of the underlying node.
    pub fn label(&self) -> &str {
        &self.node.label
    }

    /// The work nodes that produce this value.
    pub fn producers(&self) -> &[WorkId] {
        &self.producers
    }

    /// Current state of the underlying node. Never forces resolution.
    pub fn state(&self) -> LazyState {
        match &*self.node.lock_state() {
            NodeState::Unresolved(_) => LazyState::Unresolved,
            NodeState::Resolving => LazyState::Resolving,
            NodeState::Resolved(_) => LazyState::Resolved,
            NodeState::Failed(_) => LazyState::Failed,
        }
    }

    /// Whether a value has been cached.
    pub fn is_resolved(&self) -> bool {
        self.state() == LazyState::Resolved
    }

    /// Whether two handles point at the same node.
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl<T: Clone + Send + 'static> Lazy<T> {
    /// A node that is already resolved to `value`.
    pub fn of(value: T) -> Self {
        Self::with_state("value".to_string(), NodeState::Resolved(value), Vec::new())
    }

    /// A root node whose value is computed by `f` on first demand.
    pub fn from_fn<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::deferred(label.into(), Vec::new(), move |label| {
            f().map_err(|e| LazyError::failed(label, &e))
        })
    }

    /// A node that applies `f` to this node's value.
    ///
    /// If this node fails, the new node fails with the same error and `f` never runs.
    pub fn map<U, F>(&self, f: F) -> Lazy<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let parent = self.clone();
        Lazy::deferred(
            format!("{}.map", self.label()),
            self.producers.clone(),
            move |_| parent.get().map(f),
        )
    }

    /// Like `map`, for fallible transformations. An error returned by `f` fails the
    /// new node and names it as the origin.
    pub fn try_map<U, F>(&self, f: F) -> Lazy<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let parent = self.clone();
        Lazy::deferred(
            format!("{}.try_map", self.label()),
            self.producers.clone(),
            move |label| {
                let value = parent.get()?;
                f(value).map_err(|e| LazyError::failed(label, &e))
            },
        )
    }

    /// A node whose value is the value of the node returned by `f`.
    ///
    /// Only this node's producers are known at wiring time; producers of the node
    /// returned by `f` are discovered when it resolves and are not wired as edges.
    pub fn flat_map<U, F>(&self, f: F) -> Lazy<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Lazy<U> + Send + 'static,
    {
        let parent = self.clone();
        Lazy::deferred(
            format!("{}.flat_map", self.label()),
            self.producers.clone(),
            move |_| f(parent.get()?).get(),
        )
    }

    /// A node holding the values of both parents. The producers are the union of
    /// both parents' producers.
    pub fn zip<U>(&self, other: &Lazy<U>) -> Lazy<(T, U)>
    where
        U: Clone + Send + 'static,
    {
        let mut producers = self.producers.clone();
        for producer in other.producers() {
            if !producers.contains(producer) {
                producers.push(*producer);
            }
        }
        let left = self.clone();
        let right = other.clone();
        Lazy::deferred(
            format!("({}, {})", self.label(), other.label()),
            producers,
            move |_| Ok((left.get()?, right.get()?)),
        )
    }

    /// A handle to the same node that additionally names `work` as a producer.
    pub fn produced_by(&self, work: WorkId) -> Self {
        let mut handle = self.clone();
        if !handle.producers.contains(&work) {
            handle.producers.push(work);
        }
        handle
    }

    /// Forces resolution and returns the cached value or error.
    ///
    /// # Errors
    /// Returns `LazyError::CycleDetected` when the node is demanded while it is
    /// already resolving on this thread, or when waiting for it would close a loop
    /// of threads waiting on each other. Otherwise returns the cached failure of
    /// this node or of any node it depends on.
    pub fn get(&self) -> Result<T, LazyError> {
        if let Some(chain) = cycle_through(self.node.id, &self.node.label) {
            log::trace!("Cycle while resolving '{}': {}", self.node.label, chain);
            return Err(LazyError::CycleDetected { chain });
        }

        let thunk = {
            let mut state = self.node.lock_state();
            loop {
                match std::mem::replace(&mut *state, NodeState::Resolving) {
                    NodeState::Unresolved(thunk) => {
                        wait_graph().owners.insert(
                            self.node.id,
                            (thread::current().id(), self.node.label.clone()),
                        );
                        break thunk;
                    }
                    NodeState::Resolving => {
                        // Another thread owns the evaluation.
                        let current = thread::current().id();
                        {
                            let mut graph = wait_graph();
                            if let Some(chain) = graph.cycle_from(self.node.id, current) {
                                log::trace!(
                                    "Cross-thread cycle at '{}': {}",
                                    self.node.label,
                                    chain
                                );
                                return Err(LazyError::CycleDetected { chain });
                            }
                            graph.waiting.insert(current, self.node.id);
                        }
                        state = self
                            .node
                            .settled
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                        wait_graph().waiting.remove(&current);
                    }
                    NodeState::Resolved(value) => {
                        *state = NodeState::Resolved(value.clone());
                        return Ok(value);
                    }
                    NodeState::Failed(error) => {
                        *state = NodeState::Failed(error.clone());
                        return Err(error);
                    }
                }
            }
        };

        log::trace!("Resolving lazy node '{}'.", self.node.label);
        let evaluation = Evaluation::enter(&self.node);
        let result = thunk(&self.node.label);
        evaluation.finish(&result);
        result
    }

    fn deferred<F>(label: String, producers: Vec<WorkId>, thunk: F) -> Self
    where
        F: FnOnce(&str) -> Result<T, LazyError> + Send + 'static,
    {
        Self::with_state(label, NodeState::Unresolved(Box::new(thunk)), producers)
    }

    fn with_state(label: String, state: NodeState<T>, producers: Vec<WorkId>) -> Self {
        Self {
            node: Arc::new(Node {
                id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
                label,
                state: Mutex::new(state),
                settled: Condvar::new(),
            }),
            producers,
        }
    }
}

/// Tracks one in-flight evaluation on the resolution stack. If the transformation
/// unwinds before `finish`, the node is settled as `Poisoned` so waiters wake up.
struct Evaluation<'a, T> {
    node: &'a Node<T>,
    finished: bool,
}

impl<'a, T: Clone> Evaluation<'a, T> {
    fn enter(node: &'a Node<T>) -> Self {
        RESOLUTION_STACK.with(|stack| stack.borrow_mut().push((node.id, node.label.clone())));
        Self {
            node,
            finished: false,
        }
    }

    fn finish(mut self, result: &Result<T, LazyError>) {
        let outcome = match result {
            Ok(value) => NodeState::Resolved(value.clone()),
            Err(error) => NodeState::Failed(error.clone()),
        };
        release(self.node.id);
        self.node.settle(outcome);
        self.finished = true;
    }
}

impl<T> Drop for Evaluation<'_, T> {
    fn drop(&mut self) {
        RESOLUTION_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        if !self.finished {
            log::warn!("Lazy node '{}' unwound during evaluation.", self.node.label);
            release(self.node.id);
            self.node.settle(NodeState::Failed(LazyError::Poisoned {
                node: self.node.label.clone(),
            }));
        }
    }
}

fn release(id: u64) {
    wait_graph().owners.remove(&id);
}

/// Renders the chain `a -> b -> a` if `id` is already on this thread's stack.
fn cycle_through(id: u64, label: &str) -> Option<String> {
    RESOLUTION_STACK.with(|stack| {
        let stack = stack.borrow();
        let start = stack.iter().position(|(node_id, _)| *node_id == id)?;
        let mut chain: Vec<&str> = stack
            .iter()
            .skip(start)
            .map(|(_, name)| name.as_str())
            .collect();
        chain.push(label);
        Some(chain.join(" -> "))
    })
}

/// A type-erased view of a lazy node, used by the work graph to hold bindings of
/// different value types.
pub trait LazyBinding: Send + Sync + fmt::Debug {
    /// Diagnostic label of the bound node.
    fn label(&self) -> &str;
    /// Work nodes producing the bound value.
    fn producers(&self) -> &[WorkId];
    /// Current state of the bound node.
    fn state(&self) -> LazyState;
    /// Resolves the bound node, discarding the value.
    fn force(&self) -> Result<(), LazyError>;
}

impl<T: Clone + Send + 'static> LazyBinding for Lazy<T> {
    fn label(&self) -> &str {
        Self::label(self)
    }

    fn producers(&self) -> &[WorkId] {
        Self::producers(self)
    }

    fn state(&self) -> LazyState {
        Self::state(self)
    }

    fn force(&self) -> Result<(), LazyError> {
        self.get().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, OnceLock};
    use std::thread;
    use std::time::Duration;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_of_is_resolved_immediately() {
        let value = Lazy::of(7);
        assert_eq!(value.state(), LazyState::Resolved);
        assert_eq!(value.get().unwrap(), 7);
    }

    #[test]
    fn test_map_chain_resolves_once_for_two_consumers() {
        let calls = counter();
        let (c1, c2) = (calls.clone(), calls.clone());
        let incremented = Lazy::of(5).map(move |x| {
            c1.fetch_add(1, Ordering::SeqCst);
            x + 1
        });
        let doubled = incremented.map(move |y| {
            c2.fetch_add(1, Ordering::SeqCst);
            y * 2
        });
        assert_eq!(doubled.state(), LazyState::Unresolved);

        let first_consumer = doubled.map(|v| v);
        let second_consumer = doubled.map(|v| v.to_string());

        assert_eq!(first_consumer.get().unwrap(), 12);
        assert_eq!(second_consumer.get().unwrap(), "12");
        assert_eq!(doubled.get().unwrap(), 12);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_repeated_get_returns_cached_value() {
        let calls = counter();
        let c = calls.clone();
        let lazy = Lazy::from_fn("toolchain", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(String::from("gcc"))
        });
        for _ in 0..5 {
            assert_eq!(lazy.get().unwrap(), "gcc");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_cached_and_propagated_verbatim() {
        let calls = counter();
        let c = calls.clone();
        let root: Lazy<i32> = Lazy::from_fn("objects", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("no sources"))
        });
        let mapper_ran = counter();
        let m = mapper_ran.clone();
        let downstream = root.map(move |x| {
            m.fetch_add(1, Ordering::SeqCst);
            x + 1
        });

        let first = downstream.get().unwrap_err();
        let second = downstream.get().unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.origin(), Some("objects"));
        assert!(first.to_string().contains("no sources"));
        assert_eq!(root.get().unwrap_err(), first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mapper_ran.load(Ordering::SeqCst), 0);
        assert_eq!(downstream.state(), LazyState::Failed);
    }

    #[test]
    fn test_try_map_failure_names_the_mapping_node() {
        let parsed = Lazy::of("x1").try_map(|s| s.parse::<i32>().map_err(anyhow::Error::from));
        let error = parsed.get().unwrap_err();
        assert_eq!(error.origin(), Some("value.try_map"));
    }

    #[test]
    fn test_flat_map_flattens_nested_nodes() {
        let inner_calls = counter();
        let c = inner_calls.clone();
        let outer = Lazy::of(3).flat_map(move |n| {
            let c = c.clone();
            Lazy::from_fn("inner", move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(n * 10)
            })
        });
        assert_eq!(outer.get().unwrap(), 30);
        assert_eq!(outer.get().unwrap(), 30);
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flat_map_propagates_inner_failure() {
        let inner: Lazy<u8> = Lazy::from_fn("inner", || Err(anyhow!("boom")));
        let returned = inner.clone();
        let outer = Lazy::of(1).flat_map(move |_| returned);

        let error = outer.get().unwrap_err();
        assert_eq!(error.origin(), Some("inner"));
        assert_eq!(error, inner.get().unwrap_err());
        assert_eq!(outer.state(), LazyState::Failed);
    }

    #[test]
    fn test_self_referencing_node_fails_with_cycle() {
        let slot: Arc<Mutex<Option<Lazy<i32>>>> = Arc::new(Mutex::new(None));
        let reader = slot.clone();
        let looping = Lazy::of(()).flat_map(move |_| reader.lock().unwrap().clone().unwrap());
        *slot.lock().unwrap() = Some(looping.clone());

        let error = looping.get().unwrap_err();
        match &error {
            LazyError::CycleDetected { chain } => {
                assert_eq!(chain, "value.flat_map -> value.flat_map");
            }
            other => panic!("Expected cycle, got {:?}", other),
        }
        assert_eq!(looping.get().unwrap_err(), error);
        assert_eq!(looping.state(), LazyState::Failed);
    }

    #[test]
    fn test_cycle_across_threads_fails_instead_of_deadlocking() {
        let barrier = Arc::new(Barrier::new(2));
        let x_slot: Arc<OnceLock<Lazy<u32>>> = Arc::default();
        let y_slot: Arc<OnceLock<Lazy<u32>>> = Arc::default();
        let cross = |label: &str, other: &Arc<OnceLock<Lazy<u32>>>| {
            let barrier = Arc::clone(&barrier);
            let other = Arc::clone(other);
            Lazy::from_fn(label, move || {
                // Both nodes are resolving before either demands the other.
                barrier.wait();
                let other = other.get().ok_or_else(|| anyhow!("not wired"))?;
                Ok(other.get()? + 1)
            })
        };
        let x = cross("x", &y_slot);
        let y = cross("y", &x_slot);
        x_slot.set(x.clone()).unwrap();
        y_slot.set(y.clone()).unwrap();

        let first = thread::spawn(move || x.get());
        let second = thread::spawn(move || y.get());
        for outcome in [first.join().unwrap(), second.join().unwrap()] {
            let error = outcome.unwrap_err();
            assert!(
                error.to_string().contains("Circular evaluation detected"),
                "unexpected error: {}",
                error
            );
        }
    }

    #[test]
    fn test_concurrent_first_access_evaluates_once() {
        let calls = counter();
        let c = calls.clone();
        let shared = Lazy::from_fn("toolchain-selection", move || {
            c.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(Arc::new(String::from("clang")))
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lazy = shared.clone();
                thread::spawn(move || lazy.get().unwrap())
            })
            .collect();
        let results: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in &results {
            assert!(Arc::ptr_eq(result, &results[0]));
        }
    }

    #[test]
    fn test_panicking_transformation_poisons_node() {
        let lazy: Lazy<i32> = Lazy::from_fn("exploding", || panic!("boom"));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lazy.get()));
        assert!(outcome.is_err());
        assert_eq!(
            lazy.get().unwrap_err(),
            LazyError::Poisoned {
                node: "exploding".to_string()
            }
        );
    }

    #[test]
    fn test_zip_unions_producers_and_produced_by_shares_node() {
        let a = Lazy::of(1).produced_by(WorkId(0));
        let b = Lazy::of("b").produced_by(WorkId(1)).produced_by(WorkId(0));
        let zipped = a.zip(&b);
        assert_eq!(zipped.producers(), &[WorkId(0), WorkId(1)]);
        assert_eq!(zipped.get().unwrap(), (1, "b"));

        let tagged = zipped.produced_by(WorkId(2));
        assert!(tagged.same_node(&zipped));
        assert_eq!(tagged.producers().len(), 3);
    }
}
