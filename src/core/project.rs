// src/core/project.rs

//! # Project Context
//!
//! The explicit per-project object handed to every plugin entry point. It owns the
//! extension registry, the plugin application record, the work graph and the
//! finalization queue, and rejects every configuration mutation once the
//! configuration has been finalized.

use super::extensions::{ExtensionEntry, ExtensionError, ExtensionLookup};
use super::finalizer::{FinalizationQueue, PhaseError};
use super::lazy::{Lazy, LazyError};
use super::plan::ExecutionPlan;
use super::plugins::{ApplyStart, Plugin, PluginKey, PluginRegistry};
use super::work_graph::{GraphError, WorkGraph, WorkNode};
use crate::dev_utils::BlockTimer;
use crate::models::{Phase, WorkId};
use crate::settings::Settings;
use anyhow::Context;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// A deferred piece of configuration that receives the project it belongs to.
pub type ProjectAction = Box<dyn FnOnce(&mut Project) -> anyhow::Result<()> + Send>;

/// The configuration body of a lazily registered work node.
type Realizer = Box<dyn FnOnce(&mut Project, WorkId) -> anyhow::Result<()> + Send>;

/// Errors returned by the typed project API.
#[derive(Error, Debug)]
pub enum ProjectError {
    /// The operation is not allowed in the current phase.
    #[error("Phase Error: {0}")]
    Phase(#[from] PhaseError),
    /// An extension could not be registered or looked up.
    #[error("Extension Error: {0}")]
    Extension(#[from] ExtensionError),
    /// The work graph rejected a change.
    #[error("Graph Error: {0}")]
    Graph(#[from] GraphError),
    /// A lazy value failed to resolve.
    #[error("Lazy Error: {0}")]
    Lazy(#[from] LazyError),
}

type ProjectResult<T> = Result<T, ProjectError>;

/// One project under configuration.
pub struct Project {
    id: Uuid,
    name: String,
    settings: Arc<Settings>,
    extensions: ExtensionLookup,
    plugins: PluginRegistry,
    graph: WorkGraph,
    realizers: BTreeMap<WorkId, Realizer>,
    finalization: FinalizationQueue,
    failure: Option<String>,
}

impl Project {
    /// Creates a project with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, Arc::new(Settings::default()))
    }

    /// Creates a project that reads the given shared settings.
    pub fn with_settings(name: impl Into<String>, settings: Arc<Settings>) -> Self {
        let name = name.into();
        let id = Uuid::new_v4();
        log::debug!("Creating project '{}' ({}).", name, id);
        Self {
            id,
            name,
            settings,
            extensions: ExtensionLookup::new(),
            plugins: PluginRegistry::new(),
            graph: WorkGraph::new(),
            realizers: BTreeMap::new(),
            finalization: FinalizationQueue::new(),
            failure: None,
        }
    }

    /// The unique identity of the project.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The project name, unique within a build.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The settings shared by every project of the build.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The current configuration phase.
    pub fn phase(&self) -> Phase {
        self.finalization.phase()
    }

    /// Where this project writes its outputs.
    pub fn build_dir(&self) -> PathBuf {
        self.settings.build_dir.join(&self.name)
    }

    // --- FAILURE LATCH ---

    /// The rendered error that aborted the configuration, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Aborts the configuration. Every later mutation and `finalize` is refused.
    /// Only the first failure is kept.
    pub fn mark_failed(&mut self, error: &anyhow::Error) {
        if self.failure.is_none() {
            log::debug!("Configuration of project '{}' failed: {:#}", self.name, error);
            self.failure = Some(format!("{:#}", error));
        }
    }

    fn latch<T>(&mut self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(error) = &result {
            self.mark_failed(error);
        }
        result
    }

    fn ensure_not_failed(&self, operation: &str) -> Result<(), PhaseError> {
        match &self.failure {
            Some(reason) => Err(PhaseError::ConfigurationFailed {
                operation: operation.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn ensure_configurable(&self, operation: &str) -> Result<(), PhaseError> {
        self.finalization.ensure_not_closed(operation)?;
        self.ensure_not_failed(operation)
    }

    // --- EXTENSIONS ---

    /// A shareable read view of the extension registry.
    pub fn extensions(&self) -> ExtensionLookup {
        self.extensions.clone()
    }

    /// Registers `instance` under `name`.
    pub fn register_extension<T: Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        instance: T,
    ) -> ProjectResult<Arc<T>> {
        self.ensure_configurable("register an extension")?;
        Ok(self.extensions.write().register(name, instance)?)
    }

    /// Registers a prepared entry, e.g. one exposed under a trait object.
    pub fn add_extension(&mut self, entry: ExtensionEntry) -> ProjectResult<()> {
        self.ensure_configurable("register an extension")?;
        Ok(self.extensions.write().add(entry)?)
    }

    // --- PLUGINS ---

    /// The plugin application record.
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Whether plugin type `P` has been applied.
    pub fn has_plugin<P: ?Sized + 'static>(&self) -> bool {
        self.plugins.is_applied(PluginKey::of::<P>())
    }

    /// Applies plugin type `P`. Applying an already applied type is a no-op.
    pub fn apply<P: Plugin + Default>(&mut self) -> anyhow::Result<()> {
        self.apply_plugin(P::default())
    }

    /// Applies a configured plugin instance, keyed by its type.
    pub fn apply_plugin<P: Plugin>(&mut self, plugin: P) -> anyhow::Result<()> {
        self.apply_with(PluginKey::of::<P>(), move |project| plugin.apply(project))
    }

    /// Runs `apply` unless `key` is already applied or being applied, records the
    /// key, then fires the listeners waiting for it in registration order.
    ///
    /// A failure of `apply` or of a listener aborts the configuration.
    pub fn apply_with<F>(&mut self, key: PluginKey, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Project) -> anyhow::Result<()>,
    {
        self.ensure_configurable("apply a plugin")?;
        match self.plugins.begin(key) {
            ApplyStart::Started => {}
            ApplyStart::AlreadyApplied => {
                log::trace!("Plugin '{}' already applied to '{}'.", key, self.name);
                return Ok(());
            }
            ApplyStart::InProgress => {
                log::debug!(
                    "Plugin '{}' is already being applied to '{}', skipping.",
                    key,
                    self.name
                );
                return Ok(());
            }
        }

        log::debug!("Applying plugin '{}' to project '{}'.", key, self.name);
        if let Err(error) = apply(self) {
            self.plugins.abort(key);
            let error = error.context(format!(
                "Failed to apply plugin '{}' to project '{}'",
                key, self.name
            ));
            return self.latch(Err(error));
        }

        let listeners = self.plugins.complete(key);
        if !listeners.is_empty() {
            log::debug!("Notifying {} listener(s) of plugin '{}'.", listeners.len(), key);
        }
        for (index, listener) in listeners.into_iter().enumerate() {
            let outcome = listener(self).with_context(|| {
                format!("Listener #{} for plugin '{}' failed", index + 1, key)
            });
            self.latch(outcome)?;
        }
        Ok(())
    }

    /// Runs `callback` once plugin type `P` is applied: now if it already is,
    /// otherwise when it gets applied.
    pub fn on_applied<P, F>(&mut self, callback: F) -> anyhow::Result<()>
    where
        P: ?Sized + 'static,
        F: FnOnce(&mut Project) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_applied_key(PluginKey::of::<P>(), callback)
    }

    /// Key-based form of [`Project::on_applied`].
    pub fn on_applied_key<F>(&mut self, key: PluginKey, callback: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Project) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_configurable("register a plugin listener")?;
        if self.plugins.is_applied(key) {
            log::trace!("Plugin '{}' already applied, running listener now.", key);
            let outcome =
                callback(self).with_context(|| format!("Listener for plugin '{}' failed", key));
            self.latch(outcome)
        } else {
            self.plugins.enqueue(key, Box::new(callback));
            Ok(())
        }
    }

    // --- WORK GRAPH ---

    /// The work graph as wired so far.
    pub fn graph(&self) -> &WorkGraph {
        &self.graph
    }

    /// Adds a work node that exists immediately.
    pub fn create_work(&mut self, name: &str, kind: &str) -> ProjectResult<WorkId> {
        self.ensure_configurable("create a work node")?;
        Ok(self.graph.create(name, kind)?)
    }

    /// Declares a work node whose configuration runs only when the node is
    /// realized, either explicitly or during finalization.
    pub fn register_work<F>(
        &mut self,
        name: &str,
        kind: &str,
        configure: F,
    ) -> ProjectResult<WorkId>
    where
        F: FnOnce(&mut Project, WorkId) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_configurable("register a work node")?;
        let id = self.graph.declare(name, kind)?;
        self.realizers.insert(id, Box::new(configure));
        Ok(id)
    }

    /// The identifier of the node named `name`, if any.
    pub fn work_id(&self, name: &str) -> Option<WorkId> {
        self.graph.find(name)
    }

    /// Mutable access to a node's group, description and action.
    pub fn work_mut(&mut self, id: WorkId) -> ProjectResult<&mut WorkNode> {
        self.ensure_configurable("modify a work node")?;
        Ok(self.graph.node_mut(id)?)
    }

    /// `from` must complete before `to` runs.
    pub fn add_edge(&mut self, from: WorkId, to: WorkId) -> ProjectResult<bool> {
        self.ensure_configurable("add an edge")?;
        Ok(self.graph.add_edge(from, to)?)
    }

    /// See [`WorkGraph::bind_input`].
    pub fn bind_input<T: Clone + Send + 'static>(
        &mut self,
        work: WorkId,
        lazy: &Lazy<T>,
    ) -> ProjectResult<()> {
        self.ensure_configurable("bind an input")?;
        Ok(self.graph.bind_input(work, lazy)?)
    }

    /// See [`WorkGraph::bind_output`].
    pub fn bind_output<T: Clone + Send + 'static>(
        &mut self,
        work: WorkId,
        lazy: &Lazy<T>,
    ) -> ProjectResult<Lazy<T>> {
        self.ensure_configurable("bind an output")?;
        Ok(self.graph.bind_output(work, lazy)?)
    }

    /// Materializes one work definition. Realizing a realized node is a no-op.
    pub fn realize(&mut self, id: WorkId) -> anyhow::Result<()> {
        self.ensure_not_failed("realize a work node")?;
        let newly = self.graph.mark_realized(id)?;
        if let Some(configure) = self.realizers.remove(&id) {
            self.run_realizer(id, configure)?;
        } else if newly {
            log::trace!("Work node {} had no pending configuration.", id);
        }
        Ok(())
    }

    /// Realizes every pending definition, including ones registered by other
    /// definitions while realizing, and returns every node identifier.
    pub fn realize_all(&mut self) -> anyhow::Result<Vec<WorkId>> {
        self.ensure_not_failed("realize work nodes")?;
        while let Some((id, configure)) = self.realizers.pop_first() {
            self.graph.mark_realized(id)?;
            self.run_realizer(id, configure)?;
        }
        for id in self.graph.ids() {
            self.graph.mark_realized(id)?;
        }
        Ok(self.graph.ids())
    }

    fn run_realizer(&mut self, id: WorkId, configure: Realizer) -> anyhow::Result<()> {
        let name = self.graph.node(id)?.name().to_string();
        log::debug!("Realizing work node '{}' of '{}'.", name, self.name);
        let outcome =
            configure(self, id).with_context(|| format!("Failed to realize work node '{}'", name));
        self.latch(outcome)
    }

    // --- FINALIZATION ---

    /// Queues a callback for the finalization pass.
    pub fn after_evaluate<F>(&mut self, callback: F) -> ProjectResult<()>
    where
        F: FnOnce(&mut Project) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_configurable("queue a finalization callback")?;
        Ok(self.finalization.enqueue(Box::new(callback))?)
    }

    /// Runs the queued callbacks in order, realizes what is left, freezes the
    /// configuration and hands the graph over as an [`ExecutionPlan`].
    ///
    /// # Errors
    /// Refuses with `PhaseError::ConfigurationFailed` if an earlier configuration
    /// step failed, so a half-wired graph never becomes a plan.
    pub fn finalize(&mut self) -> anyhow::Result<ExecutionPlan> {
        let _timer = BlockTimer::new(format!("finalize '{}'", self.name));

        if let Some(plugin) = self.plugins.currently_applying() {
            return Err(PhaseError::PluginsStillApplying {
                plugin: plugin.to_string(),
            }
            .into());
        }
        self.ensure_not_failed("finalize")?;
        let callbacks = self.finalization.begin()?;
        log::debug!(
            "Finalizing project '{}' with {} callback(s).",
            self.name,
            callbacks.len()
        );

        let mut outcome = Ok(());
        for (index, callback) in callbacks.into_iter().enumerate() {
            if let Err(error) = callback(self) {
                outcome = Err(error.context(format!(
                    "Finalization callback #{} of project '{}' failed",
                    index + 1,
                    self.name
                )));
                break;
            }
        }
        if outcome.is_ok() {
            outcome = self.realize_all().map(|_| ());
        }
        let outcome = self.latch(outcome);

        self.finalization.close();
        log::debug!("Project '{}' is now {}.", self.name, self.phase());
        outcome?;

        let plan = ExecutionPlan::new(self.id, self.name.clone(), self.graph.clone())?;
        log::debug!("Execution plan of '{}':\n{}", self.name, plan.render_tree());
        Ok(plan)
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase())
            .field("failed", &self.failure.is_some())
            .field("plugins", &self.plugins)
            .field("graph", &self.graph.len())
            .field("pending_realizations", &self.realizers.len())
            .finish()
    }
}
