//! # Reactive Plugin Listener Registry
//!
//! Records which plugin types have been applied to a project and keeps, per plugin
//! type, the ordered listeners waiting for that type to be applied. The registry
//! only stores state; the apply/notify sequence itself is driven by
//! [`Project::apply_with`](crate::core::project::Project::apply_with) and
//! [`Project::on_applied_key`](crate::core::project::Project::on_applied_key),
//! because listeners need mutable access to the project that owns this registry.

use super::project::{Project, ProjectAction};
use std::any::{TypeId, type_name};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// A unit of configuration applied to a project.
///
/// Implementations receive the project context explicitly; they publish
/// extensions, wire work nodes and react to sibling plugins through it.
pub trait Plugin: Send + 'static {
    /// Applies the plugin. Called at most once per project.
    fn apply(&self, project: &mut Project) -> anyhow::Result<()>;
}

/// The type tag that keys plugin application records and listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginKey {
    id: TypeId,
    name: &'static str,
}

impl PluginKey {
    /// The key of plugin type `P`.
    pub fn of<P: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<P>(),
            name: type_name::<P>(),
        }
    }

    /// A key that is not backed by a Rust type, e.g. for plugins defined by a
    /// scripting front-end. `tag` must be unique per plugin.
    pub fn named(tag: &'static str) -> Self {
        Self {
            id: TypeId::of::<fn(&'static str)>(),
            name: tag,
        }
    }

    /// The fully qualified name of the plugin type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The unqualified name of the plugin type, for messages.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Outcome of asking to start the application of a plugin type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyStart {
    /// The caller must run the apply function and then call `complete`.
    Started,
    /// The type is already recorded as applied.
    AlreadyApplied,
    /// The type is being applied further up the stack.
    InProgress,
}

/// The plugin application record of one project.
#[derive(Default)]
pub struct PluginRegistry {
    applied: Vec<PluginKey>,
    applying: Vec<PluginKey>,
    pending: HashMap<PluginKey, VecDeque<ProjectAction>>,
}

impl PluginRegistry {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` has been recorded as applied.
    pub fn is_applied(&self, key: PluginKey) -> bool {
        self.applied.contains(&key)
    }

    /// Applied plugin types, in the order they finished applying.
    pub fn applied(&self) -> &[PluginKey] {
        &self.applied
    }

    /// The innermost plugin whose apply function is still running, if any.
    pub fn currently_applying(&self) -> Option<PluginKey> {
        self.applying.last().copied()
    }

    /// Number of listeners still waiting for `key`.
    pub fn pending_listeners(&self, key: PluginKey) -> usize {
        self.pending.get(&key).map_or(0, VecDeque::len)
    }

    pub(crate) fn begin(&mut self, key: PluginKey) -> ApplyStart {
        if self.is_applied(key) {
            ApplyStart::AlreadyApplied
        } else if self.applying.contains(&key) {
            ApplyStart::InProgress
        } else {
            self.applying.push(key);
            ApplyStart::Started
        }
    }

    /// Forgets an application whose apply function failed.
    pub(crate) fn abort(&mut self, key: PluginKey) {
        self.applying.retain(|k| *k != key);
    }

    /// Records `key` as applied and hands back its pending listeners, in
    /// registration order.
    pub(crate) fn complete(&mut self, key: PluginKey) -> VecDeque<ProjectAction> {
        self.applying.retain(|k| *k != key);
        self.applied.push(key);
        self.pending.remove(&key).unwrap_or_default()
    }

    pub(crate) fn enqueue(&mut self, key: PluginKey, listener: ProjectAction) {
        self.pending.entry(key).or_default().push_back(listener);
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending: HashMap<&str, usize> = self
            .pending
            .iter()
            .map(|(key, listeners)| (key.short_name(), listeners.len()))
            .collect();
        f.debug_struct("PluginRegistry")
            .field("applied", &self.applied)
            .field("applying", &self.applying)
            .field("pending", &pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct LibraryPlugin;
    impl Plugin for LibraryPlugin {
        fn apply(&self, _project: &mut Project) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ApplicationPlugin;
    impl Plugin for ApplicationPlugin {
        fn apply(&self, _project: &mut Project) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Applies itself again from inside its own apply function.
    #[derive(Default)]
    struct RecursivePlugin;
    impl Plugin for RecursivePlugin {
        fn apply(&self, project: &mut Project) -> anyhow::Result<()> {
            project.apply::<Self>()
        }
    }

    type Journal = Arc<Mutex<Vec<String>>>;

    fn record(journal: &Journal, entry: &'static str) -> ProjectAction {
        let journal = Arc::clone(journal);
        Box::new(move |_| {
            journal.lock().unwrap().push(entry.to_string());
            Ok(())
        })
    }

    #[test]
    fn test_listener_registered_before_apply_runs_once() {
        let mut project = Project::new("app");
        let journal = Journal::default();
        project.on_applied::<LibraryPlugin, _>(record(&journal, "library")).unwrap();
        assert_eq!(project.plugins().pending_listeners(PluginKey::of::<LibraryPlugin>()), 1);

        project.apply::<LibraryPlugin>().unwrap();
        project.apply::<LibraryPlugin>().unwrap();
        project.apply::<LibraryPlugin>().unwrap();

        assert_eq!(*journal.lock().unwrap(), vec!["library".to_string()]);
        assert_eq!(project.plugins().pending_listeners(PluginKey::of::<LibraryPlugin>()), 0);
    }

    #[test]
    fn test_listener_registered_after_apply_runs_immediately() {
        let mut project = Project::new("app");
        let journal = Journal::default();
        project.apply::<LibraryPlugin>().unwrap();

        project.on_applied::<LibraryPlugin, _>(record(&journal, "late")).unwrap();
        assert_eq!(*journal.lock().unwrap(), vec!["late".to_string()]);

        project.apply::<LibraryPlugin>().unwrap();
        assert_eq!(journal.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listeners_fire_per_type_in_application_order() {
        let mut project = Project::new("app");
        let journal = Journal::default();
        // Registration interleaves the two types; firing groups them by type.
        project
            .on_applied::<LibraryPlugin, _>(record(&journal, "library-listener"))
            .unwrap();
        project
            .on_applied::<ApplicationPlugin, _>(record(&journal, "application-listener"))
            .unwrap();
        project
            .on_applied::<LibraryPlugin, _>(record(&journal, "second-library-listener"))
            .unwrap();

        project.apply::<LibraryPlugin>().unwrap();
        project.apply::<ApplicationPlugin>().unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "library-listener".to_string(),
                "second-library-listener".to_string(),
                "application-listener".to_string(),
            ]
        );
        assert_eq!(
            project.plugins().applied(),
            &[PluginKey::of::<LibraryPlugin>(), PluginKey::of::<ApplicationPlugin>()]
        );
    }

    #[test]
    fn test_same_listener_body_for_two_plugin_types_runs_once_per_type() {
        let mut project = Project::new("app");
        let calls = Arc::new(Mutex::new(0));
        for key in [PluginKey::of::<LibraryPlugin>(), PluginKey::of::<ApplicationPlugin>()] {
            let calls = Arc::clone(&calls);
            project
                .on_applied_key(key, move |_| {
                    *calls.lock().unwrap() += 1;
                    Ok(())
                })
                .unwrap();
        }
        project.apply::<ApplicationPlugin>().unwrap();
        project.apply::<ApplicationPlugin>().unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
        project.apply::<LibraryPlugin>().unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_reapplying_during_own_application_is_a_no_op() {
        let mut project = Project::new("app");
        project.apply::<RecursivePlugin>().unwrap();
        assert!(project.has_plugin::<RecursivePlugin>());
        assert_eq!(project.plugins().applied().len(), 1);
    }

    #[test]
    fn test_failed_apply_is_not_recorded() {
        let mut project = Project::new("app");
        let key = PluginKey::named("broken");
        let error = project
            .apply_with(key, |_| Err(anyhow::anyhow!("missing toolchain")))
            .unwrap_err();
        assert!(format!("{:#}", error).contains("missing toolchain"));
        assert!(!project.plugins().is_applied(key));
        assert!(project.plugins().currently_applying().is_none());
    }

    #[test]
    fn test_plugin_key_names() {
        let key = PluginKey::of::<LibraryPlugin>();
        assert_eq!(key.short_name(), "LibraryPlugin");
        assert_eq!(key.to_string(), "LibraryPlugin");
        assert_ne!(key, PluginKey::of::<ApplicationPlugin>());
    }
}
