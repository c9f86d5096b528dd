//! # Extension Registry
//!
//! A per-project namespace of named singleton configuration objects. Entries are
//! stored type-erased and recovered by downcasting. An entry is always reachable
//! under its concrete type and may additionally be exposed under any number of
//! declared public types (usually trait objects), which is how a lookup by a
//! "supertype" is expressed without runtime reflection.

use super::lazy::Lazy;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Errors raised by extension registration and lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// An extension with the same name already exists in the project.
    #[error("An extension named '{name}' is already registered.")]
    DuplicateRegistration {
        /// The conflicting name.
        name: String,
    },
    /// No extension matches the requested name or type.
    #[error("No extension '{name}' is registered.")]
    NotFound {
        /// The requested name, or the requested type name for type lookups.
        name: String,
    },
    /// More than one extension is exposed under the requested type.
    #[error("Extension type '{type_name}' is ambiguous; candidates: {}", .candidates.join(", "))]
    AmbiguousType {
        /// The requested type.
        type_name: &'static str,
        /// The names of every matching extension, in registration order.
        candidates: Vec<String>,
    },
    /// The named extension exists but is not exposed under the requested type.
    #[error("Extension '{name}' is a '{actual}', not a '{requested}'.")]
    TypeMismatch {
        /// The name that was looked up.
        name: String,
        /// The type requested by the caller.
        requested: &'static str,
        /// The concrete type of the registered instance.
        actual: &'static str,
    },
}

type ExtensionResult<T> = Result<T, ExtensionError>;

/// A named extension together with the types it can be retrieved as.
pub struct ExtensionEntry {
    name: String,
    type_name: &'static str,
    // Each view is a boxed `Arc<V>` keyed by `TypeId::of::<V>()`.
    views: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ExtensionEntry {
    /// Creates an entry retrievable under the concrete type `T`.
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>, instance: Arc<T>) -> Self {
        let mut views: HashMap<TypeId, Box<dyn Any + Send + Sync>> = HashMap::new();
        views.insert(TypeId::of::<T>(), Box::new(instance));
        Self {
            name: name.into(),
            type_name: type_name::<T>(),
            views,
        }
    }

    /// Additionally exposes the entry under the public type `V`.
    ///
    /// `view` is normally the same instance coerced to a trait object, e.g.
    /// `Arc::clone(&suite) as Arc<dyn TestComponent>`.
    pub fn exposed_as<V: ?Sized + Send + Sync + 'static>(mut self, view: Arc<V>) -> Self {
        self.views.insert(TypeId::of::<V>(), Box::new(view));
        self
    }

    /// The name of the entry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concrete type name of the registered instance.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn view<V: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<V>> {
        let erased: &(dyn Any + Send + Sync) = &**self.views.get(&TypeId::of::<V>())?;
        erased.downcast_ref::<Arc<V>>().cloned()
    }
}

impl fmt::Debug for ExtensionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionEntry")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("views", &self.views.len())
            .finish()
    }
}

/// The extension namespace of one project. Entries are never removed.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    entries: Vec<ExtensionEntry>,
    by_name: HashMap<String, usize>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` under `name` and returns the shared instance.
    ///
    /// # Errors
    /// Returns `ExtensionError::DuplicateRegistration` if `name` is taken; the
    /// existing entry is left untouched.
    pub fn register<T: Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        instance: T,
    ) -> ExtensionResult<Arc<T>> {
        let instance = Arc::new(instance);
        self.add(ExtensionEntry::new(name, Arc::clone(&instance)))?;
        Ok(instance)
    }

    /// Adds a fully built entry.
    ///
    /// # Errors
    /// Returns `ExtensionError::DuplicateRegistration` if the name is taken.
    pub fn add(&mut self, entry: ExtensionEntry) -> ExtensionResult<()> {
        if self.by_name.contains_key(&entry.name) {
            return Err(ExtensionError::DuplicateRegistration { name: entry.name });
        }
        log::debug!(
            "Registering extension '{}' of type '{}'.",
            entry.name,
            entry.type_name
        );
        self.by_name.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Looks an extension up by name.
    ///
    /// # Errors
    /// `NotFound` if no entry has that name, `TypeMismatch` if the entry is not
    /// retrievable as `V`.
    pub fn get<V: ?Sized + Send + Sync + 'static>(&self, name: &str) -> ExtensionResult<Arc<V>> {
        let entry = self
            .by_name
            .get(name)
            .and_then(|&i| self.entries.get(i))
            .ok_or_else(|| ExtensionError::NotFound {
                name: name.to_string(),
            })?;
        entry.view::<V>().ok_or(ExtensionError::TypeMismatch {
            name: name.to_string(),
            requested: type_name::<V>(),
            actual: entry.type_name,
        })
    }

    /// Like `get`, returning `None` on any lookup failure.
    pub fn find<V: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Option<Arc<V>> {
        self.get(name).ok()
    }

    /// Looks up the single extension retrievable as `V`.
    ///
    /// # Errors
    /// `NotFound` if no entry matches, `AmbiguousType` if several do.
    pub fn get_by_type<V: ?Sized + Send + Sync + 'static>(&self) -> ExtensionResult<Arc<V>> {
        let mut matches = self
            .entries
            .iter()
            .filter_map(|entry| entry.view::<V>().map(|view| (entry, view)));
        let Some((_, first)) = matches.next() else {
            return Err(ExtensionError::NotFound {
                name: type_name::<V>().to_string(),
            });
        };
        if matches.next().is_some() {
            let candidates = self
                .entries
                .iter()
                .filter(|entry| entry.views.contains_key(&TypeId::of::<V>()))
                .map(|entry| entry.name.clone())
                .collect();
            return Err(ExtensionError::AmbiguousType {
                type_name: type_name::<V>(),
                candidates,
            });
        }
        Ok(first)
    }

    /// Like `get_by_type`, returning `None` when there is no unique match.
    pub fn find_by_type<V: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<V>> {
        self.get_by_type().ok()
    }

    /// Whether an extension named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Extension names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Number of registered extensions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A shared, read-only handle to a project's extension registry.
///
/// Handles can be captured by lazy nodes, which is what makes visibility depend on
/// when a lookup happens rather than on plugin application order.
#[derive(Debug, Clone, Default)]
pub struct ExtensionLookup {
    registry: Arc<RwLock<ExtensionRegistry>>,
}

impl ExtensionLookup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ExtensionRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, ExtensionRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`ExtensionRegistry::get`].
    pub fn get<V: ?Sized + Send + Sync + 'static>(&self, name: &str) -> ExtensionResult<Arc<V>> {
        self.read().get(name)
    }

    /// See [`ExtensionRegistry::find`].
    pub fn find<V: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Option<Arc<V>> {
        self.read().find(name)
    }

    /// See [`ExtensionRegistry::get_by_type`].
    pub fn get_by_type<V: ?Sized + Send + Sync + 'static>(&self) -> ExtensionResult<Arc<V>> {
        self.read().get_by_type()
    }

    /// Whether an extension named `name` exists right now.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains(name)
    }

    /// Extension names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().names().map(str::to_string).collect()
    }

    /// A lazy node that looks `name` up when it is first resolved.
    pub fn lazy<V: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Lazy<Arc<V>> {
        let lookup = self.clone();
        let name = name.to_string();
        Lazy::from_fn(format!("extension '{}'", name), move || {
            lookup.get::<V>(&name).map_err(anyhow::Error::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    trait Component: Send + Sync {
        fn component_name(&self) -> String;
    }

    #[derive(Debug)]
    struct TestSuite {
        name: String,
    }

    impl Component for TestSuite {
        fn component_name(&self) -> String {
            self.name.clone()
        }
    }

    #[derive(Debug)]
    struct Library {
        baseline: Mutex<Vec<String>>,
    }

    impl Component for Library {
        fn component_name(&self) -> String {
            "main".to_string()
        }
    }

    fn suite(name: &str) -> TestSuite {
        TestSuite {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_duplicate_registration_keeps_first_entry() {
        let mut registry = ExtensionRegistry::new();
        registry.register("unitTest", suite("first")).unwrap();

        let error = registry.register("unitTest", suite("second")).unwrap_err();
        assert_eq!(
            error,
            ExtensionError::DuplicateRegistration {
                name: "unitTest".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get::<TestSuite>("unitTest").unwrap().name, "first");
    }

    #[test]
    fn test_get_reports_not_found_and_type_mismatch() {
        let mut registry = ExtensionRegistry::new();
        registry.register("unitTest", suite("unitTest")).unwrap();

        assert!(matches!(
            registry.get::<TestSuite>("integrationTest"),
            Err(ExtensionError::NotFound { .. })
        ));
        let mismatch = registry.get::<Library>("unitTest").unwrap_err();
        assert!(matches!(mismatch, ExtensionError::TypeMismatch { .. }));
        assert!(mismatch.to_string().contains("TestSuite"));
        assert!(registry.find::<Library>("unitTest").is_none());
    }

    #[test]
    fn test_get_by_type_on_public_view() {
        let mut registry = ExtensionRegistry::new();
        let unit = Arc::new(suite("unitTest"));
        registry
            .add(
                ExtensionEntry::new("unitTest", Arc::clone(&unit))
                    .exposed_as(Arc::clone(&unit) as Arc<dyn Component>),
            )
            .unwrap();

        let component = registry.get_by_type::<dyn Component>().unwrap();
        assert_eq!(component.component_name(), "unitTest");
        let by_name = registry.get::<dyn Component>("unitTest").unwrap();
        assert_eq!(by_name.component_name(), "unitTest");
    }

    #[test]
    fn test_get_by_type_is_ambiguous_with_two_candidates() {
        let mut registry = ExtensionRegistry::new();
        let unit = Arc::new(suite("unitTest"));
        let library = Arc::new(Library {
            baseline: Mutex::new(Vec::new()),
        });
        registry
            .add(
                ExtensionEntry::new("unitTest", Arc::clone(&unit))
                    .exposed_as(unit as Arc<dyn Component>),
            )
            .unwrap();
        registry
            .add(
                ExtensionEntry::new("main", Arc::clone(&library))
                    .exposed_as(library as Arc<dyn Component>),
            )
            .unwrap();

        match registry.get_by_type::<dyn Component>() {
            Err(ExtensionError::AmbiguousType { candidates, .. }) => {
                assert_eq!(candidates, vec!["unitTest".to_string(), "main".to_string()]);
            }
            other => panic!("Expected ambiguity, got {:?}", other.map(|_| ())),
        }
        // Concrete types stay unique.
        assert!(registry.get_by_type::<Library>().is_ok());
        assert!(registry.get_by_type::<String>().is_err());
    }

    #[test]
    fn test_lazy_lookup_sees_later_registration() {
        let lookup = ExtensionLookup::new();
        let deferred = lookup.lazy::<Library>("main");

        lookup
            .write()
            .register(
                "main",
                Library {
                    baseline: Mutex::new(vec!["a.cpp".to_string()]),
                },
            )
            .unwrap();

        let library = deferred.get().unwrap();
        assert_eq!(library.baseline.lock().unwrap().len(), 1);
        assert_eq!(lookup.names(), vec!["main".to_string()]);
    }
}
