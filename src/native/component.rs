// src/native/component.rs

use super::toolchain::ToolchainSelection;
use crate::core::lazy::Lazy;
use crate::models::WorkId;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// What a native component produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Library,
    Application,
    TestSuite,
}

/// The public face of every native component, used for type-based lookups.
pub trait NativeComponent: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> ComponentKind;
}

/// The objects of the debug build of a component, linked into test executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevelopmentBinary {
    pub component: String,
    pub objects: Vec<PathBuf>,
}

/// The production component of a project, published as the `main` extension.
pub struct MainComponent {
    name: String,
    kind: ComponentKind,
    sources: Arc<Mutex<Vec<PathBuf>>>,
    compile_node: WorkId,
    development_binary: Lazy<DevelopmentBinary>,
}

impl MainComponent {
    /// Creates the component. `compile_node` produces the development binary, whose
    /// object list is computed from the sources present when it is first resolved.
    pub(crate) fn new(
        name: &str,
        kind: ComponentKind,
        object_dir: PathBuf,
        compile_node: WorkId,
    ) -> Self {
        let sources: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
        let shared = Arc::clone(&sources);
        let component = name.to_string();
        let development_binary = Lazy::from_fn(format!("{}.developmentBinary", name), move || {
            let sources = shared.lock().unwrap_or_else(PoisonError::into_inner);
            let objects = sources
                .iter()
                .map(|source| object_file(&object_dir, source))
                .collect();
            Ok(DevelopmentBinary { component, objects })
        })
        .produced_by(compile_node);
        Self {
            name: name.to_string(),
            kind,
            sources,
            compile_node,
            development_binary,
        }
    }

    /// Adds a source file. Sources added before the development binary is first
    /// resolved end up in its object list.
    pub fn add_source(&self, source: impl Into<PathBuf>) {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.into());
    }

    pub fn sources(&self) -> Vec<PathBuf> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn compile_node(&self) -> WorkId {
        self.compile_node
    }

    /// Deferred debug build of the component, produced by its compile node.
    pub fn development_binary(&self) -> &Lazy<DevelopmentBinary> {
        &self.development_binary
    }
}

fn object_file(object_dir: &Path, source: &Path) -> PathBuf {
    let stem = source.file_stem().map_or_else(|| "unnamed".into(), |s| s.to_string_lossy());
    object_dir.join(format!("{}.o", stem))
}

impl NativeComponent for MainComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        self.kind
    }
}

impl fmt::Debug for MainComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainComponent")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("compile_node", &self.compile_node)
            .field("development_binary", &self.development_binary.state())
            .finish()
    }
}

/// An executable built for one toolchain selection of a test suite.
#[derive(Debug, Clone)]
pub struct TestExecutable {
    pub selection: ToolchainSelection,
    pub link_node: WorkId,
    pub install_node: WorkId,
    pub run_node: WorkId,
    /// Produced by the link node.
    pub executable: Lazy<PathBuf>,
    /// Produced by the install node.
    pub install_dir: Lazy<PathBuf>,
}

#[derive(Debug, Default)]
struct SuiteState {
    tested_component: Option<String>,
    executables: Vec<TestExecutable>,
}

/// A unit test suite, published as the `unitTest` extension.
#[derive(Debug)]
pub struct TestSuite {
    name: String,
    state: Mutex<SuiteState>,
}

impl TestSuite {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SuiteState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SuiteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the component under test, once the suite has been wired.
    pub fn tested_component(&self) -> Option<String> {
        self.state().tested_component.clone()
    }

    /// Records the component under test. Returns `false` if one was already set.
    pub fn set_tested_component(&self, component: &str) -> bool {
        let mut state = self.state();
        if state.tested_component.is_some() {
            return false;
        }
        state.tested_component = Some(component.to_string());
        true
    }

    pub fn add_executable(&self, executable: TestExecutable) {
        self.state().executables.push(executable);
    }

    pub fn executables(&self) -> Vec<TestExecutable> {
        self.state().executables.clone()
    }

    /// The most recently added executable.
    pub fn test_executable(&self) -> Option<TestExecutable> {
        self.state().executables.last().cloned()
    }
}

impl NativeComponent for TestSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::TestSuite
    }
}
