// src/native/toolchain.rs

//! Toolchain selection. Detecting compilers is someone else's job; this module
//! only defines what a selection looks like and how it is memoized.

use crate::core::lazy::{Lazy, LazyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// The source language a toolchain is selected for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Cpp,
    Swift,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpp => f.write_str("C++"),
            Self::Swift => f.write_str("Swift"),
        }
    }
}

/// The machine the produced binaries run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlatform {
    pub kind: PlatformKind,
    pub operating_system: String,
    pub architecture: String,
}

impl TargetPlatform {
    /// The platform this process runs on.
    pub fn host(kind: PlatformKind) -> Self {
        Self {
            kind,
            operating_system: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.operating_system == "windows"
    }
}

/// The tools used to build for one target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProvider {
    pub name: String,
    pub compiler: PathBuf,
    pub linker: PathBuf,
}

/// A target platform together with the tools that build for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSelection {
    pub platform: TargetPlatform,
    pub tools: ToolProvider,
}

impl ToolchainSelection {
    /// The file name of an executable called `base` on the target platform.
    pub fn executable_name(&self, base: &str) -> String {
        if self.platform.is_windows() {
            format!("{}.exe", base)
        } else {
            base.to_string()
        }
    }
}

/// Errors from toolchain selection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolchainError {
    /// Nothing installed can build for `kind`.
    #[error("No suitable toolchain is available for {kind}.")]
    NoSuitableToolchain { kind: PlatformKind },
    /// The shared, memoized selection failed.
    #[error("Toolchain selection failed: {0}")]
    Deferred(#[from] LazyError),
}

/// Picks the target platform and tools for a language.
pub trait ToolchainSelector: Send + Sync {
    /// Selects the toolchain for `kind`, or explains why there is none.
    fn select(&self, kind: PlatformKind) -> Result<ToolchainSelection, ToolchainError>;
}

/// Answers from a fixed table. Kinds without an entry have no toolchain.
#[derive(Debug, Clone, Default)]
pub struct FixedToolchainSelector {
    selections: HashMap<PlatformKind, ToolchainSelection>,
}

impl FixedToolchainSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the answer for the selection's platform kind.
    pub fn with(mut self, selection: ToolchainSelection) -> Self {
        self.selections.insert(selection.platform.kind, selection);
        self
    }
}

impl ToolchainSelector for FixedToolchainSelector {
    fn select(&self, kind: PlatformKind) -> Result<ToolchainSelection, ToolchainError> {
        self.selections
            .get(&kind)
            .cloned()
            .ok_or(ToolchainError::NoSuitableToolchain { kind })
    }
}

/// Runs the wrapped selector at most once per kind, even when several projects
/// ask concurrently, and shares the outcome, failures included.
pub struct CachingToolchainSelector {
    inner: Arc<dyn ToolchainSelector>,
    cache: Mutex<HashMap<PlatformKind, Lazy<ToolchainSelection>>>,
}

impl CachingToolchainSelector {
    pub fn new(inner: Arc<dyn ToolchainSelector>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The shared deferred selection for `kind`. Nothing is selected until the
    /// returned value is resolved.
    pub fn lazy(&self, kind: PlatformKind) -> Lazy<ToolchainSelection> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(kind)
            .or_insert_with(|| {
                let inner = Arc::clone(&self.inner);
                Lazy::from_fn(format!("toolchain {}", kind), move || {
                    log::debug!("Selecting a toolchain for {}.", kind);
                    inner.select(kind).map_err(anyhow::Error::from)
                })
            })
            .clone()
    }
}

impl ToolchainSelector for CachingToolchainSelector {
    fn select(&self, kind: PlatformKind) -> Result<ToolchainSelection, ToolchainError> {
        Ok(self.lazy(kind).get()?)
    }
}

impl fmt::Debug for CachingToolchainSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("CachingToolchainSelector")
            .field("cached", &cached)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    pub(crate) fn clang() -> ToolchainSelection {
        ToolchainSelection {
            platform: TargetPlatform {
                kind: PlatformKind::Cpp,
                operating_system: "linux".to_string(),
                architecture: "x86_64".to_string(),
            },
            tools: ToolProvider {
                name: "clang".to_string(),
                compiler: PathBuf::from("/usr/bin/clang++"),
                linker: PathBuf::from("/usr/bin/clang++"),
            },
        }
    }

    struct CountingSelector {
        calls: AtomicUsize,
    }

    impl ToolchainSelector for CountingSelector {
        fn select(&self, kind: PlatformKind) -> Result<ToolchainSelection, ToolchainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match kind {
                PlatformKind::Cpp => Ok(clang()),
                PlatformKind::Swift => Err(ToolchainError::NoSuitableToolchain { kind }),
            }
        }
    }

    #[test]
    fn test_fixed_selector() {
        let selector = FixedToolchainSelector::new().with(clang());
        assert_eq!(selector.select(PlatformKind::Cpp).unwrap().tools.name, "clang");
        assert_eq!(
            selector.select(PlatformKind::Swift).unwrap_err(),
            ToolchainError::NoSuitableToolchain {
                kind: PlatformKind::Swift
            }
        );
    }

    #[test]
    fn test_caching_selector_selects_once_across_threads() {
        let counting = Arc::new(CountingSelector {
            calls: AtomicUsize::new(0),
        });
        let caching = Arc::new(CachingToolchainSelector::new(counting.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let caching = Arc::clone(&caching);
                thread::spawn(move || caching.select(PlatformKind::Cpp).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), clang());
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        assert!(caching.select(PlatformKind::Swift).is_err());
        assert!(caching.select(PlatformKind::Swift).is_err());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_executable_name_follows_target() {
        let mut selection = clang();
        assert_eq!(selection.executable_name("unitTest"), "unitTest");
        selection.platform.operating_system = "windows".to_string();
        assert_eq!(selection.executable_name("unitTest"), "unitTest.exe");
    }
}
