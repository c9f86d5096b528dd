//! # trellis
//!
//! A deferred configuration graph for builds. Plugins publish extensions, chain
//! lazy values, react to each other being applied and wire work nodes; a single
//! finalization pass then freezes each project into an [`core::plan::ExecutionPlan`].

pub mod constants;
pub mod core;
pub mod dev_utils;
pub mod models;
pub mod native;
pub mod settings;
pub mod vcs;

pub use crate::core::build::Build;
pub use crate::core::extensions::{ExtensionEntry, ExtensionError, ExtensionLookup};
pub use crate::core::finalizer::PhaseError;
pub use crate::core::lazy::{Lazy, LazyError};
pub use crate::core::plan::ExecutionPlan;
pub use crate::core::plugins::{Plugin, PluginKey};
pub use crate::core::project::{Project, ProjectError};
pub use crate::core::work_graph::{GraphError, WorkGraph, WorkNode};
pub use crate::models::{LazyState, Phase, WorkId};
pub use crate::settings::Settings;
