// src/core/mod.rs

pub mod build;
pub mod extensions;
pub mod finalizer;
pub mod graph_display;
pub mod lazy;
pub mod plan;
pub mod plugins;
pub mod project;
pub mod work_graph;
