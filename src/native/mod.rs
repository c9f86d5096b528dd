// src/native/mod.rs

//! Native C++ components and the plugins that configure them.

pub mod component;
pub mod plugins;
pub mod toolchain;

pub use component::{
    ComponentKind, DevelopmentBinary, MainComponent, NativeComponent, TestExecutable, TestSuite,
};
pub use plugins::{
    ApplicationPlugin, LibraryPlugin, NativeBasePlugin, TestingBasePlugin, UnitTestPlugin,
};
pub use toolchain::{
    CachingToolchainSelector, FixedToolchainSelector, PlatformKind, TargetPlatform, ToolProvider,
    ToolchainError, ToolchainSelection, ToolchainSelector,
};
