// src/constants.rs

/// The name of the settings file read by `Settings::discover`.
pub const SETTINGS_FILENAME: &str = "trellis.toml";

/// The build directory used when the settings do not override it.
pub const DEFAULT_BUILD_DIR: &str = "build";

/// Lifecycle node that aggregates every verification node of a project.
pub const CHECK_NODE: &str = "check";

/// Lifecycle node that aggregates every assembly node of a project.
pub const ASSEMBLE_NODE: &str = "assemble";

/// Lifecycle node that depends on both `assemble` and `check`.
pub const BUILD_NODE: &str = "build";

/// Group assigned to verification nodes such as `runUnitTest`.
pub const VERIFICATION_GROUP: &str = "verification";

/// Group assigned to lifecycle nodes.
pub const BUILD_GROUP: &str = "build";

/// The extension name under which the main native component is published.
pub const MAIN_COMPONENT_EXTENSION: &str = "main";

/// The extension name under which the unit test suite is published.
pub const UNIT_TEST_EXTENSION: &str = "unitTest";

/// Results directory of the unit test suite, relative to the build directory.
pub const UNIT_TEST_RESULTS_DIR: &str = "test-results/unitTest";
