// src/native/plugins.rs

//! The native plugins. `UnitTestPlugin` is the interesting one: it does not know
//! whether the project builds a library or an application, or whether that plugin
//! is applied before or after it, so it reacts to either being applied and wires
//! its nodes through lazy bindings.

use super::component::{
    ComponentKind, MainComponent, NativeComponent, TestExecutable, TestSuite,
};
use super::toolchain::{PlatformKind, ToolchainSelector};
use crate::constants::{
    ASSEMBLE_NODE, BUILD_GROUP, BUILD_NODE, CHECK_NODE, MAIN_COMPONENT_EXTENSION,
    UNIT_TEST_EXTENSION, UNIT_TEST_RESULTS_DIR, VERIFICATION_GROUP,
};
use crate::core::extensions::ExtensionEntry;
use crate::core::lazy::Lazy;
use crate::core::plugins::{Plugin, PluginKey};
use crate::core::project::Project;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the node that compiles the debug build of the main component.
pub const COMPILE_MAIN_NODE: &str = "compileDebugCpp";
/// Links the test executable.
pub const LINK_UNIT_TEST_NODE: &str = "linkUnitTest";
/// Copies the test executable into its install directory.
pub const INSTALL_UNIT_TEST_NODE: &str = "installUnitTest";
/// Runs the installed test executable.
pub const RUN_UNIT_TEST_NODE: &str = "runUnitTest";

/// Adds the `assemble` and `build` lifecycle nodes.
#[derive(Debug, Default)]
pub struct NativeBasePlugin;

impl Plugin for NativeBasePlugin {
    fn apply(&self, project: &mut Project) -> Result<()> {
        let assemble = project.create_work(ASSEMBLE_NODE, "lifecycle")?;
        project
            .work_mut(assemble)?
            .set_group(BUILD_GROUP)
            .set_description("Assembles the outputs of this project.");
        let build = project.create_work(BUILD_NODE, "lifecycle")?;
        project
            .work_mut(build)?
            .set_group(BUILD_GROUP)
            .set_description("Assembles and tests this project.");
        project.add_edge(assemble, build)?;
        Ok(())
    }
}

/// Adds the `check` lifecycle node.
#[derive(Debug, Default)]
pub struct TestingBasePlugin;

impl Plugin for TestingBasePlugin {
    fn apply(&self, project: &mut Project) -> Result<()> {
        project.apply::<NativeBasePlugin>()?;
        let check = project.create_work(CHECK_NODE, "lifecycle")?;
        project
            .work_mut(check)?
            .set_group(VERIFICATION_GROUP)
            .set_description("Runs all checks.");
        let build = project.graph().id_of(BUILD_NODE)?;
        project.add_edge(check, build)?;
        Ok(())
    }
}

/// Builds a C++ library from the `main` component.
#[derive(Debug, Default)]
pub struct LibraryPlugin;

impl Plugin for LibraryPlugin {
    fn apply(&self, project: &mut Project) -> Result<()> {
        add_main_component(project, ComponentKind::Library)
    }
}

/// Builds a C++ executable from the `main` component.
#[derive(Debug, Default)]
pub struct ApplicationPlugin;

impl Plugin for ApplicationPlugin {
    fn apply(&self, project: &mut Project) -> Result<()> {
        add_main_component(project, ComponentKind::Application)
    }
}

fn add_main_component(project: &mut Project, kind: ComponentKind) -> Result<()> {
    project.apply::<NativeBasePlugin>()?;

    let compile = project.create_work(COMPILE_MAIN_NODE, "compile")?;
    project
        .work_mut(compile)?
        .set_description("Compiles the C++ sources of the main component.");
    let assemble = project.graph().id_of(ASSEMBLE_NODE)?;
    project.add_edge(compile, assemble)?;

    let object_dir = project.build_dir().join("obj").join("main").join("debug");
    let main = Arc::new(MainComponent::new(MAIN_COMPONENT_EXTENSION, kind, object_dir, compile));
    let view: Arc<dyn NativeComponent> = main.clone();
    project.add_extension(ExtensionEntry::new(MAIN_COMPONENT_EXTENSION, main).exposed_as(view))?;
    Ok(())
}

/// Adds the `unitTest` suite and, once a library or application is present,
/// the nodes that link, install and run it.
pub struct UnitTestPlugin {
    toolchains: Arc<dyn ToolchainSelector>,
}

impl UnitTestPlugin {
    /// A unit-test plugin selecting toolchains through `toolchains`.
    pub fn new(toolchains: Arc<dyn ToolchainSelector>) -> Self {
        Self { toolchains }
    }
}

impl std::fmt::Debug for UnitTestPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitTestPlugin").finish_non_exhaustive()
    }
}

impl Plugin for UnitTestPlugin {
    fn apply(&self, project: &mut Project) -> Result<()> {
        project.apply::<NativeBasePlugin>()?;
        project.apply::<TestingBasePlugin>()?;

        let suite = Arc::new(TestSuite::new(UNIT_TEST_EXTENSION));
        let view: Arc<dyn NativeComponent> = suite.clone();
        project.add_extension(
            ExtensionEntry::new(UNIT_TEST_EXTENSION, Arc::clone(&suite)).exposed_as(view),
        )?;

        // TODO: an application's own `main()` clashes with the test runner's when
        // both are linked into the test executable.
        for key in [PluginKey::of::<LibraryPlugin>(), PluginKey::of::<ApplicationPlugin>()] {
            let toolchains = Arc::clone(&self.toolchains);
            let suite = Arc::clone(&suite);
            project.on_applied_key(key, move |project| {
                wire_unit_test(project, &suite, toolchains.as_ref())
            })?;
        }

        project.after_evaluate(move |project| {
            for executable in suite.executables() {
                for node in [executable.link_node, executable.install_node, executable.run_node] {
                    project.realize(node)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn wire_unit_test(
    project: &mut Project,
    suite: &TestSuite,
    toolchains: &dyn ToolchainSelector,
) -> Result<()> {
    let main = project
        .extensions()
        .get::<MainComponent>(MAIN_COMPONENT_EXTENSION)?;
    if let Some(tested) = suite.tested_component() {
        log::warn!(
            "Unit test suite of '{}' is already wired to '{}', ignoring.",
            project.name(),
            tested
        );
        return Ok(());
    }
    // The suite only records its component once a toolchain is known.
    let selection = toolchains
        .select(PlatformKind::Cpp)
        .with_context(|| format!("Cannot build unit tests of '{}'", project.name()))?;
    if !suite.set_tested_component(main.name()) {
        return Ok(());
    }
    log::debug!(
        "Wiring unit tests of '{}' with toolchain '{}'.",
        project.name(),
        selection.tools.name
    );

    let build_dir = project.build_dir();
    let exe_dir = build_dir.join("exe").join("unitTest");
    let install_root = build_dir.join("install").join("unitTest");
    let results_dir = build_dir.join(UNIT_TEST_RESULTS_DIR);
    let exe_name = selection.executable_name("unitTest");

    // linkUnitTest consumes the objects of the main component; the edge from the
    // compile node follows from the binding.
    let main_objects = main.development_binary().map(|binary| binary.objects);
    let link = project.register_work(LINK_UNIT_TEST_NODE, "link", |project, id| {
        project
            .work_mut(id)?
            .set_description("Links the unit test executable.");
        Ok(())
    })?;
    project.bind_input(link, &main_objects)?;
    let executable = project.bind_output(
        link,
        &Lazy::from_fn("unitTest.executable", move || Ok(exe_dir.join(exe_name))),
    )?;

    let install = project.register_work(INSTALL_UNIT_TEST_NODE, "install", |project, id| {
        project
            .work_mut(id)?
            .set_description("Installs the unit test executable.");
        Ok(())
    })?;
    project.bind_input(install, &executable)?;
    let install_dir = project.bind_output(
        install,
        &Lazy::from_fn("unitTest.installDirectory", move || Ok(install_root)),
    )?;

    let run_script = install_dir.zip(&executable).map(|(dir, exe)| -> PathBuf {
        dir.join("lib").join(exe.file_name().unwrap_or(exe.as_os_str()))
    });
    let run = project.register_work(RUN_UNIT_TEST_NODE, "run-test", move |project, id| {
        let script = run_script.clone();
        let results = results_dir;
        project
            .work_mut(id)?
            .set_group(VERIFICATION_GROUP)
            .set_description("Executes C++ unit tests.")
            .set_action(move || {
                let script = script.get()?;
                log::info!(
                    "Running '{}', results in '{}'.",
                    script.display(),
                    results.display()
                );
                Ok(())
            });
        project.bind_input(id, &run_script)?;
        Ok(())
    })?;
    project.bind_input(run, &install_dir)?;

    let check = project.graph().id_of(CHECK_NODE)?;
    project.add_edge(run, check)?;

    suite.add_executable(TestExecutable {
        selection,
        link_node: link,
        install_node: install,
        run_node: run,
        executable,
        install_dir,
    });
    Ok(())
}
