//! # Build
//!
//! A set of independent projects sharing one settings file. Projects are configured
//! and finalized concurrently with `rayon`; nothing is shared between them except
//! the settings and whatever lazy values the caller hands to several projects.

use super::plan::ExecutionPlan;
use super::project::Project;
use crate::dev_utils;
use crate::settings::{Settings, SettingsError};
use crate::vcs::VcsMappings;
use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use std::sync::Arc;

/// All projects of one build invocation.
#[derive(Debug)]
pub struct Build {
    settings: Arc<Settings>,
    source_control: VcsMappings,
    projects: Vec<Project>,
}

impl Build {
    /// Creates an empty build. Fails if the declared source mappings are invalid.
    pub fn new(settings: Settings) -> Result<Self, SettingsError> {
        let source_control = settings.source_control()?;
        Ok(Self {
            settings: Arc::new(settings),
            source_control,
            projects: Vec::new(),
        })
    }

    /// The settings shared by every project.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Module-to-repository substitutions declared for this build.
    pub fn source_control(&self) -> &VcsMappings {
        &self.source_control
    }

    pub fn source_control_mut(&mut self) -> &mut VcsMappings {
        &mut self.source_control
    }

    /// Adds a project reading this build's settings and returns it.
    ///
    /// # Errors
    /// Fails if a project with the same name already exists.
    pub fn add_project(&mut self, name: &str) -> Result<&mut Project> {
        if self.project(name).is_some() {
            return Err(anyhow!("A project named '{}' already exists in this build.", name));
        }
        self.projects
            .push(Project::with_settings(name, Arc::clone(&self.settings)));
        self.projects
            .last_mut()
            .ok_or_else(|| anyhow!("Internal logic error: project was not added."))
    }

    /// The project named `name`, if any.
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name() == name)
    }

    /// Mutable access to the project named `name`.
    pub fn project_mut(&mut self, name: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.name() == name)
    }

    /// All projects in the order they were added.
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Runs `configure` against every project in parallel. Every project is
    /// attempted and the failures are reported together. A project whose
    /// configuration failed is marked failed and will refuse to finalize.
    pub fn configure_parallel<F>(&mut self, configure: F) -> Result<()>
    where
        F: Fn(&mut Project) -> Result<()> + Sync,
    {
        let _timer = dev_utils::BlockTimer::new("Build::configure_parallel");
        let errors: Vec<String> = self
            .projects
            .par_iter_mut()
            .filter_map(|project| {
                log::trace!("Configuring project '{}'.", project.name());
                let error = configure(project)
                    .with_context(|| format!("Failed to configure project '{}'", project.name()))
                    .err()?;
                project.mark_failed(&error);
                Some(format!("{:#}", error))
            })
            .collect();
        aggregate(errors, "configuration")
    }

    /// Finalizes every project in parallel and returns the plans in project order.
    pub fn finalize_all(&mut self) -> Result<Vec<ExecutionPlan>> {
        let _timer = dev_utils::BlockTimer::new("Build::finalize_all");
        let results: Vec<Result<ExecutionPlan>> = self
            .projects
            .par_iter_mut()
            .map(|project| {
                project
                    .finalize()
                    .with_context(|| format!("Failed to finalize project '{}'", project.name()))
            })
            .collect();

        let mut plans = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(plan) => plans.push(plan),
                Err(e) => errors.push(format!("{:#}", e)),
            }
        }
        aggregate(errors, "finalization")?;
        Ok(plans)
    }
}

fn aggregate(errors: Vec<String>, stage: &str) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    log::debug!("{} project(s) failed during {}.", errors.len(), stage);
    Err(anyhow!("{} project(s) failed during {}.", errors.len(), stage))
        .context(errors.join("\n"))
}
