// src/settings.rs

//! # Settings
//!
//! Build-wide settings read from `trellis.toml`: where outputs go, how source
//! mappings are matched, and the declarative source mappings themselves.

use crate::constants::{DEFAULT_BUILD_DIR, SETTINGS_FILENAME};
use crate::vcs::{CheckoutRef, CoordinateError, MatchPolicy, VcsMappings, VcsRepository};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Represents errors that can occur while loading settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// An I/O error occurred while reading the settings file.
    #[error("I/O error while reading settings: {0}")]
    Io(#[from] std::io::Error),
    /// The TOML content is invalid and could not be parsed.
    #[error("Failed to parse TOML file at '{path}': {source}")]
    TomlParse {
        /// The path to the file that failed to parse.
        path: PathBuf,
        /// The underlying parsing error from the `toml` crate.
        #[source]
        source: toml::de::Error,
    },
    /// A source mapping names an invalid module selector.
    #[error("Invalid source mapping: {0}")]
    Coordinate(#[from] CoordinateError),
    /// A source mapping sets more than one of `branch`, `tag` and `commit`.
    #[error("Source mapping for '{module}' sets more than one of 'branch', 'tag' and 'commit'.")]
    ConflictingCheckoutRef {
        /// The selector of the offending mapping.
        module: String,
    },
}

/// The contents of `trellis.toml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    #[serde(default)]
    pub mapping_policy: MatchPolicy,
    #[serde(default, rename = "source_mapping")]
    pub source_mappings: Vec<SourceMappingConfig>,
}

/// One `[[source_mapping]]` table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SourceMappingConfig {
    /// `group:name`, `group:*` or `*`.
    pub module: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
}

fn default_build_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BUILD_DIR)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_dir: default_build_dir(),
            mapping_policy: MatchPolicy::default(),
            source_mappings: Vec::new(),
        }
    }
}

impl Settings {
    /// Reads and parses the settings file at `path`.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Parses settings from TOML text. `origin` is only used in error messages.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content).map_err(|e| SettingsError::TomlParse {
            path: origin.to_path_buf(),
            source: e,
        })?;
        log::debug!(
            "Loaded settings from '{}' ({} source mapping(s)).",
            origin.display(),
            settings.source_mappings.len()
        );
        Ok(settings)
    }

    /// Loads `trellis.toml` from `dir`, or the defaults if there is none.
    pub fn discover(dir: &Path) -> Result<Self, SettingsError> {
        let path = dir.join(SETTINGS_FILENAME);
        if !path.exists() {
            log::debug!("No {} in '{}', using defaults.", SETTINGS_FILENAME, dir.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Builds the source mappings declared in the file, in declaration order.
    pub fn source_control(&self) -> Result<VcsMappings, SettingsError> {
        let mut mappings = VcsMappings::new(self.mapping_policy);
        for mapping in &self.source_mappings {
            mappings.with_module(&mapping.module, mapping.repository()?)?;
        }
        Ok(mappings)
    }
}

impl SourceMappingConfig {
    fn repository(&self) -> Result<VcsRepository, SettingsError> {
        let reference = match (&self.branch, &self.tag, &self.commit) {
            (None, None, None) => CheckoutRef::DefaultBranch,
            (Some(branch), None, None) => CheckoutRef::Branch(branch.clone()),
            (None, Some(tag), None) => CheckoutRef::Tag(tag.clone()),
            (None, None, Some(commit)) => CheckoutRef::Commit(commit.clone()),
            _ => {
                return Err(SettingsError::ConflictingCheckoutRef {
                    module: self.module.clone(),
                });
            }
        };
        let mut repository = VcsRepository::git(&self.url).at(reference);
        if let Some(root_dir) = &self.root_dir {
            repository = repository.in_dir(root_dir);
        }
        Ok(repository)
    }
}
