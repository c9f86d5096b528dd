// src/vcs.rs

//! # Source Mappings
//!
//! Maps module coordinates to version-control repositories. When a dependency is
//! resolved, a matching rule substitutes the normal artifact lookup with a checkout
//! of the mapped repository. The checkout itself happens elsewhere; this module only
//! decides which source to use.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

lazy_static! {
    static ref COORDINATE_RE: Regex =
        Regex::new(r"^([A-Za-z0-9_.\-]+):([A-Za-z0-9_.\-]+)(?::([A-Za-z0-9_.+\-]+))?$")
            .expect("Failed to compile coordinate regex");
    static ref SELECTOR_RE: Regex = Regex::new(r"^(?:\*|([A-Za-z0-9_.\-]+):(\*|[A-Za-z0-9_.\-]+))$")
        .expect("Failed to compile selector regex");
}

/// Errors from parsing module coordinates and selectors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinateError {
    /// The text is not a `group:name[:version]` coordinate.
    #[error("Invalid module coordinate '{0}'. Expected 'group:name' or 'group:name:version'.")]
    InvalidCoordinate(String),
    /// The text is not a `group:name`, `group:*` or `*` selector.
    #[error("Invalid module selector '{0}'. Expected 'group:name', 'group:*' or '*'.")]
    InvalidSelector(String),
}

/// A `group:name[:version]` module identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleCoordinate {
    pub group: String,
    pub name: String,
    /// Absent when any version is meant.
    pub version: Option<String>,
}

impl ModuleCoordinate {
    /// A coordinate without a version.
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl FromStr for ModuleCoordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = COORDINATE_RE
            .captures(s.trim())
            .ok_or_else(|| CoordinateError::InvalidCoordinate(s.to_string()))?;
        let part = |i: usize| caps.get(i).map(|m| m.as_str().to_string());
        match (part(1), part(2)) {
            (Some(group), Some(name)) => Ok(Self {
                group,
                name,
                version: part(3),
            }),
            _ => Err(CoordinateError::InvalidCoordinate(s.to_string())),
        }
    }
}

impl fmt::Display for ModuleCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)?;
        if let Some(version) = &self.version {
            write!(f, ":{}", version)?;
        }
        Ok(())
    }
}

/// Which modules a mapping rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleSelector {
    /// Exactly one module, any version.
    Module { group: String, name: String },
    /// Every module of a group.
    Group(String),
    /// Every module.
    Any,
}

impl ModuleSelector {
    /// Whether this selector covers `module`. Versions are ignored.
    pub fn matches(&self, module: &ModuleCoordinate) -> bool {
        match self {
            Self::Module { group, name } => *group == module.group && *name == module.name,
            Self::Group(group) => *group == module.group,
            Self::Any => true,
        }
    }

    /// Higher is narrower.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Module { .. } => 2,
            Self::Group(_) => 1,
            Self::Any => 0,
        }
    }
}

impl FromStr for ModuleSelector {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let caps = SELECTOR_RE
            .captures(trimmed)
            .ok_or_else(|| CoordinateError::InvalidSelector(s.to_string()))?;
        match (caps.get(1), caps.get(2)) {
            (None, None) => Ok(Self::Any),
            (Some(group), Some(name)) if name.as_str() == "*" => {
                Ok(Self::Group(group.as_str().to_string()))
            }
            (Some(group), Some(name)) => Ok(Self::Module {
                group: group.as_str().to_string(),
                name: name.as_str().to_string(),
            }),
            _ => Err(CoordinateError::InvalidSelector(s.to_string())),
        }
    }
}

impl fmt::Display for ModuleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module { group, name } => write!(f, "{}:{}", group, name),
            Self::Group(group) => write!(f, "{}:*", group),
            Self::Any => f.write_str("*"),
        }
    }
}

/// What to check out from a repository.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CheckoutRef {
    #[default]
    DefaultBranch,
    Branch(String),
    Tag(String),
    Commit(String),
}

/// A version-control repository a module can be built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsRepository {
    /// Clone URL.
    pub url: String,
    pub reference: CheckoutRef,
    /// Sub-directory of the checkout that holds the build.
    pub root_dir: Option<PathBuf>,
}

impl VcsRepository {
    /// A git repository checked out at its default branch.
    pub fn git(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference: CheckoutRef::DefaultBranch,
            root_dir: None,
        }
    }

    pub fn at(mut self, reference: CheckoutRef) -> Self {
        self.reference = reference;
        self
    }

    pub fn in_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }
}

/// How to pick a rule when several match.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// The earliest registered matching rule wins.
    #[default]
    FirstMatch,
    /// The narrowest matching rule wins; ties go to the earliest registered.
    MostSpecific,
}

/// Where a module's contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Normal repository lookup.
    Artifact(ModuleCoordinate),
    /// Build from a source checkout.
    Checkout {
        module: ModuleCoordinate,
        repository: VcsRepository,
    },
}

/// The ordered source-mapping rules of a build.
#[derive(Debug, Clone, Default)]
pub struct VcsMappings {
    policy: MatchPolicy,
    rules: Vec<(ModuleSelector, VcsRepository)>,
}

impl VcsMappings {
    /// An empty rule set.
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            rules: Vec::new(),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: MatchPolicy) {
        self.policy = policy;
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Appends a rule. Rules are consulted in registration order.
    pub fn register_mapping(&mut self, selector: ModuleSelector, repository: VcsRepository) {
        log::debug!("Mapping '{}' to '{}'.", selector, repository.url);
        self.rules.push((selector, repository));
    }

    /// Parses `selector` and registers the rule.
    pub fn with_module(
        &mut self,
        selector: &str,
        repository: VcsRepository,
    ) -> Result<(), CoordinateError> {
        let selector = selector.parse()?;
        self.register_mapping(selector, repository);
        Ok(())
    }

    /// The repository `module` maps to under the current policy.
    pub fn resolve(&self, module: &ModuleCoordinate) -> Option<&VcsRepository> {
        let mut candidates = self.rules.iter().filter(|(selector, _)| selector.matches(module));
        let chosen = match self.policy {
            MatchPolicy::FirstMatch => candidates.next(),
            // Reversed index so ties go to the earliest rule.
            MatchPolicy::MostSpecific => candidates
                .enumerate()
                .max_by_key(|(index, (selector, _))| {
                    (selector.specificity(), std::cmp::Reverse(*index))
                })
                .map(|(_, rule)| rule),
        };
        chosen.map(|(_, repository)| repository)
    }

    /// Where `module` should come from: a checkout if a rule matches, otherwise
    /// the normal artifact lookup.
    pub fn substitute(&self, module: &ModuleCoordinate) -> ResolutionSource {
        match self.resolve(module) {
            Some(repository) => {
                log::debug!("Substituting '{}' with a checkout of '{}'.", module, repository.url);
                ResolutionSource::Checkout {
                    module: module.clone(),
                    repository: repository.clone(),
                }
            }
            None => ResolutionSource::Artifact(module.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings(policy: MatchPolicy) -> VcsMappings {
        let mut mappings = VcsMappings::new(policy);
        mappings.with_module("*", VcsRepository::git("https://example.org/mirror.git")).unwrap();
        mappings
            .with_module("org.sample:*", VcsRepository::git("https://example.org/sample.git"))
            .unwrap();
        mappings
            .with_module(
                "org.sample:utilities",
                VcsRepository::git("https://example.org/utilities.git")
                    .at(CheckoutRef::Tag("v1.2".to_string()))
                    .in_dir("lib"),
            )
            .unwrap();
        mappings
    }

    #[test]
    fn test_first_match_policy() {
        let mappings = mappings(MatchPolicy::FirstMatch);
        let module: ModuleCoordinate = "org.sample:utilities:1.0".parse().unwrap();
        assert_eq!(mappings.resolve(&module).unwrap().url, "https://example.org/mirror.git");
    }

    #[test]
    fn test_most_specific_policy() {
        let mappings = mappings(MatchPolicy::MostSpecific);
        let utilities: ModuleCoordinate = "org.sample:utilities".parse().unwrap();
        let other: ModuleCoordinate = "org.sample:other".parse().unwrap();
        let foreign: ModuleCoordinate = "com.acme:widgets".parse().unwrap();

        assert_eq!(
            mappings.resolve(&utilities).unwrap().url,
            "https://example.org/utilities.git"
        );
        assert_eq!(mappings.resolve(&other).unwrap().url, "https://example.org/sample.git");
        assert_eq!(mappings.resolve(&foreign).unwrap().url, "https://example.org/mirror.git");
    }

    #[test]
    fn test_most_specific_ties_go_to_earliest_rule() {
        let mut mappings = VcsMappings::new(MatchPolicy::MostSpecific);
        mappings.with_module("org.sample:*", VcsRepository::git("first")).unwrap();
        mappings.with_module("org.sample:*", VcsRepository::git("second")).unwrap();
        let module = ModuleCoordinate::new("org.sample", "core");
        assert_eq!(mappings.resolve(&module).unwrap().url, "first");
    }

    #[test]
    fn test_unmapped_module_uses_artifact_lookup() {
        let mut mappings = VcsMappings::default();
        mappings
            .with_module("org.sample:utilities", VcsRepository::git("https://example.org/u.git"))
            .unwrap();
        let module = ModuleCoordinate::new("org.sample", "numbers").with_version("2.0");
        assert_eq!(mappings.substitute(&module), ResolutionSource::Artifact(module.clone()));

        let mapped = ModuleCoordinate::new("org.sample", "utilities");
        assert!(matches!(mappings.substitute(&mapped), ResolutionSource::Checkout { .. }));
    }

    #[test]
    fn test_parsing() {
        let coordinate: ModuleCoordinate = "org.sample:utilities:1.0-SNAPSHOT".parse().unwrap();
        assert_eq!(coordinate.version.as_deref(), Some("1.0-SNAPSHOT"));
        assert_eq!(coordinate.to_string(), "org.sample:utilities:1.0-SNAPSHOT");
        assert!("utilities".parse::<ModuleCoordinate>().is_err());

        assert_eq!("*".parse::<ModuleSelector>().unwrap(), ModuleSelector::Any);
        assert_eq!(
            "org.sample:*".parse::<ModuleSelector>().unwrap(),
            ModuleSelector::Group("org.sample".to_string())
        );
        assert_eq!(
            "org.sample:*".parse::<ModuleSelector>().unwrap().to_string(),
            "org.sample:*"
        );
        assert!("org.sample".parse::<ModuleSelector>().is_err());
    }
}
