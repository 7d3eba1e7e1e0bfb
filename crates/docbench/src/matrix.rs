//! Test matrix expansion
//!
//! A session is the cross product of the requested projects, every
//! combination of build options and every combination of project parameter
//! overrides. [`ConfigMatrix`] resolves the projects up front and yields the
//! runs in a fixed order: project, then build configuration, then project
//! configuration.

use crate::config::{BuildConfig, ParamValue, ProjectConfig};
use crate::preset::{PresetRegistry, ProjectLocation};
use crate::{Error, Result};
use indexmap::IndexMap;
use itertools::Itertools;

/// Candidate values per project parameter, in order of first appearance
pub type Overrides = IndexMap<String, Vec<ParamValue>>;

/// Parse a flat `--key value` list into candidate values per key.
///
/// Values that read as integers become [`ParamValue::Int`].
///
/// # Errors
///
/// Returns [`Error::Config`] for a token that is not a `--key` where one is
/// expected, or for a key without value.
pub fn parse_overrides<S: AsRef<str>>(args: &[S]) -> Result<Overrides> {
    let mut overrides = Overrides::new();

    for pair in args.chunks(2) {
        let key = pair[0].as_ref();
        let name = key
            .strip_prefix("--")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Config(format!("Expected a --key for a project parameter, got '{key}'")))?;

        let value = pair
            .get(1)
            .ok_or_else(|| Error::Config(format!("Project parameter --{name} is missing a value")))?;

        overrides
            .entry(name.to_string())
            .or_default()
            .push(ParamValue::parse(value.as_ref()));
    }

    Ok(overrides)
}

/// Candidate build options of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub builders: Vec<String>,
    pub parallel: Vec<usize>,
    pub keep: bool,
    pub browser: bool,
    pub debug: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            builders: vec!["html".to_string()],
            parallel: vec![1],
            keep: false,
            browser: false,
            debug: false,
        }
    }
}

impl BuildOptions {
    /// Every builder with every parallelism degree, builders outermost.
    pub fn build_configs(&self) -> Vec<BuildConfig> {
        self.builders
            .iter()
            .cartesian_product(&self.parallel)
            .map(|(builder, parallel)| BuildConfig {
                builder: builder.clone(),
                parallel: *parallel,
                keep: self.keep,
                browser: self.browser,
                debug: self.debug,
            })
            .collect()
    }
}

/// Every combination of override values; a single empty configuration
/// without overrides.
pub fn project_configs(overrides: &Overrides) -> Vec<ProjectConfig> {
    if overrides.is_empty() {
        return vec![ProjectConfig::new()];
    }

    overrides
        .values()
        .map(|values| values.iter().cloned())
        .multi_cartesian_product()
        .map(|combination| overrides.keys().cloned().zip(combination).collect())
        .collect()
}

/// One planned run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    /// 1-based position in the session
    pub index: usize,
    pub project: ProjectLocation,
    pub build: BuildConfig,
    pub project_config: ProjectConfig,
}

/// All runs of a session
#[derive(Debug, Clone)]
pub struct ConfigMatrix {
    projects: Vec<ProjectLocation>,
    build_configs: Vec<BuildConfig>,
    project_configs: Vec<ProjectConfig>,
}

impl ConfigMatrix {
    /// Resolve every project and expand the option lists.
    ///
    /// # Errors
    ///
    /// Fails with the fatal [`Error::UnknownProject`] before anything is
    /// expanded if one project can not be resolved, and with
    /// [`Error::Config`] for empty option lists.
    pub fn new<S: AsRef<str>>(
        projects: &[S],
        registry: &PresetRegistry,
        options: &BuildOptions,
        overrides: &Overrides,
    ) -> Result<Self> {
        if projects.is_empty() {
            return Err(Error::Config("At least one project is needed".to_string()));
        }
        if options.builders.is_empty() || options.parallel.is_empty() {
            return Err(Error::Config("Builder and parallel lists must not be empty".to_string()));
        }

        let projects = projects
            .iter()
            .map(|project| registry.resolve(project.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            projects,
            build_configs: options.build_configs(),
            project_configs: project_configs(overrides),
        })
    }

    pub fn runs(&self) -> usize {
        self.projects.len() * self.build_configs.len() * self.project_configs.len()
    }

    pub fn projects(&self) -> &[ProjectLocation] {
        &self.projects
    }

    pub fn build_configs(&self) -> &[BuildConfig] {
        &self.build_configs
    }

    pub fn project_configs(&self) -> &[ProjectConfig] {
        &self.project_configs
    }

    pub fn iter(&self) -> impl Iterator<Item = RunConfiguration> + '_ {
        self.projects
            .iter()
            .cartesian_product(&self.build_configs)
            .cartesian_product(&self.project_configs)
            .enumerate()
            .map(|(i, ((project, build), project_config))| RunConfiguration {
                index: i + 1,
                project: project.clone(),
                build: build.clone(),
                project_config: project_config.clone(),
            })
    }
}
