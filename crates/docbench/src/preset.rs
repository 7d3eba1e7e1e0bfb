//! Project presets and per-run parameter validation
//!
//! A preset is a directory holding the template bundle of one synthetic
//! documentation corpus plus a declarative `performance.toml` descriptor.
//! [`PresetRegistry`] maps preset names to directories, [`ProjectPreset`]
//! loads and validates the descriptor, and [`ProjectEnv`] checks one project
//! configuration against it.

use crate::config::{ParamValue, ProjectConfig};
use crate::expr::Expr;
use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error as ThisError;

/// Descriptor file name inside a preset directory
pub const DESCRIPTOR_FILE: &str = "performance.toml";

/// Names of the presets shipped with the crate
pub const BUILTIN_PRESETS: &[&str] = &["basic", "events", "needs", "theme"];

/// Environment variable overriding the directory of the shipped presets
pub const PRESETS_DIR_ENV: &str = "DOCBENCH_PRESETS_DIR";

pub const CONFIG_TEMPLATE: &str = "conf.template";
pub const INDEX_TEMPLATE: &str = "index.template";
pub const PAGE_TEMPLATE: &str = "page.template";
pub const DEPENDENCY_TEMPLATE: &str = "requirements.template";

/// Parameters every descriptor must be able to resolve
pub const STRUCTURAL_PARAMETERS: [&str; 3] = ["pages", "folders", "depth"];

/// Parameter selecting a reference bundle
pub const REFERENCE_PARAMETER: &str = "ref";

/// Resolved filesystem location of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectLocation {
    /// Name as given by the caller
    pub name: String,
    /// Absolute preset directory
    pub path: PathBuf,
}

/// Named preset directories
#[derive(Debug, Clone)]
pub struct PresetRegistry {
    presets: BTreeMap<String, PathBuf>,
}

impl PresetRegistry {
    /// Registry of the presets shipped with the crate.
    pub fn builtin() -> Self {
        let root = std::env::var_os(PRESETS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("presets"));

        let presets = BUILTIN_PRESETS
            .iter()
            .map(|name| (name.to_string(), root.join(name)))
            .collect();

        Self { presets }
    }

    pub fn empty() -> Self {
        Self {
            presets: BTreeMap::new(),
        }
    }

    /// Add or replace named presets.
    pub fn with_presets(mut self, extra: &BTreeMap<String, PathBuf>) -> Self {
        for (name, path) in extra {
            self.presets.insert(name.clone(), path.clone());
        }
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    /// Resolve a project name or path.
    ///
    /// Registered names win over paths. Anything else must be an existing
    /// directory, which is made absolute.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`Error::UnknownProject`] if neither applies.
    pub fn resolve(&self, project: &str) -> Result<ProjectLocation> {
        if let Some(path) = self.presets.get(project) {
            if path.is_dir() {
                return Ok(ProjectLocation {
                    name: project.to_string(),
                    path: path.clone(),
                });
            }
            return Err(Error::UnknownProject(format!("{} (missing directory {})", project, path.display())));
        }

        let candidate = Path::new(project);
        if candidate.is_dir() {
            let path = std::path::absolute(candidate).map_err(Error::Io)?;
            return Ok(ProjectLocation {
                name: project.to_string(),
                path,
            });
        }

        Err(Error::UnknownProject(project.to_string()))
    }
}

impl Default for PresetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Default of a declared parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterDefault {
    Value(ParamValue),
    /// Must be supplied by the caller or a reference bundle
    Required,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDefault {
    Value(ParamValue),
    Marker { required: bool },
}

/// File names of the rendered project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub source_suffix: String,
    pub config_file: String,
    pub dependency_file: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            source_suffix: "rst".to_string(),
            config_file: "conf.py".to_string(),
            dependency_file: "requirements.txt".to_string(),
        }
    }
}

/// Delay handlers registered for in-process builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDelays {
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub names: Vec<String>,
}

fn default_delay_ms() -> u64 {
    100
}

impl EventDelays {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    parameters: IndexMap<String, RawDefault>,
    #[serde(default)]
    info: IndexMap<String, String>,
    #[serde(default)]
    references: IndexMap<String, IndexMap<String, ParamValue>>,
    #[serde(default)]
    layout: Layout,
    #[serde(default)]
    events: Option<EventDelays>,
}

/// Validated content of `performance.toml`
#[derive(Debug, Clone)]
pub struct ProjectDescriptor {
    pub parameters: IndexMap<String, ParameterDefault>,
    pub info: IndexMap<String, Expr>,
    pub references: IndexMap<String, ProjectConfig>,
    pub layout: Layout,
    pub events: Option<EventDelays>,
}

impl ProjectDescriptor {
    /// Parse descriptor text. `origin` only labels errors.
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidDescriptor {
            path: origin.to_path_buf(),
            reason,
        };

        let raw: RawDescriptor = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;

        let mut parameters = IndexMap::with_capacity(raw.parameters.len());
        for (name, default) in raw.parameters {
            let default = match default {
                RawDefault::Value(value) => ParameterDefault::Value(value),
                RawDefault::Marker { required: true } => ParameterDefault::Required,
                RawDefault::Marker { required: false } => {
                    return Err(invalid(format!(
                        "parameter '{name}' uses {{ required = false }}; give a default value instead"
                    )));
                }
            };
            parameters.insert(name, default);
        }

        let mut info = IndexMap::with_capacity(raw.info.len());
        for (name, source) in raw.info {
            let expr = Expr::parse(&source).map_err(|e| invalid(format!("info '{name}': {e}")))?;
            info.insert(name, expr);
        }

        if raw.layout.source_suffix.is_empty() || raw.layout.config_file.is_empty() {
            return Err(invalid("layout entries must not be empty".to_string()));
        }

        Ok(Self {
            parameters,
            info,
            references: raw.references,
            layout: raw.layout,
            events: raw.events,
        })
    }
}

/// A resolved preset with its loaded descriptor
#[derive(Debug, Clone)]
pub struct ProjectPreset {
    pub location: ProjectLocation,
    pub descriptor: ProjectDescriptor,
}

impl ProjectPreset {
    /// Load the descriptor of a resolved project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescriptor`] if the descriptor is missing or
    /// malformed. This only skips the affected run.
    pub fn load(location: &ProjectLocation) -> Result<Self> {
        let path = location.path.join(DESCRIPTOR_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| Error::InvalidDescriptor {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let descriptor = ProjectDescriptor::parse(&content, &path)?;

        Ok(Self {
            location: location.clone(),
            descriptor,
        })
    }

    pub fn name(&self) -> &str {
        &self.location.name
    }

    pub fn template_path(&self, template: &str) -> PathBuf {
        self.location.path.join(template)
    }
}

/// Page and index totals of the generated tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedCounts {
    pub page_amount: i64,
    pub index_amount: i64,
}

impl DerivedCounts {
    /// `page_amount = pages * sum(folders^k, k=0..=depth)`,
    /// `index_amount = 1 + sum(folders^k, k=1..=depth)`.
    ///
    /// Returns `None` on overflow.
    pub fn compute(pages: i64, folders: i64, depth: i64) -> Option<Self> {
        let folder_sum = if folders <= 1 {
            // every level holds `folders` entries
            depth.checked_mul(folders)?.checked_add(1)?
        } else {
            // overflows within 63 levels
            let mut level = 1i64;
            let mut sum = 1i64;
            for _ in 0..depth {
                level = level.checked_mul(folders)?;
                sum = sum.checked_add(level)?;
            }
            sum
        };

        Some(Self {
            page_amount: pages.checked_mul(folder_sum)?,
            index_amount: folder_sum,
        })
    }
}

/// Problem found while validating one project configuration
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    #[error("Parameter '{0}' is required but not given and has no default")]
    MissingParameter(String),

    #[error("Reference '{name}' does not exist. Available: {available}")]
    UnknownReference { name: String, available: String },

    #[error("Parameter '{name}' must be a non-negative integer, got '{value}'")]
    InvalidStructural { name: String, value: String },

    #[error("Derived page counts overflow for pages={pages}, folders={folders}, depth={depth}")]
    CountOverflow { pages: i64, folders: i64, depth: i64 },
}

/// Validation state of one project configuration
#[derive(Debug)]
pub struct ProjectEnv<'a> {
    preset: &'a ProjectPreset,
    requested: ProjectConfig,
    resolved: ProjectConfig,
    derived: Option<DerivedCounts>,
    errors: Vec<ConfigError>,
}

impl<'a> ProjectEnv<'a> {
    pub fn new(preset: &'a ProjectPreset, config: &ProjectConfig) -> Self {
        Self {
            preset,
            requested: config.clone(),
            resolved: ProjectConfig::new(),
            derived: None,
            errors: Vec::new(),
        }
    }

    /// Resolve defaults and check the configuration.
    ///
    /// Precedence: caller values, then the selected reference bundle, then
    /// declared defaults. Every problem is collected; see [`Self::errors`].
    pub fn config_is_valid(&mut self) -> bool {
        self.errors.clear();
        self.derived = None;

        let preset = self.preset;
        let descriptor = &preset.descriptor;
        let mut reference: Option<&ProjectConfig> = None;

        if let Some(name) = self.requested.get(REFERENCE_PARAMETER) {
            let name = name.to_string();
            match descriptor.references.get(&name) {
                Some(bundle) => reference = Some(bundle),
                None => {
                    let available = descriptor.references.keys().map(String::as_str).collect::<Vec<_>>();
                    self.errors.push(ConfigError::UnknownReference {
                        name,
                        available: if available.is_empty() {
                            "none".to_string()
                        } else {
                            available.join(", ")
                        },
                    });
                }
            }
        }

        let mut resolved = ProjectConfig::new();
        for (name, default) in &descriptor.parameters {
            let value = self
                .requested
                .get(name)
                .or_else(|| reference.and_then(|bundle| bundle.get(name)))
                .or(match default {
                    ParameterDefault::Value(value) => Some(value),
                    ParameterDefault::Required => None,
                });

            match value {
                Some(value) => {
                    resolved.insert(name.clone(), value.clone());
                }
                None => self.errors.push(ConfigError::MissingParameter(name.clone())),
            }
        }

        if let Some(bundle) = reference {
            for (name, value) in bundle {
                if !resolved.contains_key(name) && !self.requested.contains_key(name) {
                    resolved.insert(name.clone(), value.clone());
                }
            }
        }

        for (name, value) in &self.requested {
            if !resolved.contains_key(name) {
                resolved.insert(name.clone(), value.clone());
            }
        }

        let mut structural = [0i64; 3];
        for (slot, name) in structural.iter_mut().zip(STRUCTURAL_PARAMETERS) {
            match resolved.get(name) {
                Some(ParamValue::Int(value)) if *value >= 0 => *slot = *value,
                Some(other) => self.errors.push(ConfigError::InvalidStructural {
                    name: name.to_string(),
                    value: other.to_string(),
                }),
                None => {
                    if !self.errors.contains(&ConfigError::MissingParameter(name.to_string())) {
                        self.errors.push(ConfigError::MissingParameter(name.to_string()));
                    }
                }
            }
        }

        if self.errors.is_empty() {
            let [pages, folders, depth] = structural;
            match DerivedCounts::compute(pages, folders, depth) {
                Some(counts) => self.derived = Some(counts),
                None => self.errors.push(ConfigError::CountOverflow { pages, folders, depth }),
            }
        }

        self.resolved = resolved;
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ConfigError] {
        &self.errors
    }

    /// Configuration after defaults were applied.
    pub fn config(&self) -> &ProjectConfig {
        &self.resolved
    }

    /// Derived counts, available after a successful validation.
    pub fn derived(&self) -> Option<DerivedCounts> {
        self.derived
    }

    pub fn preset(&self) -> &'a ProjectPreset {
        self.preset
    }
}
