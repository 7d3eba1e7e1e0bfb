//! Session and run configuration
//!
//! [`SessionSettings`] holds everything that stays fixed for a whole benchmark
//! session: how to invoke the documentation tool, where temporary projects go,
//! which exports to write. It can be loaded from a `docbench.toml` file and is
//! then overridden by command line flags.
//!
//! [`BuildConfig`] and [`ProjectConfig`] are the two halves of a single run;
//! the matrix builder produces every combination of them.

use crate::instrument::Instrumentation;
use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name searched for by [`SessionSettings::discover`]
pub const SETTINGS_FILE: &str = "docbench.toml";

/// Environment variable carrying the plugin profile names to the tool
pub const PROFILING_ENV: &str = "NEEDS_PROFILING";

/// Scalar value of a project parameter
///
/// Values given on the command line are parsed opportunistically: anything
/// that reads as an integer becomes [`ParamValue::Int`], the rest stays a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Str(String),
}

impl ParamValue {
    /// Parse a raw command line value, falling back to a string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(value) => ParamValue::Int(value),
            Err(_) => ParamValue::Str(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            ParamValue::Str(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Str(value) => f.write_str(value),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

/// Project parameters of one run, in insertion order
pub type ProjectConfig = IndexMap<String, ParamValue>;

/// Build options of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Builder (output format) passed to the documentation tool
    pub builder: String,
    /// Parallel processes; 0 means "all cores"
    pub parallel: usize,
    /// Keep the generated source and build folders
    pub keep: bool,
    /// Open the build result in a browser
    pub browser: bool,
    /// Pass tool output through and skip phase detection
    pub debug: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            builder: "html".to_string(),
            parallel: 1,
            keep: false,
            browser: false,
            debug: false,
        }
    }
}

impl BuildConfig {
    /// Opening the result in a browser needs the output to survive the run.
    pub fn effective_keep(&self) -> bool {
        self.keep || self.browser
    }

    pub fn resolved_parallel(&self) -> usize {
        if self.parallel == 0 { num_cpus::get() } else { self.parallel }
    }
}

/// How the documentation tool is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverMode {
    /// Spawn the tool as a subprocess and scrape its output
    #[default]
    External,
    /// Call the tool through the programmatic [`crate::driver::BuildApp`] entry point
    Api,
}

/// Invocation contract of the external documentation tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Executable name or path
    pub program: String,
    /// Arguments placed before parallelism and builder flags
    pub args: Vec<String>,
    pub parallel_flag: String,
    pub builder_flag: String,
    /// Output line marking the source reading phase
    pub reading_marker: String,
    /// Output line marking the output writing phase
    pub writing_marker: String,
    /// Extra environment of the tool process
    pub env: BTreeMap<String, String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: "sphinx-build".to_string(),
            args: vec!["-a".to_string(), "-E".to_string(), "-v".to_string()],
            parallel_flag: "-j".to_string(),
            builder_flag: "-b".to_string(),
            reading_marker: "reading sources".to_string(),
            writing_marker: "writing output".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl ToolSettings {
    /// Ask the tool's plugins to profile the named parts, via [`PROFILING_ENV`].
    pub fn request_plugin_profiles(&mut self, names: &[String]) {
        if !names.is_empty() {
            self.env.insert(PROFILING_ENV.to_string(), names.join(","));
        }
    }
}

/// Dependency installation for generated projects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    pub enabled: bool,
    pub program: String,
    /// Arguments placed before the rendered dependency file
    pub args: Vec<String>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "pip".to_string(),
            args: vec!["install".to_string(), "-r".to_string()],
        }
    }
}

/// Settings shared by every run of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub tool: ToolSettings,
    pub installer: InstallerSettings,
    /// Additional named preset directories
    pub presets: BTreeMap<String, PathBuf>,
    /// Base folder for generated projects; must exist
    pub temp: Option<PathBuf>,
    /// Delimited result export
    pub csv: Option<PathBuf>,
    /// JSON result export
    pub json: Option<PathBuf>,
    /// Directory receiving profiling artifacts
    pub profile_dir: PathBuf,
    /// Viewer started for exported runtime profiles
    pub viewer: String,
    pub launch_viewers: bool,
    /// Derive visualisations (flamegraph, HTML) from profiling artifacts
    pub flamegraph: bool,
    /// Print profiling statistics after each run
    pub print_stats: bool,
    pub mode: DriverMode,
    /// Show a live status spinner while building
    pub show_progress: bool,
    #[serde(skip)]
    pub instrumentation: Instrumentation,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tool: ToolSettings::default(),
            installer: InstallerSettings::default(),
            presets: BTreeMap::new(),
            temp: None,
            csv: None,
            json: None,
            profile_dir: PathBuf::from("profile"),
            viewer: "snakeviz".to_string(),
            launch_viewers: false,
            flamegraph: false,
            print_stats: false,
            mode: DriverMode::External,
            show_progress: true,
            instrumentation: Instrumentation::None,
        }
    }
}

impl SessionSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file can not be read or is invalid TOML.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read settings file {}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))
    }

    /// Search for `docbench.toml` in the current directory and its parents.
    pub fn discover() -> Result<Option<Self>> {
        let mut current = std::env::current_dir().map_err(Error::Io)?;

        loop {
            let candidate = current.join(SETTINGS_FILE);
            if candidate.exists() {
                return Ok(Some(Self::from_toml_file(candidate)?));
            }

            if let Some(parent) = current.parent() {
                current = parent.to_path_buf();
            } else {
                break;
            }
        }

        Ok(None)
    }

    /// Mode actually used: any instrumentation adapter needs the in-process entry point.
    pub fn effective_mode(&self) -> DriverMode {
        if self.instrumentation.is_active() {
            DriverMode::Api
        } else {
            self.mode
        }
    }

    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::TempRootMissing`] for a temp root that does not exist and
    /// [`Error::Config`] for any other invalid value.
    pub fn validate(&self) -> Result<()> {
        if let Some(temp) = &self.temp
            && !temp.is_dir()
        {
            return Err(Error::TempRootMissing(temp.clone()));
        }

        if self.tool.program.trim().is_empty() {
            return Err(Error::Config("tool.program must not be empty".to_string()));
        }

        if self.tool.reading_marker.is_empty() || self.tool.writing_marker.is_empty() {
            return Err(Error::Config("phase markers must not be empty".to_string()));
        }

        if self.installer.enabled && self.installer.program.trim().is_empty() {
            return Err(Error::Config("installer.program must not be empty".to_string()));
        }

        Ok(())
    }
}
