//! Benchmarks for documentation builds
//!
//! This crate generates synthetic documentation projects of configurable size
//! from preset bundles, builds them with an external documentation tool over a
//! matrix of configurations, and compares timing and resource metrics of all
//! runs in one table.

pub mod config;
pub mod driver;
pub mod error;
pub mod expr;
pub mod generator;
pub mod hooks;
pub mod instrument;
pub mod matrix;
pub mod monitoring;
pub mod preset;
pub mod report;
pub mod runner;
pub mod stats;
pub mod viewers;

pub use config::{BuildConfig, DriverMode, ParamValue, ProjectConfig, SessionSettings, ToolSettings};
pub use driver::{BuildApp, BuildOutcome, BuildRequest, CommandApp, ExternalDriver, run_api};
pub use error::{Error, Result};
pub use generator::{ContentGenerator, GeneratedProject, PageCounter};
pub use hooks::{DelayHandler, EventBus, EventHandler};
pub use instrument::{InstrumentArtifact, InstrumentFlags, Instrumentation};
pub use matrix::{BuildOptions, ConfigMatrix, Overrides, RunConfiguration, parse_overrides};
pub use monitoring::{ResourceMonitor, ResourceSample, ResourceStats};
pub use preset::{PresetRegistry, ProjectEnv, ProjectPreset};
pub use report::{Metrics, ResultTable, RunResult, write_json};
pub use runner::{Session, SessionReport};
pub use viewers::launch_viewers;
