//! Build drivers
//!
//! Two ways to run the documentation tool against a generated project:
//!
//! - [`external::ExternalDriver`] spawns the tool and scrapes its output for
//!   phase markers while showing a live status line.
//! - [`api::run_api`] goes through a programmatic [`BuildApp`], which can be
//!   wrapped by an instrumentation adapter and reports lifecycle events.
//!
//! Both measure wall-clock time from right before the invocation to right
//! after it returned.

pub mod api;
pub mod external;

use crate::config::{BuildConfig, ToolSettings};
use crate::hooks::EventBus;
use crate::instrument::InstrumentArtifact;
use crate::report::Metrics;
use crate::stats::FileStats;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use api::{CommandApp, run_api};
pub use external::ExternalDriver;

/// Output folder name inside the generated source folder
pub const BUILD_DIR: &str = "_build";

/// Everything the documentation tool needs for one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub srcdir: PathBuf,
    pub outdir: PathBuf,
    pub builder: String,
    pub parallel: usize,
    pub debug: bool,
}

impl BuildRequest {
    pub fn new(srcdir: &Path, build: &BuildConfig) -> Self {
        Self {
            srcdir: srcdir.to_path_buf(),
            outdir: srcdir.join(BUILD_DIR),
            builder: build.builder.clone(),
            parallel: build.resolved_parallel(),
            debug: build.debug,
        }
    }

    /// `<args...> <parallel_flag> <n> <builder_flag> <builder> <srcdir> <outdir>`
    pub fn command_args(&self, tool: &ToolSettings) -> Vec<String> {
        let mut args = tool.args.clone();
        args.extend([
            tool.parallel_flag.clone(),
            self.parallel.to_string(),
            tool.builder_flag.clone(),
            self.builder.clone(),
            self.srcdir.display().to_string(),
            self.outdir.display().to_string(),
        ]);
        args
    }

    /// Entry page of an HTML build
    pub fn index_page(&self) -> PathBuf {
        self.outdir.join("index.html")
    }
}

/// Programmatic entry point of a documentation tool
#[async_trait]
pub trait BuildApp: Send {
    fn name(&self) -> &str;

    /// Build the project and return the tool's status code.
    ///
    /// Lifecycle events are reported through `events`.
    async fn build(&mut self, request: &BuildRequest, events: &mut EventBus) -> Result<i32>;

    /// Tool specific metrics of the last build
    fn extra_metrics(&mut self) -> Metrics {
        Metrics::new()
    }
}

/// Measured result of one build
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    pub status: i32,
    pub duration: Duration,
    /// Tool specific metrics
    pub extra: Metrics,
    pub artifact: InstrumentArtifact,
}

/// Build phase announced by an output marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reading,
    Writing,
}

/// First and last sighting of the phase markers in the tool output
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    reading_marker: String,
    writing_marker: String,
    reading: Option<(Duration, Duration)>,
    writing: Option<(Duration, Duration)>,
}

impl PhaseTracker {
    pub fn new(tool: &ToolSettings) -> Self {
        Self {
            reading_marker: tool.reading_marker.clone(),
            writing_marker: tool.writing_marker.clone(),
            reading: None,
            writing: None,
        }
    }

    /// Record a line seen at `at`; returns the phase if it starts with this line.
    pub fn observe(&mut self, line: &str, at: Duration) -> Option<Phase> {
        let mut started = None;

        if line.contains(&self.reading_marker) {
            if self.reading.is_none() {
                started = Some(Phase::Reading);
            }
            let first = self.reading.map_or(at, |(first, _)| first);
            self.reading = Some((first, at));
        }

        if line.contains(&self.writing_marker) {
            if self.writing.is_none() {
                started = Some(Phase::Writing);
            }
            let first = self.writing.map_or(at, |(first, _)| first);
            self.writing = Some((first, at));
        }

        started
    }

    /// Zero if the marker never appeared.
    pub fn reading_time(&self) -> Duration {
        self.reading.map_or(Duration::ZERO, |(first, last)| last.saturating_sub(first))
    }

    pub fn writing_time(&self) -> Duration {
        self.writing.map_or(Duration::ZERO, |(first, last)| last.saturating_sub(first))
    }

    pub fn phase_metrics(&self) -> Metrics {
        let mut metrics = Metrics::new();
        metrics.insert("reading time".to_string(), format!("{:.2} s", self.reading_time().as_secs_f64()));
        metrics.insert("writing time".to_string(), format!("{:.2} s", self.writing_time().as_secs_f64()));
        metrics
    }
}

/// Output file metrics shared by both drivers.
pub fn file_metrics(stats: &FileStats, duration: Duration) -> Metrics {
    let time_per_file = if stats.count == 0 {
        0.0
    } else {
        duration.as_secs_f64() / stats.count as f64
    };

    let mut metrics = Metrics::new();
    metrics.insert("folder size".to_string(), format!("{:.2} kB", stats.total_kb()));
    metrics.insert("# files".to_string(), stats.count.to_string());
    metrics.insert("avg file time".to_string(), format!("{time_per_file:.2} s"));
    metrics.insert("avg file size".to_string(), format!("{:.2} kB", stats.avg_kb()));
    metrics.insert("max file size".to_string(), format!("{:.2} kB", stats.max_kb()));
    metrics.insert("min file size".to_string(), format!("{:.2} kB", stats.min_kb()));
    metrics
}

pub(crate) fn log_file_stats(stats: &FileStats) {
    tracing::info!(files = stats.count, size_kb = format!("{:.2}", stats.total_kb()), "Build files");
    if let Some((path, size)) = &stats.max_file {
        tracing::info!(file = %path.display(), size_kb = format!("{:.2}", *size as f64 / 1024.0), "Largest file");
    }
    if let Some((path, size)) = &stats.min_file {
        tracing::info!(file = %path.display(), size_kb = format!("{:.2}", *size as f64 / 1024.0), "Smallest file");
    }
}

pub(crate) fn spawn_error(program: &str, error: std::io::Error) -> Error {
    Error::Build(format!("Failed to spawn {}: {}", program, error))
}

/// Open a built page with the platform opener. Failures are ignored.
pub fn open_browser(page: &Path) {
    let mut command = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut command = std::process::Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else {
        std::process::Command::new("xdg-open")
    };

    command
        .arg(page)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    if let Err(e) = command.spawn() {
        tracing::debug!(error = %e, page = %page.display(), "Could not open browser");
    }
}
