//! Session execution
//!
//! A [`Session`] runs every configuration of a [`ConfigMatrix`] strictly one
//! after another: validate, generate, optionally install dependencies, build,
//! export profiling artifacts, clean up. Invalid or failing configurations are
//! skipped; errors classified as fatal abort the session.

use crate::config::{BuildConfig, DriverMode, SessionSettings};
use crate::driver::{BuildOutcome, BuildRequest, CommandApp, ExternalDriver, open_browser, run_api};
use crate::generator::{ContentGenerator, GeneratedProject, PageCounter};
use crate::hooks::{DelayHandler, EventBus};
use crate::instrument::InstrumentArtifact;
use crate::instrument::calltree::{
    CALLTREE_EVENTS, CALLTREE_HTML, CALLTREE_PROFILE, aggregate_recorded, write_event_runtime,
};
use crate::instrument::memory::MEMORY_HTML;
use crate::matrix::{ConfigMatrix, RunConfiguration};
use crate::preset::{PresetRegistry, ProjectEnv, ProjectPreset};
use crate::report::html::{write_call_tree_html, write_memory_html};
use crate::report::{Metrics, ResultTable, RunResult, overall_runtime, write_json};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Outcome of a whole session
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Completed runs, in execution order
    pub results: Vec<RunResult>,
    /// Configurations that were skipped
    pub skipped: usize,
    /// Every file written by the session
    pub artifacts: Vec<PathBuf>,
    /// Exported runtime profiles, for viewers
    pub runtime_profiles: Vec<PathBuf>,
    /// Static HTML reports derived from profiles
    pub html_reports: Vec<PathBuf>,
}

impl SessionReport {
    pub fn overall_runtime(&self) -> f64 {
        overall_runtime(&self.results)
    }

    pub fn table(&self) -> ResultTable {
        ResultTable::from_results(&self.results)
    }
}

/// Locate `program` on the `PATH`, or check an explicit path.
///
/// # Errors
///
/// Returns the fatal [`Error::MissingExecutable`] if it can not be found.
pub fn locate_executable(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|e| Error::MissingExecutable {
        name: program.to_string(),
        reason: e.to_string(),
    })
}

/// Benchmark session over one matrix
pub struct Session {
    settings: SessionSettings,
    registry: PresetRegistry,
    generator: ContentGenerator,
    counter: PageCounter,
}

impl Session {
    /// Session with the builtin presets plus the presets named in `settings`.
    pub fn new(settings: SessionSettings) -> Self {
        let registry = PresetRegistry::builtin().with_presets(&settings.presets);
        let generator = ContentGenerator::new(settings.temp.clone());

        Self {
            settings,
            registry,
            generator,
            counter: PageCounter::new(),
        }
    }

    pub fn with_registry(mut self, registry: PresetRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &PresetRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Page counter shared by all runs of this session
    pub fn page_counter(&self) -> &PageCounter {
        &self.counter
    }

    /// Checks that must pass before the first run starts.
    ///
    /// # Errors
    ///
    /// Invalid settings, a missing temp root or a missing tool or installer
    /// executable. All of them are fatal.
    pub fn preflight(&self) -> Result<()> {
        self.settings.validate()?;

        let tool = locate_executable(&self.settings.tool.program)?;
        tracing::debug!(path = %tool.display(), "Found build tool");

        if self.settings.installer.enabled {
            let installer = locate_executable(&self.settings.installer.program)?;
            tracing::debug!(path = %installer.display(), "Found installer");
        }

        Ok(())
    }

    /// Run every configuration of `matrix`.
    ///
    /// Result exports configured in the settings are written at the end.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned; see [`Error::is_fatal`].
    pub async fn run(&mut self, matrix: &ConfigMatrix) -> Result<SessionReport> {
        self.preflight()?;

        let total = matrix.runs();
        tracing::info!(
            runs = total,
            mode = ?self.settings.effective_mode(),
            adapter = self.settings.instrumentation.label(),
            "Running {} test configurations",
            total
        );

        let mut report = SessionReport::default();
        for run in matrix.iter() {
            tracing::info!(run = run.index, total, project = %run.project.name, "Run {}/{}", run.index, total);

            match self.run_one(&run, &mut report).await {
                Ok(Some(mut result)) => {
                    result.index = report.results.len() + 1;
                    tracing::info!(
                        run = run.index,
                        runtime = format!("{:.2}", result.runtime),
                        "Run finished"
                    );
                    report.results.push(result);
                }
                Ok(None) => report.skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(run = run.index, project = %run.project.name, error = %e, "Skipping this run");
                    report.skipped += 1;
                }
            }
        }

        self.export_results(&mut report);

        tracing::info!(
            completed = report.results.len(),
            skipped = report.skipped,
            overall = format!("{:.2}", report.overall_runtime()),
            "Session finished"
        );
        Ok(report)
    }

    /// `Ok(None)` for a configuration that failed validation.
    async fn run_one(&mut self, run: &RunConfiguration, report: &mut SessionReport) -> Result<Option<RunResult>> {
        let preset = ProjectPreset::load(&run.project)?;

        let mut env = ProjectEnv::new(&preset, &run.project_config);
        if !env.config_is_valid() {
            for problem in env.errors() {
                tracing::error!(run = run.index, project = preset.name(), "{}", problem);
            }
            tracing::warn!(run = run.index, "Errors in configuration. Skipping this run");
            return Ok(None);
        }

        let project = self.generator.generate(&env, &run.build, &mut self.counter)?;

        let outcome = self.build(&preset, &project, &run.build).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = project.cleanup() {
                    tracing::debug!(error = %cleanup, "Could not remove project folder");
                }
                return Err(e);
            }
        };

        if run.build.browser {
            open_browser(&BuildRequest::new(&project.root, &run.build).index_page());
        }
        if let Err(e) = project.cleanup() {
            tracing::warn!(
                run = run.index,
                path = %project.root.display(),
                error = %e,
                "Could not remove project folder"
            );
        }

        let BuildOutcome {
            status,
            duration,
            extra,
            artifact,
        } = outcome;

        if let Err(e) = self.export_artifact(artifact, report) {
            tracing::warn!(run = run.index, error = %e, "Could not export profiling artifacts");
        }

        let mut config: Metrics = env.config().iter().map(|(k, v)| (k.clone(), v.to_string())).collect();
        config.insert("parallel".to_string(), run.build.parallel.to_string());
        config.insert("builder".to_string(), run.build.builder.clone());

        let mut info = project.info.clone();
        info.insert("exit status".to_string(), status.to_string());

        Ok(Some(RunResult {
            index: run.index,
            project: run.project.name.clone(),
            runtime: duration.as_secs_f64(),
            config,
            info,
            extra,
        }))
    }

    async fn build(
        &self,
        preset: &ProjectPreset,
        project: &GeneratedProject,
        build: &BuildConfig,
    ) -> Result<BuildOutcome> {
        let settings = &self.settings;

        if settings.installer.enabled {
            match project.install_dependencies(&settings.installer, build.debug).await {
                Ok(0) => {}
                Ok(status) => tracing::warn!(status, "Dependency installation failed"),
                Err(e) => tracing::warn!(error = %e, "Dependency installation failed"),
            }
        }

        let request = BuildRequest::new(&project.root, build);
        match settings.effective_mode() {
            DriverMode::External => {
                ExternalDriver::new(settings.tool.clone())
                    .with_progress(settings.show_progress)
                    .run(&request)
                    .await
            }
            DriverMode::Api => {
                let mut events = EventBus::new();
                if let Some(delays) = &preset.descriptor.events {
                    DelayHandler::register_all(&mut events, delays);
                }

                let mut app = CommandApp::new(settings.tool.clone()).with_progress(settings.show_progress);
                run_api(&mut app, &request, &settings.instrumentation, &mut events).await
            }
        }
    }

    fn export_artifact(&self, artifact: InstrumentArtifact, report: &mut SessionReport) -> Result<()> {
        let settings = &self.settings;
        let profile_dir = &settings.profile_dir;

        match artifact {
            InstrumentArtifact::None => {}
            InstrumentArtifact::Runtime(profile) => {
                let written = profile.write(profile_dir, settings.flamegraph)?;
                if let Some(json) = written.first() {
                    report.runtime_profiles.push(json.clone());
                }
                report.artifacts.extend(written);

                if settings.print_stats {
                    for line in profile.stats_lines() {
                        tracing::info!("{}", line);
                    }
                }
            }
            InstrumentArtifact::Memory(profile) => {
                if let Some(path) = &profile.path {
                    report.artifacts.push(path.clone());
                }
                if settings.flamegraph {
                    let html = profile_dir.join(MEMORY_HTML);
                    write_memory_html(&profile.samples, &profile.stats, &html)?;
                    push_report(report, html);
                }

                if settings.print_stats {
                    for line in profile.summary_lines() {
                        tracing::info!("{}", line);
                    }
                }
            }
            InstrumentArtifact::CallTree(session) => {
                let path = profile_dir.join(CALLTREE_PROFILE);
                session.write(&path)?;
                report.artifacts.push(path);

                let events = aggregate_recorded(&session);
                let events_path = profile_dir.join(CALLTREE_EVENTS);
                write_event_runtime(&events, &events_path)?;
                report.artifacts.push(events_path);

                let html = profile_dir.join(CALLTREE_HTML);
                write_call_tree_html(&session, &events, &html)?;
                push_report(report, html);

                if settings.print_stats {
                    for (group, entries) in events.iter().filter(|(_, entries)| !entries.is_empty()) {
                        let total: f64 = entries.values().sum();
                        tracing::info!("{group}: {total:.3} s");
                    }
                }
            }
        }

        Ok(())
    }

    /// Failures are logged; the results stay available in the report.
    fn export_results(&self, report: &mut SessionReport) {
        if let Some(path) = &self.settings.csv {
            match report.table().write_csv(path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Results written");
                    report.artifacts.push(path.clone());
                }
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Could not write CSV results"),
            }
        }

        if let Some(path) = &self.settings.json {
            match write_json(&report.results, path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Results written");
                    report.artifacts.push(path.clone());
                }
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Could not write JSON results"),
            }
        }
    }
}

fn push_report(report: &mut SessionReport, html: PathBuf) {
    tracing::info!(path = %html.display(), "Report written");
    report.artifacts.push(html.clone());
    report.html_reports.push(html);
}

/// Path of `path` relative to the working directory, for display.
pub fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| pathdiff::diff_paths(path, cwd))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}
