//! Out-of-process builds
//!
//! The tool is spawned as a child process. Its standard output is read line by
//! line to find the phase markers, while a ticker refreshes the status spinner
//! and a [`ResourceMonitor`] samples the child's memory.

use super::{BuildOutcome, BuildRequest, Phase, PhaseTracker, file_metrics, log_file_stats, spawn_error};
use crate::config::ToolSettings;
use crate::monitoring::{ResourceMonitor, ResourceStats, format_bytes};
use crate::report::Metrics;
use crate::stats::FileStats;
use crate::{Error, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// Sampling interval of the child's resources
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Refresh interval of the status line
const STATUS_INTERVAL: Duration = Duration::from_millis(50);

const STATUS_MESSAGE: &str = "Building documentation";

/// A running tool process
pub(crate) struct ToolProcess {
    child: Child,
    output: Option<BufReader<ChildStdout>>,
    line: Vec<u8>,
    tracker: PhaseTracker,
    started: Instant,
    monitor: ResourceMonitor,
    spinner: Option<ProgressBar>,
    ticker: tokio::time::Interval,
}

/// What is left of a tool process after it exited
pub(crate) struct ToolExit {
    pub status: i32,
    pub duration: Duration,
    pub phases: PhaseTracker,
    pub resources: ResourceStats,
}

impl ToolProcess {
    /// Spawn the tool for `request`.
    ///
    /// In debug mode output is passed through and no phases are detected.
    pub(crate) async fn spawn(tool: &ToolSettings, request: &BuildRequest, show_progress: bool) -> Result<Self> {
        let args = request.command_args(tool);
        if request.debug {
            tracing::debug!(call = %format!("{} {}", tool.program, args.join(" ")), "Calling build tool");
        }

        let mut command = Command::new(&tool.program);
        command
            .args(&args)
            .envs(&tool.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if request.debug {
            command.stdout(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped());
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| spawn_error(&tool.program, e))?;

        let output = child.stdout.take().map(BufReader::new);

        let monitor = match child.id() {
            Some(pid) => ResourceMonitor::for_pid(pid),
            None => ResourceMonitor::new(),
        };
        monitor.start(MONITOR_INTERVAL).await;

        let spinner = (show_progress && !request.debug).then(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg:.cyan} [{elapsed_precise}]")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message(STATUS_MESSAGE);
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        });

        Ok(Self {
            child,
            output,
            line: Vec::new(),
            tracker: PhaseTracker::new(tool),
            started,
            monitor,
            spinner,
            ticker: tokio::time::interval(STATUS_INTERVAL),
        })
    }

    /// Read output until the next phase starts.
    ///
    /// Returns `None` once the output is exhausted.
    pub(crate) async fn next_phase(&mut self) -> Option<Phase> {
        let output = self.output.as_mut()?;

        loop {
            tokio::select! {
                line = read_line(output, &mut self.line) => match line {
                    Ok(Some(line)) => {
                        if let Some(phase) = self.tracker.observe(&line, self.started.elapsed()) {
                            tracing::debug!(?phase, elapsed = ?self.started.elapsed(), "Build phase started");
                            return Some(phase);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read build tool output");
                        break;
                    }
                },
                _ = self.ticker.tick() => {
                    if let Some(spinner) = &self.spinner {
                        spinner.set_message(format!(
                            "{} {:.2} s",
                            STATUS_MESSAGE,
                            self.started.elapsed().as_secs_f64()
                        ));
                    }
                }
            }
        }

        self.output = None;
        None
    }

    /// Drain remaining output and wait for the process to exit.
    pub(crate) async fn finish(mut self) -> Result<ToolExit> {
        while self.next_phase().await.is_some() {}

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::Build(format!("Failed to wait for build tool: {}", e)))?;
        let duration = self.started.elapsed();

        let samples = self.monitor.stop().await;
        if let Some(spinner) = &self.spinner {
            spinner.finish_and_clear();
        }

        Ok(ToolExit {
            // Terminated by a signal
            status: status.code().unwrap_or(-1),
            duration,
            phases: self.tracker,
            resources: ResourceMonitor::calculate_stats(&samples),
        })
    }
}

/// Next output line, decoded lossily; `None` at end of output.
///
/// Partial lines stay in `buf` when the read is cancelled, so the next call
/// continues where this one stopped.
async fn read_line(output: &mut BufReader<ChildStdout>, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    let read = output.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }

    let line = String::from_utf8_lossy(buf).trim_end_matches(['\n', '\r']).to_string();
    buf.clear();
    Ok(Some(line))
}

impl ToolExit {
    /// Phase times, output file statistics and peak memory.
    pub(crate) fn metrics(&self, output: &FileStats) -> Metrics {
        let mut metrics = self.phases.phase_metrics();
        metrics.extend(file_metrics(output, self.duration));
        metrics.insert("peak memory".to_string(), format_bytes(self.resources.peak_memory_bytes));
        metrics
    }
}

/// Output file statistics of a finished build; empty if nothing was written.
pub(crate) fn output_stats(request: &BuildRequest) -> Result<FileStats> {
    if !request.outdir.is_dir() {
        return Ok(FileStats::default());
    }
    let stats = FileStats::collect(&request.outdir, &[])?;
    log_file_stats(&stats);
    Ok(stats)
}

/// Driver spawning the documentation tool as a subprocess
#[derive(Debug, Clone)]
pub struct ExternalDriver {
    tool: ToolSettings,
    show_progress: bool,
}

impl ExternalDriver {
    pub fn new(tool: ToolSettings) -> Self {
        Self {
            tool,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Build `request` and measure it.
    ///
    /// A non-zero exit status is reported in the outcome, not as an error.
    pub async fn run(&self, request: &BuildRequest) -> Result<BuildOutcome> {
        let process = ToolProcess::spawn(&self.tool, request, self.show_progress).await?;
        let exit = process.finish().await?;

        let output = output_stats(request)?;
        let extra = exit.metrics(&output);

        tracing::info!(
            status = exit.status,
            duration = format!("{:.2}", exit.duration.as_secs_f64()),
            reading = format!("{:.2}", exit.phases.reading_time().as_secs_f64()),
            writing = format!("{:.2}", exit.phases.writing_time().as_secs_f64()),
            "Build finished"
        );
        if exit.status != 0 {
            tracing::warn!(status = exit.status, "Build tool returned a non-zero status");
        }

        Ok(BuildOutcome {
            status: exit.status,
            duration: exit.duration,
            extra,
            artifact: Default::default(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Stand-in tool: prints phase markers and writes two output files.
    /// Arguments follow the default layout, so `$9` is the output folder.
    fn fake_tool(dir: &Path, exit_code: i32) -> ToolSettings {
        let script = dir.join("fake-build");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 echo \"Running fake build\"\n\
                 echo \"reading sources... [ 50%] page_0\"\n\
                 sleep 0.2\n\
                 echo \"reading sources... [100%] page_1\"\n\
                 mkdir -p \"$9\"\n\
                 printf '%s' '<html>index</html>' > \"$9/index.html\"\n\
                 printf '%s' '<html></html>' > \"$9/page_0.html\"\n\
                 echo \"writing output... [100%] page_1\"\n\
                 exit {exit_code}\n"
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        ToolSettings {
            program: script.display().to_string(),
            ..Default::default()
        }
    }

    fn request(dir: &Path) -> BuildRequest {
        let srcdir = dir.join("src");
        fs::create_dir_all(&srcdir).unwrap();
        BuildRequest::new(&srcdir, &BuildConfig::default())
    }

    #[tokio::test]
    async fn test_external_build_collects_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), 0);
        let request = request(dir.path());

        let outcome = ExternalDriver::new(tool).with_progress(false).run(&request).await.unwrap();

        assert_eq!(outcome.status, 0);
        assert!(outcome.duration >= Duration::from_millis(200));
        assert_eq!(outcome.extra["# files"], "2");
        assert_ne!(outcome.extra["reading time"], "0.00 s");
        assert_eq!(outcome.extra["writing time"], "0.00 s");
        assert!(outcome.extra.contains_key("peak memory"));
        assert_eq!(outcome.extra.keys().next().map(String::as_str), Some("reading time"));
    }

    #[tokio::test]
    async fn test_undecodable_output_keeps_build_running() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("latin1-build");
        fs::write(
            &script,
            "#!/bin/sh\n\
             printf 'reading sources... caf\\351\\n'\n\
             sleep 0.1\n\
             echo \"reading sources... [100%] page_1\"\n\
             echo \"writing output... [ 50%] page_0\"\n\
             sleep 0.1\n\
             echo \"writing output... [100%] page_1\"\n\
             exit 0\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let tool = ToolSettings {
            program: script.display().to_string(),
            ..Default::default()
        };
        let request = request(dir.path());

        let outcome = ExternalDriver::new(tool).with_progress(false).run(&request).await.unwrap();

        assert_eq!(outcome.status, 0);
        assert_ne!(outcome.extra["reading time"], "0.00 s");
        assert_ne!(outcome.extra["writing time"], "0.00 s");
    }

    #[tokio::test]
    async fn test_non_zero_status_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), 3);
        let request = request(dir.path());

        let outcome = ExternalDriver::new(tool).with_progress(false).run(&request).await.unwrap();
        assert_eq!(outcome.status, 3);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ToolSettings {
            program: dir.path().join("missing-tool").display().to_string(),
            ..Default::default()
        };
        let request = request(dir.path());

        let err = ExternalDriver::new(tool).with_progress(false).run(&request).await.unwrap_err();
        assert!(matches!(err, Error::Build(_)));
    }
}
