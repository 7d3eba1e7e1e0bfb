//! In-process builds
//!
//! [`run_api`] calls a [`BuildApp`] directly, optionally wrapped by an
//! instrumentation adapter. [`CommandApp`] is the shipped entry point: it drives
//! the tool binary and reports the build lifecycle on the event bus, so delay
//! handlers and the call-tree adapter see the same events an embedded tool
//! would fire.

use super::external::{ToolExit, ToolProcess, output_stats};
use super::{BuildApp, BuildOutcome, BuildRequest, Phase, file_metrics};
use crate::Result;
use crate::config::ToolSettings;
use crate::hooks::EventBus;
use crate::instrument::Instrumentation;
use crate::monitoring::format_bytes;
use crate::report::Metrics;
use async_trait::async_trait;
use std::time::Instant;

/// Entry point driving the documentation tool binary
pub struct CommandApp {
    tool: ToolSettings,
    show_progress: bool,
    last_exit: Option<ToolExit>,
}

impl CommandApp {
    pub fn new(tool: ToolSettings) -> Self {
        Self {
            tool,
            show_progress: true,
            last_exit: None,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    fn phase_event(phase: Phase) -> &'static str {
        match phase {
            Phase::Reading => "env-before-read-docs",
            Phase::Writing => "env-updated",
        }
    }
}

#[async_trait]
impl BuildApp for CommandApp {
    fn name(&self) -> &str {
        &self.tool.program
    }

    async fn build(&mut self, request: &BuildRequest, events: &mut EventBus) -> Result<i32> {
        events.emit("config-inited").await?;
        events.emit("builder-inited").await?;

        let mut process = ToolProcess::spawn(&self.tool, request, self.show_progress).await?;
        while let Some(phase) = process.next_phase().await {
            events.emit(Self::phase_event(phase)).await?;
        }
        let exit = process.finish().await?;

        events.emit("build-finished").await?;

        let status = exit.status;
        self.last_exit = Some(exit);
        Ok(status)
    }

    fn extra_metrics(&mut self) -> Metrics {
        let Some(exit) = self.last_exit.take() else {
            return Metrics::new();
        };
        let mut metrics = exit.phases.phase_metrics();
        metrics.insert("peak memory".to_string(), format_bytes(exit.resources.peak_memory_bytes));
        metrics
    }
}

/// Build through `app` under `instrumentation` and measure it.
///
/// The duration covers the adapter as well, exactly what an embedding caller
/// would observe around its own `build()` call.
pub async fn run_api(
    app: &mut dyn BuildApp,
    request: &BuildRequest,
    instrumentation: &Instrumentation,
    events: &mut EventBus,
) -> Result<BuildOutcome> {
    tracing::debug!(app = app.name(), adapter = instrumentation.label(), "Building in-process");

    let started = Instant::now();
    let (status, artifact) = instrumentation.wrap(app, request, events).await?;
    let duration = started.elapsed();

    let output = output_stats(request)?;
    let mut extra = app.extra_metrics();
    extra.extend(file_metrics(&output, duration));

    tracing::info!(
        status,
        duration = format!("{:.2}", duration.as_secs_f64()),
        events = events.emitted().len(),
        "Build finished"
    );
    if status != 0 {
        tracing::warn!(status, "Build returned a non-zero status");
    }

    Ok(BuildOutcome {
        status,
        duration,
        extra,
        artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::hooks::DelayHandler;
    use crate::instrument::InstrumentArtifact;
    use crate::instrument::calltree::aggregate_recorded;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    /// Writes a fixed output tree and fires a few lifecycle events.
    struct StaticSite {
        status: i32,
    }

    #[async_trait]
    impl BuildApp for StaticSite {
        fn name(&self) -> &str {
            "static-site"
        }

        async fn build(&mut self, request: &BuildRequest, events: &mut EventBus) -> Result<i32> {
            events.emit("builder-inited").await?;
            fs::create_dir_all(&request.outdir)?;
            fs::write(request.outdir.join("index.html"), "<html></html>")?;
            events.emit("build-finished").await?;
            Ok(self.status)
        }
    }

    fn request(dir: &Path) -> BuildRequest {
        BuildRequest::new(dir, &BuildConfig::default())
    }

    #[tokio::test]
    async fn test_run_without_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = StaticSite { status: 0 };
        let mut events = EventBus::new();

        let outcome = run_api(&mut app, &request(dir.path()), &Instrumentation::None, &mut events)
            .await
            .unwrap();

        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.extra["# files"], "1");
        assert!(matches!(outcome.artifact, InstrumentArtifact::None));
        assert_eq!(events.emitted(), &["builder-inited".to_string(), "build-finished".to_string()]);
    }

    #[tokio::test]
    async fn test_call_tree_adapter_keeps_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = StaticSite { status: 2 };
        let mut events = EventBus::new();
        events.connect("builder-inited", DelayHandler::new("builder-inited", Duration::from_millis(10)));

        let outcome = run_api(&mut app, &request(dir.path()), &Instrumentation::CallTree, &mut events)
            .await
            .unwrap();

        assert_eq!(outcome.status, 2);
        let InstrumentArtifact::CallTree(session) = outcome.artifact else {
            panic!("expected a call tree");
        };
        assert_eq!(session.program, "static-site");

        let runtime = aggregate_recorded(&session);
        let builder = &runtime["Event: builder-inited"];
        let waited = builder["docbench/delay: DelayHandler.wait_builder_inited"];
        assert!(waited >= 0.01);
        assert!(runtime["Event: build-finished"].is_empty());
    }

    #[tokio::test]
    async fn test_runtime_adapter_reports_cpu_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = StaticSite { status: 0 };
        let mut events = EventBus::new();

        let outcome = run_api(&mut app, &request(dir.path()), &Instrumentation::Runtime, &mut events)
            .await
            .unwrap();

        let InstrumentArtifact::Runtime(profile) = outcome.artifact else {
            panic!("expected a runtime profile");
        };
        assert!(profile.wall_seconds >= 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_app_reports_lifecycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-build");
        fs::write(
            &script,
            "#!/bin/sh\n\
             echo \"reading sources... [100%] index\"\n\
             echo \"writing output... [100%] index\"\n\
             echo \"writing output... [100%] done\"\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let tool = ToolSettings {
            program: script.display().to_string(),
            ..Default::default()
        };
        let mut app = CommandApp::new(tool).with_progress(false);
        let mut events = EventBus::new();
        let srcdir = dir.path().join("src");
        fs::create_dir_all(&srcdir).unwrap();

        let outcome = run_api(&mut app, &request(&srcdir), &Instrumentation::None, &mut events)
            .await
            .unwrap();

        assert_eq!(outcome.status, 0);
        assert_eq!(
            events.emitted(),
            &[
                "config-inited".to_string(),
                "builder-inited".to_string(),
                "env-before-read-docs".to_string(),
                "env-updated".to_string(),
                "build-finished".to_string(),
            ]
        );
        assert!(outcome.extra.contains_key("reading time"));
        assert!(outcome.extra.contains_key("peak memory"));
        assert_eq!(outcome.extra["# files"], "0");
    }
}
