//! Lifecycle events of a documentation build
//!
//! In-process builds report their progress through an [`EventBus`]. Handlers
//! subscribe to named lifecycle events; the call-tree adapter asks the bus to
//! record a frame for every emission so time spent inside each event can be
//! attributed to the handlers that ran.

use crate::Result;
use crate::instrument::calltree::{CallTreeSession, Frame};
use crate::preset::EventDelays;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Lifecycle events known to the reporting layer
pub const EVENTS: [&str; 18] = [
    "builder-inited",
    "config-inited",
    "env-get-outdated",
    "env-purge-doc",
    "env-before-read-docs",
    "source-read",
    "object-description-transform",
    "doctree-read",
    "missing-reference",
    "warn-missing-reference",
    "doctree-resolved",
    "env-merge-info",
    "env-updated",
    "env-check-consistency",
    "html-collect-pages",
    "html-page-context",
    "linkcheck-process-uri",
    "build-finished",
];

/// Class name used for recorded emitter frames
pub const EMITTER_CLASS: &str = "EventBus";

const EMITTER_SOURCE: &str = "docbench/hooks.rs";

pub fn is_known_event(event: &str) -> bool {
    EVENTS.contains(&event)
}

/// `source-read` becomes `emit_source_read`
pub fn emitter_function(event: &str) -> String {
    format!("emit_{}", event.replace('-', "_"))
}

/// Subscriber of lifecycle events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Function name shown in call trees
    fn name(&self) -> &str;

    fn class_name(&self) -> Option<&str> {
        None
    }

    /// Short source location shown in call trees
    fn source(&self) -> &str {
        "docbench"
    }

    async fn handle(&self, event: &str) -> Result<()>;
}

/// Handler that waits a fixed time whenever its event fires
#[derive(Debug, Clone)]
pub struct DelayHandler {
    event: String,
    delay: Duration,
    name: String,
}

impl DelayHandler {
    pub fn new(event: impl Into<String>, delay: Duration) -> Self {
        let event = event.into();
        let name = format!("wait_{}", event.replace('-', "_"));
        Self { event, delay, name }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Register one handler per configured event name.
    pub fn register_all(bus: &mut EventBus, delays: &EventDelays) {
        for event in &delays.names {
            bus.connect(event, Self::new(event.clone(), delays.delay()));
        }
    }
}

#[async_trait]
impl EventHandler for DelayHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> Option<&str> {
        Some("DelayHandler")
    }

    fn source(&self) -> &str {
        "docbench/delay"
    }

    async fn handle(&self, _event: &str) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[derive(Debug)]
struct FrameRecorder {
    started: Instant,
    start_time: f64,
    frames: Vec<Frame>,
}

/// Dispatcher of lifecycle events
#[derive(Default)]
pub struct EventBus {
    handlers: IndexMap<String, Vec<Box<dyn EventHandler>>>,
    emitted: Vec<String>,
    recorder: Option<FrameRecorder>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .field("emitted", &self.emitted.len())
            .field("recording", &self.recorder.is_some())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, event: &str, handler: impl EventHandler + 'static) {
        if !is_known_event(event) {
            tracing::warn!(event, "Handler registered for an unknown event");
        }
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, Vec::len)
    }

    /// Events emitted so far, in order.
    pub fn emitted(&self) -> &[String] {
        &self.emitted
    }

    /// Call every handler of `event` in registration order.
    ///
    /// Returns the number of handlers called. The first failing handler
    /// aborts the emission.
    pub async fn emit(&mut self, event: &str) -> Result<usize> {
        tracing::debug!(event, "Emitting event");
        self.emitted.push(event.to_string());

        let started = Instant::now();
        let mut handler_frames = Vec::new();

        if let Some(handlers) = self.handlers.get(event) {
            for handler in handlers {
                let handler_started = Instant::now();
                handler.handle(event).await?;
                handler_frames.push(Frame::new(
                    handler.name(),
                    handler.class_name(),
                    handler.source(),
                    handler_started.elapsed(),
                ));
            }
        }

        let called = handler_frames.len();

        if let Some(recorder) = &mut self.recorder {
            let elapsed = started.elapsed();
            let dispatch = Frame::new("emit", Some(EMITTER_CLASS), EMITTER_SOURCE, elapsed).with_children(handler_frames);
            let emitter =
                Frame::new(&emitter_function(event), Some(EMITTER_CLASS), EMITTER_SOURCE, elapsed).with_children(vec![dispatch]);
            recorder.frames.push(emitter);
        }

        Ok(called)
    }

    /// Record a frame for every following emission.
    pub fn start_recording(&mut self) {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        self.recorder = Some(FrameRecorder {
            started: Instant::now(),
            start_time,
            frames: Vec::new(),
        });
    }

    /// Stop recording and wrap the recorded frames into a session rooted at `program`.
    pub fn finish_recording(&mut self, program: &str) -> Option<CallTreeSession> {
        let recorder = self.recorder.take()?;
        let duration = recorder.started.elapsed();
        let root = Frame::new("build", Some("BuildApp"), "docbench/driver", duration).with_children(recorder.frames);

        Some(CallTreeSession {
            start_time: recorder.start_time,
            duration: duration.as_secs_f64(),
            program: program.to_string(),
            root_frame: root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            "count"
        }

        async fn handle(&self, _event: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_emitter_function_name() {
        assert_eq!(emitter_function("env-before-read-docs"), "emit_env_before_read_docs");
        assert!(is_known_event("build-finished"));
        assert!(!is_known_event("build-started"));
    }

    #[tokio::test]
    async fn test_emit_calls_registered_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();
        bus.connect(
            "source-read",
            Counter {
                calls: Arc::clone(&calls),
            },
        );
        bus.connect(
            "source-read",
            Counter {
                calls: Arc::clone(&calls),
            },
        );

        assert_eq!(bus.emit("source-read").await.unwrap(), 2);
        assert_eq!(bus.emit("build-finished").await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.emitted(), &["source-read".to_string(), "build-finished".to_string()]);
    }

    #[tokio::test]
    async fn test_delay_handlers_from_preset() {
        let delays = EventDelays {
            delay_ms: 20,
            names: vec!["config-inited".to_string(), "build-finished".to_string()],
        };
        let mut bus = EventBus::new();
        DelayHandler::register_all(&mut bus, &delays);

        assert_eq!(bus.handler_count("config-inited"), 1);
        assert_eq!(bus.handler_count("build-finished"), 1);

        let started = Instant::now();
        bus.emit("config-inited").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_recording_builds_frame_tree() {
        let mut bus = EventBus::new();
        bus.connect("builder-inited", DelayHandler::new("builder-inited", Duration::from_millis(5)));

        bus.emit("config-inited").await.unwrap();
        bus.start_recording();
        bus.emit("builder-inited").await.unwrap();
        let session = bus.finish_recording("sphinx-build").unwrap();

        let root = &session.root_frame;
        assert_eq!(root.children.len(), 1);

        let emitter = &root.children[0];
        assert_eq!(emitter.qualifier(), "EventBus.emit_builder_inited");
        let dispatch = &emitter.children[0];
        assert_eq!(dispatch.qualifier(), "EventBus.emit");
        assert_eq!(dispatch.children[0].qualifier(), "DelayHandler.wait_builder_inited");
        assert!(dispatch.children[0].time >= 0.005);

        assert!(bus.finish_recording("sphinx-build").is_none());
    }
}
