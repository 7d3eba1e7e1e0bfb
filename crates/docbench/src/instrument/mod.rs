//! Instrumentation adapters for in-process builds
//!
//! At most one adapter runs per session: stack sampling, memory tracking and
//! event recording distort each other's measurements too much to combine.

pub mod calltree;
pub mod memory;
pub mod runtime;

use crate::driver::{BuildApp, BuildRequest};
use crate::hooks::EventBus;
use crate::{Error, Result};
use calltree::CallTreeSession;
use memory::{MemoryProfile, MemoryTracker};
use runtime::{RuntimeProfile, RuntimeProfiler};
use std::path::{Path, PathBuf};

/// Where memory samples go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryDestination {
    /// JSON lines file
    File(PathBuf),
    /// Single TCP client on the given local port
    Live(u16),
}

/// Adapter wrapped around the build of every run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Instrumentation {
    #[default]
    None,
    Runtime,
    Memory(MemoryDestination),
    CallTree,
}

/// Requested adapters, as given on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrumentFlags {
    pub runtime: bool,
    pub memory: bool,
    pub memory_live: bool,
    pub call_tree: bool,
}

impl Instrumentation {
    /// Select the adapter for a set of flags.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`Error::ConflictingInstrumentation`] if more than one
    /// flag is set.
    pub fn from_flags(flags: InstrumentFlags, profile_dir: &Path) -> Result<Self> {
        let requested: Vec<&str> = [
            (flags.runtime, "runtime"),
            (flags.memory, "memory"),
            (flags.memory_live, "memory_live"),
            (flags.call_tree, "call_tree"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect();

        if requested.len() > 1 {
            return Err(Error::ConflictingInstrumentation(requested.join(", ")));
        }

        Ok(if flags.runtime {
            Instrumentation::Runtime
        } else if flags.memory {
            Instrumentation::Memory(MemoryDestination::File(profile_dir.join(memory::MEMORY_PROFILE)))
        } else if flags.memory_live {
            Instrumentation::Memory(MemoryDestination::Live(memory::LIVE_PORT))
        } else if flags.call_tree {
            Instrumentation::CallTree
        } else {
            Instrumentation::None
        })
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Instrumentation::None)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Instrumentation::None => "none",
            Instrumentation::Runtime => "runtime",
            Instrumentation::Memory(MemoryDestination::File(_)) => "memory",
            Instrumentation::Memory(MemoryDestination::Live(_)) => "memory_live",
            Instrumentation::CallTree => "call_tree",
        }
    }

    /// Run `app` under this adapter.
    ///
    /// The build status is returned untouched next to the adapter's artifact.
    /// A failing build still finishes the adapter before the error is returned.
    pub async fn wrap(
        &self,
        app: &mut dyn BuildApp,
        request: &BuildRequest,
        events: &mut EventBus,
    ) -> Result<(i32, InstrumentArtifact)> {
        match self {
            Instrumentation::None => {
                let status = app.build(request, events).await?;
                Ok((status, InstrumentArtifact::None))
            }
            Instrumentation::Runtime => {
                let profiler = RuntimeProfiler::start()?;
                let status = app.build(request, events).await;
                let profile = profiler.finish()?;
                Ok((status?, InstrumentArtifact::Runtime(profile)))
            }
            Instrumentation::Memory(destination) => {
                let tracker = MemoryTracker::start(destination).await?;
                let status = app.build(request, events).await;
                let profile = tracker.finish().await?;
                Ok((status?, InstrumentArtifact::Memory(profile)))
            }
            Instrumentation::CallTree => {
                events.start_recording();
                let status = app.build(request, events).await;
                let session = events
                    .finish_recording(app.name())
                    .ok_or_else(|| Error::Profiling("Event recording was stopped during the build".to_string()))?;
                Ok((status?, InstrumentArtifact::CallTree(session)))
            }
        }
    }
}

/// Adapter specific result of one build
#[derive(Debug, Clone, Default)]
pub enum InstrumentArtifact {
    #[default]
    None,
    Runtime(RuntimeProfile),
    Memory(MemoryProfile),
    CallTree(CallTreeSession),
}
