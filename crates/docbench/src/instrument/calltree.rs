//! Call-tree sessions and per-event runtime aggregation
//!
//! The session layout follows the JSON export of sampling profilers
//! (`root_frame` with nested `function`, `class_name`, `file_path_short`,
//! `time`, `children`), so trees recorded by [`crate::hooks::EventBus`] and
//! trees exported by an external profiler go through the same aggregation.

use crate::hooks::{EMITTER_CLASS, EVENTS, emitter_function};
use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Session export inside the profile directory
pub const CALLTREE_PROFILE: &str = "calltree_all.json";

/// Static HTML report of the session
pub const CALLTREE_HTML: &str = "calltree_all.html";

/// Per-event aggregation of the session
pub const CALLTREE_EVENTS: &str = "calltree_events_all.json";

/// Emitter class used by Sphinx in exported profiles
pub const SPHINX_EMITTER_CLASS: &str = "EventManager";

/// Extra frame groups reported next to the lifecycle events
pub const CUSTOM_FRAMES: &[(&str, &[&str])] = &[("Sphinx: html-renderer", &["HTML5Translator.dispatch_visit"])];

/// Aggregated time per report group and `"<file>: <function>"` entry
pub type EventRuntime = IndexMap<String, IndexMap<String, f64>>;

/// Node of a call tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default)]
    pub file_path_short: String,
    /// Seconds spent in this frame including children
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub children: Vec<Frame>,
}

impl Frame {
    pub fn new(function: &str, class_name: Option<&str>, file_path_short: &str, time: Duration) -> Self {
        Self {
            function: function.to_string(),
            class_name: class_name.map(str::to_string),
            file_path_short: file_path_short.to_string(),
            time: time.as_secs_f64(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Frame>) -> Self {
        self.children = children;
        self
    }

    /// `Class.function`, or the bare function name without a class.
    pub fn qualifier(&self) -> String {
        match self.class_name.as_deref() {
            Some(class) if !class.is_empty() => format!("{class}.{}", self.function),
            _ => self.function.clone(),
        }
    }

    pub fn frame_count(&self) -> usize {
        1 + self.children.iter().map(Frame::frame_count).sum::<usize>()
    }
}

/// Recorded or imported call tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTreeSession {
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub program: String,
    pub root_frame: Frame,
}

impl CallTreeSession {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).map_err(Error::Io)?;
        Ok(())
    }
}

/// Frame sequences per report group for trees emitted by `emitter_class`.
///
/// Each known event maps to `[<class>.emit_<event>, <class>.emit]`; the
/// custom groups from [`CUSTOM_FRAMES`] are appended.
pub fn event_frames(emitter_class: &str) -> IndexMap<String, Vec<String>> {
    let mut frames: IndexMap<String, Vec<String>> = EVENTS
        .iter()
        .map(|event| {
            (
                event.to_string(),
                vec![
                    format!("{emitter_class}.{}", emitter_function(event)),
                    format!("{emitter_class}.emit"),
                ],
            )
        })
        .collect();

    for (name, sequence) in CUSTOM_FRAMES {
        frames.insert(name.to_string(), sequence.iter().map(|s| s.to_string()).collect());
    }

    frames
}

/// Sum the time of functions called inside each lifecycle event.
pub fn aggregate_event_runtime(session: &CallTreeSession, emitter_class: &str) -> EventRuntime {
    let frames = event_frames(emitter_class);
    let mut out = EventRuntime::new();
    filter_frame_tree(&session.root_frame, &frames, &IndexMap::new(), &mut out);
    out
}

/// Aggregation for trees recorded by this crate's event bus.
pub fn aggregate_recorded(session: &CallTreeSession) -> EventRuntime {
    aggregate_event_runtime(session, EMITTER_CLASS)
}

/// Write an aggregation as pretty JSON.
pub fn write_event_runtime(events: &EventRuntime, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    fs::write(path, serde_json::to_string_pretty(events)?).map_err(Error::Io)?;
    Ok(())
}

/// Recursive walk over the tree.
///
/// `active` holds the groups partially matched on the path from the root to
/// the parent of `node`, with the frames still expected. A group resolves at
/// the node where its last frame matches; the time of that node's children is
/// then added to the group's bucket. The parent's map is never modified, so
/// siblings see the same state.
fn filter_frame_tree<'f>(
    node: &Frame,
    frames_by_group: &'f IndexMap<String, Vec<String>>,
    active: &IndexMap<&'f str, &'f [String]>,
    out: &mut EventRuntime,
) {
    let qualifier = node.qualifier();

    let mut still_active: IndexMap<&'f str, &'f [String]> = active
        .iter()
        .filter_map(|(group, frames)| match frames.split_first() {
            Some((first, rest)) if *first == qualifier => Some((*group, rest)),
            _ => None,
        })
        .collect();

    for (group, frames) in frames_by_group {
        if !still_active.contains_key(group.as_str())
            && let Some((first, rest)) = frames.split_first()
            && *first == qualifier
        {
            still_active.insert(group.as_str(), rest);
        }
    }

    let resolved: Vec<&'f str> = still_active
        .iter()
        .filter(|(_, frames)| frames.is_empty())
        .map(|(group, _)| *group)
        .collect();

    for group in resolved {
        let key = if EVENTS.contains(&group) {
            format!("Event: {group}")
        } else {
            group.to_string()
        };

        let bucket = out.entry(key).or_default();
        for child in &node.children {
            *bucket
                .entry(format!("{}: {}", child.file_path_short, child.qualifier()))
                .or_insert(0.0) += child.time;
        }

        still_active.shift_remove(group);
    }

    for child in &node.children {
        filter_frame_tree(child, frames_by_group, &still_active, out);
    }
}
