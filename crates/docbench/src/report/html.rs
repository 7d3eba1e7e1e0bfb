//! Static HTML reports derived from profiling artifacts
//!
//! Both reports are single self-contained files: the call tree as nested
//! collapsible lists next to the per-event aggregation, and the memory
//! timeline as an inline SVG chart.

use crate::instrument::calltree::{CallTreeSession, EventRuntime};
use crate::monitoring::{ResourceSample, ResourceStats, format_bytes};
use crate::{Error, Result};
use minijinja::{AutoEscape, Environment, context};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

const CALLTREE_TEMPLATE: &str = "calltree.html.jinja";
const MEMORY_TEMPLATE: &str = "memory.html.jinja";

/// Chart size of the memory timeline in SVG units
const CHART_WIDTH: f64 = 960.0;
const CHART_HEIGHT: f64 = 320.0;

static TEMPLATE_ENV: OnceLock<std::result::Result<Environment<'static>, String>> = OnceLock::new();

fn init_template_env() -> std::result::Result<Environment<'static>, String> {
    let mut env = Environment::new();

    env.add_template(CALLTREE_TEMPLATE, include_str!("../../templates/calltree.html.jinja"))
        .map_err(|e| format!("Failed to add call tree template: {}", e))?;
    env.add_template(MEMORY_TEMPLATE, include_str!("../../templates/memory.html.jinja"))
        .map_err(|e| format!("Failed to add memory template: {}", e))?;

    env.set_auto_escape_callback(|name| {
        if name.ends_with(".html.jinja") {
            AutoEscape::Html
        } else {
            AutoEscape::None
        }
    });

    Ok(env)
}

fn template_env() -> Result<&'static Environment<'static>> {
    TEMPLATE_ENV
        .get_or_init(init_template_env)
        .as_ref()
        .map_err(|e| Error::Profiling(e.clone()))
}

fn render_to(path: &Path, template: &str, ctx: minijinja::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }

    let html = template_env()?.get_template(template)?.render(ctx)?;
    fs::write(path, html).map_err(Error::Io)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct EventRow<'a> {
    group: &'a str,
    total: f64,
    entries: Vec<(&'a str, f64)>,
}

/// Per-event table rows, slowest group and slowest entries first.
fn event_rows(events: &EventRuntime) -> Vec<EventRow<'_>> {
    let mut rows: Vec<EventRow<'_>> = events
        .iter()
        .map(|(group, entries)| {
            let mut entries: Vec<(&str, f64)> = entries.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            entries.sort_by(|a, b| b.1.total_cmp(&a.1));
            EventRow {
                group,
                total: entries.iter().map(|(_, time)| time).sum(),
                entries,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.total.total_cmp(&a.total));
    rows
}

/// Write the call tree of `session` plus its per-event aggregation.
pub fn write_call_tree_html(session: &CallTreeSession, events: &EventRuntime, path: &Path) -> Result<()> {
    render_to(
        path,
        CALLTREE_TEMPLATE,
        context! {
            program => &session.program,
            duration => session.duration,
            frame_count => session.root_frame.frame_count(),
            root => &session.root_frame,
            events => event_rows(events),
            generated_at => chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        },
    )
}

/// Polyline points of the memory curve, scaled into the chart area.
fn chart_points(samples: &[ResourceSample]) -> String {
    let max_ms = samples.iter().map(|s| s.elapsed_ms).max().unwrap_or(0).max(1) as f64;
    let max_bytes = samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0).max(1) as f64;

    samples
        .iter()
        .map(|s| {
            let x = s.elapsed_ms as f64 / max_ms * CHART_WIDTH;
            let y = CHART_HEIGHT - s.memory_bytes as f64 / max_bytes * CHART_HEIGHT;
            format!("{x:.1},{y:.1}")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write a memory timeline of `samples`.
pub fn write_memory_html(samples: &[ResourceSample], stats: &ResourceStats, path: &Path) -> Result<()> {
    let duration_ms = samples.last().map_or(0, |s| s.elapsed_ms);

    render_to(
        path,
        MEMORY_TEMPLATE,
        context! {
            width => CHART_WIDTH,
            height => CHART_HEIGHT,
            points => chart_points(samples),
            duration => format!("{:.2} s", duration_ms as f64 / 1000.0),
            peak => format_bytes(stats.peak_memory_bytes),
            average => format_bytes(stats.avg_memory_bytes),
            p95 => format_bytes(stats.p95_memory_bytes),
            sample_count => stats.sample_count,
            generated_at => chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        },
    )
}
