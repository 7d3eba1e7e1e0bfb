//! Result aggregation and export
//!
//! Every completed run yields a [`RunResult`] with three metric groups whose
//! keys differ between projects. [`ResultTable`] unions the keys of each group
//! across all runs and lays the session out as one column per run, so the
//! console table and the CSV export show the same matrix.

pub mod html;

use crate::{Error, Result};
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Metric name to display value, in insertion order
pub type Metrics = IndexMap<String, String>;

/// Placeholder for metrics a run did not report
pub const MISSING: &str = "-";

const DIFF_COLOR: Color = Color::Rgb { r: 215, g: 175, b: 0 };

/// Measured result of one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// 1-based position among completed runs
    pub index: usize,
    pub project: String,
    /// Build duration in seconds
    pub runtime: f64,
    /// Project parameters plus builder and parallelism
    pub config: Metrics,
    /// Derived info metrics
    pub info: Metrics,
    /// Tool specific metrics
    pub extra: Metrics,
}

impl RunResult {
    /// Config, info and extra metrics, in display order
    fn groups(&self) -> [&Metrics; 3] {
        [&self.config, &self.info, &self.extra]
    }
}

/// Sum of all run durations in seconds.
pub fn overall_runtime(results: &[RunResult]) -> f64 {
    results.iter().map(|r| r.runtime).sum()
}

/// Transposed comparison matrix: one row per metric, one column per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultTable {
    rows: Vec<Vec<String>>,
}

impl ResultTable {
    pub fn from_results(results: &[RunResult]) -> Self {
        let mut header = vec!["#".to_string()];
        header.extend(results.iter().map(|r| format!("Run {}", r.index)));

        let mut rows = vec![
            header,
            row("runtime", results.iter().map(|r| format!("{:.2}", r.runtime))),
            row("project", results.iter().map(|r| r.project.clone())),
            spacer(results.len()),
        ];

        for group in 0..3 {
            let keys: IndexSet<&str> = results
                .iter()
                .flat_map(|r| r.groups()[group].keys().map(String::as_str))
                .collect();

            for key in keys {
                rows.push(row(
                    key,
                    results
                        .iter()
                        .map(|r| r.groups()[group].get(key).cloned().unwrap_or_else(|| MISSING.to_string())),
                ));
            }
            rows.push(spacer(results.len()));
        }

        Self { rows }
    }

    /// `#` followed by the run labels
    pub fn header(&self) -> &[String] {
        &self.rows[0]
    }

    /// Metric rows below the header
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows[1..]
    }

    pub fn run_count(&self) -> usize {
        self.header().len() - 1
    }

    /// Value of `metric` for the run in column `run` (0-based).
    pub fn value(&self, metric: &str, run: usize) -> Option<&str> {
        self.rows()
            .iter()
            .find(|row| row[0] == metric)
            .and_then(|row| row.get(run + 1))
            .map(String::as_str)
    }

    /// Console table: runtime row highlighted, rows differing between runs marked.
    pub fn render(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic);

        table.set_header(self.header().iter().enumerate().map(|(i, title)| {
            let cell = Cell::new(title).set_alignment(CellAlignment::Center);
            if i == 0 { cell.add_attribute(Attribute::Bold) } else { cell }
        }));

        for (i, row) in self.rows().iter().enumerate() {
            let distinct: IndexSet<&String> = row[1..].iter().collect();
            let color = if i == 0 {
                Some(Color::Red)
            } else if distinct.len() > 1 {
                Some(DIFF_COLOR)
            } else {
                None
            };

            table.add_row(row.iter().enumerate().map(|(column, value)| {
                let mut cell = Cell::new(value).set_alignment(CellAlignment::Center);
                if column == 0 {
                    cell = cell.add_attribute(Attribute::Bold);
                }
                match color {
                    Some(color) => cell.fg(color).add_attribute(Attribute::Bold),
                    None => cell,
                }
            }));
        }

        table
    }

    /// Write the matrix with `,` as delimiter and `|` as quote character.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .quote(b'|')
            .from_path(path)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush().map_err(Error::Io)?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b',')
            .quote(b'|')
            .has_headers(false)
            .from_path(path)?;

        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect::<Vec<_>>()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} holds no result rows", path.display()),
            )));
        }

        Ok(Self { rows })
    }
}

fn row(label: &str, values: impl Iterator<Item = String>) -> Vec<String> {
    let mut row = vec![label.to_string()];
    row.extend(values);
    row
}

fn spacer(runs: usize) -> Vec<String> {
    vec![String::new(); runs + 1]
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    overall_runtime: f64,
    results: &'a [RunResult],
}

/// Write all results as pretty JSON, creating parent folders as needed.
pub fn write_json(results: &[RunResult], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }

    let report = JsonReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        overall_runtime: overall_runtime(results),
        results,
    };
    fs::write(output_path, serde_json::to_string_pretty(&report)?).map_err(Error::Io)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics(pairs: &[(&str, &str)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn result(index: usize, runtime: f64, extra: Metrics) -> RunResult {
        RunResult {
            index,
            project: "basic".to_string(),
            runtime,
            config: metrics(&[("pages", "10"), ("parallel", "1")]),
            info: metrics(&[("#pages", "10")]),
            extra,
        }
    }

    #[test]
    fn test_layout() {
        let results = vec![result(1, 1.234, metrics(&[("reading time", "0.50 s")]))];
        let table = ResultTable::from_results(&results);

        assert_eq!(table.header(), &["#".to_string(), "Run 1".to_string()]);
        let labels: Vec<&str> = table.rows().iter().map(|r| r[0].as_str()).collect();
        assert_eq!(
            labels,
            vec!["runtime", "project", "", "pages", "parallel", "", "#pages", "", "reading time", ""]
        );
        assert_eq!(table.value("runtime", 0), Some("1.23"));
        assert_eq!(table.run_count(), 1);
    }

    #[test]
    fn test_union_of_extra_keys() {
        let results = vec![
            result(1, 1.0, metrics(&[("A", "a")])),
            result(2, 2.0, metrics(&[("B", "b")])),
        ];
        let table = ResultTable::from_results(&results);

        assert_eq!(table.value("A", 0), Some("a"));
        assert_eq!(table.value("A", 1), Some(MISSING));
        assert_eq!(table.value("B", 0), Some(MISSING));
        assert_eq!(table.value("B", 1), Some("b"));
    }

    #[test]
    fn test_render_contains_values() {
        let results = vec![
            result(1, 1.0, metrics(&[("A", "a")])),
            result(2, 2.5, metrics(&[("A", "a")])),
        ];
        let rendered = ResultTable::from_results(&results).render().to_string();

        assert!(rendered.contains("Run 2"));
        assert!(rendered.contains("2.50"));
        assert!(rendered.contains("pages"));
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let results = vec![
            result(1, 1.0, metrics(&[("folder size", "1,024.00 kB")])),
            result(2, 2.0, metrics(&[("# files", "3")])),
        ];
        let table = ResultTable::from_results(&results);

        table.write_csv(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#,Run 1,Run 2\n"));
        assert!(content.contains("|1,024.00 kB|"));

        assert_eq!(ResultTable::read_csv(&path).unwrap(), table);
    }

    #[test]
    fn test_write_json_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/results.json");
        let results = vec![result(1, 1.5, Metrics::new()), result(2, 0.5, Metrics::new())];

        write_json(&results, &path).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["overall_runtime"], 2.0);
        assert_eq!(parsed["results"][1]["index"], 2);
        assert!(parsed["generated_at"].is_string());
    }
}
