//! File statistics over generated sources and build output

use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Size summary of the files below a folder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub count: usize,
    pub total_bytes: u64,
    /// Largest file, relative to the walked folder
    pub max_file: Option<(PathBuf, u64)>,
    /// Smallest file, relative to the walked folder
    pub min_file: Option<(PathBuf, u64)>,
}

impl FileStats {
    /// Walk `root` and collect sizes of all regular files.
    ///
    /// With a non-empty `extensions` list only files with one of those
    /// extensions (without the dot) are counted.
    pub fn collect(root: &Path, extensions: &[&str]) -> Result<Self> {
        let mut stats = FileStats::default();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let matches = extensions.is_empty()
                || entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| extensions.contains(&ext));
            if !matches {
                continue;
            }

            let size = entry.metadata()?.len();
            let relative = pathdiff::diff_paths(entry.path(), root).unwrap_or_else(|| entry.path().to_path_buf());

            stats.count += 1;
            stats.total_bytes += size;

            if stats.max_file.as_ref().is_none_or(|(_, max)| size > *max) {
                stats.max_file = Some((relative.clone(), size));
            }
            if stats.min_file.as_ref().is_none_or(|(_, min)| size < *min) {
                stats.min_file = Some((relative, size));
            }
        }

        Ok(stats)
    }

    pub fn total_kb(&self) -> f64 {
        self.total_bytes as f64 / 1024.0
    }

    pub fn avg_kb(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_kb() / self.count as f64
        }
    }

    pub fn max_kb(&self) -> f64 {
        self.max_file.as_ref().map_or(0.0, |(_, size)| *size as f64 / 1024.0)
    }

    pub fn min_kb(&self) -> f64 {
        self.min_file.as_ref().map_or(0.0, |(_, size)| *size as f64 / 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_collect_all_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("index.html"), vec![b'a'; 2048]).unwrap();
        fs::write(dir.path().join("sub/page.html"), vec![b'a'; 512]).unwrap();
        fs::write(dir.path().join("sub/style.css"), vec![b'a'; 1024]).unwrap();

        let stats = FileStats::collect(dir.path(), &[]).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_bytes, 3584);
        assert_eq!(stats.max_file, Some((PathBuf::from("index.html"), 2048)));
        assert_eq!(stats.min_file, Some((PathBuf::from("sub/page.html"), 512)));
        assert!((stats.max_kb() - 2.0).abs() < f64::EPSILON);
        assert!((stats.total_kb() - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_collect_filtered_by_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.rst"), "Title\n=====\n").unwrap();
        fs::write(dir.path().join("conf.py"), "project = 'x'\n").unwrap();

        let stats = FileStats::collect(dir.path(), &["rst", "md"]).unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max_file.unwrap().0, PathBuf::from("index.rst"));
    }

    #[test]
    fn test_empty_folder() {
        let dir = TempDir::new().unwrap();
        let stats = FileStats::collect(dir.path(), &[]).unwrap();
        assert_eq!(stats, FileStats::default());
        assert_eq!(stats.avg_kb(), 0.0);
        assert_eq!(stats.min_kb(), 0.0);
    }
}
