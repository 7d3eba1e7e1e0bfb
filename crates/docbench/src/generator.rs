//! Synthetic project generation
//!
//! [`ContentGenerator`] turns a validated [`ProjectEnv`] into a documentation
//! source tree: the preset bundle is copied into a fresh working folder, the
//! config and dependency templates are rendered, and pages plus folder indexes
//! are rendered recursively up to the configured depth.
//!
//! Every render draws the next number from a [`PageCounter`] that the caller
//! keeps for the whole session, so `global_page` is unique across nested
//! folders and across runs. Each folder index is rendered exactly once, after
//! its pages, so one tree advances the counter by `page_amount + index_amount`
//! plus the config and dependency renders.

use crate::config::{BuildConfig, InstallerSettings, ParamValue};
use crate::preset::{
    CONFIG_TEMPLATE, DEPENDENCY_TEMPLATE, DESCRIPTOR_FILE, DerivedCounts, INDEX_TEMPLATE, Layout, PAGE_TEMPLATE,
    ProjectEnv, ProjectPreset,
};
use crate::report::Metrics;
use crate::stats::FileStats;
use crate::{Error, Result};
use indexmap::IndexMap;
use minijinja::{Environment, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Prefix of generated working folders
pub const WORKDIR_PREFIX: &str = "docbench-";

pub const MAIN_INDEX_TITLE: &str = "Performance Test main index";

const TEMPLATES: [&str; 4] = [CONFIG_TEMPLATE, INDEX_TEMPLATE, PAGE_TEMPLATE, DEPENDENCY_TEMPLATE];

/// Session wide render counter
#[derive(Debug, Default, Clone)]
pub struct PageCounter {
    value: u64,
}

impl PageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new value; the first call returns 1.
    pub fn advance(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    pub fn current(&self) -> u64 {
        self.value
    }
}

/// A generated source tree
#[derive(Debug)]
pub struct GeneratedProject {
    pub root: PathBuf,
    pub keep: bool,
    pub pages_rendered: u64,
    pub indexes_rendered: u64,
    /// Source files (`.rst`, `.md` and the layout's suffix)
    pub sources: FileStats,
    pub setup_duration: Duration,
    /// Info metrics evaluated against the final variables
    pub info: Metrics,
    dependency_file: PathBuf,
}

impl GeneratedProject {
    pub fn dependency_file(&self) -> &Path {
        &self.dependency_file
    }

    /// Install the rendered dependency file.
    ///
    /// Returns the installer's exit status. Callers treat failures as
    /// non-fatal.
    pub async fn install_dependencies(&self, installer: &InstallerSettings, debug: bool) -> Result<i32> {
        let started = Instant::now();

        let mut command = tokio::process::Command::new(&installer.program);
        command.args(&installer.args).arg(&self.dependency_file).stdin(Stdio::null());
        if !debug {
            command.stdout(Stdio::null());
        }

        tracing::info!(program = %installer.program, file = %self.dependency_file.display(), "Installing dependencies");
        let status = command
            .status()
            .await
            .map_err(|e| Error::Build(format!("Failed to run {}: {}", installer.program, e)))?;

        tracing::info!(
            duration = format!("{:.2}", started.elapsed().as_secs_f64()),
            success = status.success(),
            "Dependencies installed"
        );
        Ok(status.code().unwrap_or(-1))
    }

    /// Remove the working folder unless it is kept.
    pub fn cleanup(&self) -> Result<()> {
        if self.keep {
            tracing::info!(path = %self.root.display(), "Keeping project folder");
            return Ok(());
        }
        tracing::debug!(path = %self.root.display(), "Deleting project folder");
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(Error::Io)?;
        }
        Ok(())
    }
}

/// Renders project trees below a temp root
#[derive(Debug, Clone, Default)]
pub struct ContentGenerator {
    temp_root: Option<PathBuf>,
}

impl ContentGenerator {
    /// Generate below `temp_root`, or the system temp folder.
    pub fn new(temp_root: Option<PathBuf>) -> Self {
        Self { temp_root }
    }

    /// Generate the tree for a validated configuration.
    ///
    /// # Errors
    ///
    /// [`Error::TemplateNotFound`] for a missing bundle template,
    /// [`Error::Expression`] for an info metric that can not be evaluated and
    /// [`Error::Generation`] if `project` was not validated. All of them only
    /// skip the run.
    pub fn generate(
        &self,
        project: &ProjectEnv<'_>,
        build: &BuildConfig,
        counter: &mut PageCounter,
    ) -> Result<GeneratedProject> {
        let derived = project
            .derived()
            .ok_or_else(|| Error::Generation("configuration was not validated".to_string()))?;
        let preset = project.preset();
        let layout = &preset.descriptor.layout;

        let started = Instant::now();
        let env = load_templates(preset)?;
        let root = self.create_workdir()?;
        tracing::info!(path = %root.display(), "Docs path");

        let variables = variables(project, build, derived);
        let rendered = copy_bundle(&preset.location.path, &root)
            .and_then(|()| render_tree(&env, &root, layout, counter, &variables))
            .and_then(|counts| Ok((counts, evaluate_info(preset, &variables)?)));
        let ((pages_rendered, indexes_rendered), info) = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&root) {
                    tracing::debug!(error = %cleanup, path = %root.display(), "Could not remove partial project");
                }
                return Err(e);
            }
        };
        let setup_duration = started.elapsed();

        let mut extensions = vec!["rst", "md"];
        if !extensions.contains(&layout.source_suffix.as_str()) {
            extensions.push(layout.source_suffix.as_str());
        }
        let sources = FileStats::collect(&root, &extensions)?;

        tracing::info!(
            files = sources.count,
            size_kb = format!("{:.2}", sources.total_kb()),
            setup = format!("{:.2}", setup_duration.as_secs_f64()),
            "Docs files"
        );

        Ok(GeneratedProject {
            dependency_file: root.join(&layout.dependency_file),
            root,
            keep: build.effective_keep(),
            pages_rendered,
            indexes_rendered,
            sources,
            setup_duration,
            info,
        })
    }

    fn create_workdir(&self) -> Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKDIR_PREFIX);

        let dir = match &self.temp_root {
            Some(root) => {
                if !root.is_dir() {
                    return Err(Error::TempRootMissing(root.clone()));
                }
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(Error::Io)?;

        Ok(dir.keep())
    }
}

/// Recursive renderer state for one tree
struct GenerationContext<'g> {
    env: &'g Environment<'static>,
    base: IndexMap<String, Value>,
    root: &'g Path,
    layout: &'g Layout,
    counter: &'g mut PageCounter,
    pages: i64,
    folders: i64,
    depth: i64,
    pages_rendered: u64,
    indexes_rendered: u64,
}

impl GenerationContext<'_> {
    fn render(&mut self, template: &str, target: &Path, extra: Vec<(&str, Value)>) -> Result<()> {
        let mut vars = self.base.clone();
        vars.insert("has_folders".to_string(), Value::from(false));
        vars.insert("global_page".to_string(), Value::from(self.counter.advance()));
        for (name, value) in extra {
            vars.insert(name.to_string(), value);
        }

        let rendered = self.env.get_template(template)?.render(&vars)?;
        fs::write(self.root.join(target), rendered).map_err(Error::Io)?;
        Ok(())
    }

    fn render_index(&mut self, folder: &Path, title: &str, has_folders: bool) -> Result<()> {
        let target = folder.join(format!("index.{}", self.layout.source_suffix));
        self.render(
            INDEX_TEMPLATE,
            &target,
            vec![("title", Value::from(title)), ("has_folders", Value::from(has_folders))],
        )?;
        self.indexes_rendered += 1;
        Ok(())
    }

    fn create_pages(&mut self, folder: &Path, current_depth: i64) -> Result<()> {
        for p in 0..self.pages {
            let target = folder.join(format!("page_{p}.{}", self.layout.source_suffix));
            self.render(
                PAGE_TEMPLATE,
                &target,
                vec![
                    ("title", Value::from(format!("Page {p}"))),
                    ("page", Value::from(p)),
                    ("current_depth", Value::from(current_depth)),
                ],
            )?;
            self.pages_rendered += 1;
        }
        Ok(())
    }

    fn create_folders(&mut self, parent: &Path, current_depth: i64) -> Result<()> {
        for f in 0..self.folders {
            let folder = parent.join(format!("folder_{f}"));
            fs::create_dir(self.root.join(&folder)).map_err(Error::Io)?;

            self.create_pages(&folder, current_depth)?;

            let deeper = current_depth < self.depth;
            self.render_index(&folder, &format!("Index folder {f} depth {current_depth}"), deeper)?;
            if deeper {
                self.create_folders(&folder, current_depth + 1)?;
            }
        }
        Ok(())
    }
}

/// Render config, dependencies, the main index and the page tree.
///
/// Returns the number of rendered pages and indexes.
fn render_tree(
    env: &Environment<'static>,
    root: &Path,
    layout: &Layout,
    counter: &mut PageCounter,
    variables: &IndexMap<String, ParamValue>,
) -> Result<(u64, u64)> {
    let structural = |name: &str| variables.get(name).and_then(ParamValue::as_int).unwrap_or(0);
    let mut ctx = GenerationContext {
        env,
        base: variables
            .iter()
            .map(|(name, value)| (name.clone(), param_to_value(value)))
            .collect(),
        root,
        layout,
        counter,
        pages: structural("pages"),
        folders: structural("folders"),
        depth: structural("depth"),
        pages_rendered: 0,
        indexes_rendered: 0,
    };

    ctx.render(DEPENDENCY_TEMPLATE, Path::new(&layout.dependency_file), Vec::new())?;
    ctx.render(CONFIG_TEMPLATE, Path::new(&layout.config_file), Vec::new())?;

    let has_folders = ctx.folders > 0 && ctx.depth > 0;
    ctx.render_index(Path::new(""), MAIN_INDEX_TITLE, has_folders)?;
    ctx.create_pages(Path::new(""), 0)?;
    if has_folders {
        ctx.create_folders(Path::new(""), 1)?;
    }

    Ok((ctx.pages_rendered, ctx.indexes_rendered))
}

fn load_templates(preset: &ProjectPreset) -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);

    for name in TEMPLATES {
        let path = preset.template_path(name);
        let source = fs::read_to_string(&path).map_err(|_| Error::TemplateNotFound(path.clone()))?;
        env.add_template_owned(name.to_string(), source)?;
    }

    Ok(env)
}

/// Copy the static part of the bundle; templates and the descriptor stay behind.
fn copy_bundle(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).map_err(|e| Error::Generation(e.to_string()))?;

        if entry.file_type().is_dir() {
            fs::create_dir_all(target.join(relative)).map_err(Error::Io)?;
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 1 && (name == DESCRIPTOR_FILE || TEMPLATES.contains(&name.as_ref())) {
            continue;
        }
        fs::copy(entry.path(), target.join(relative)).map_err(Error::Io)?;
    }
    Ok(())
}

/// Project config, build options and derived counts, as seen by templates
/// and info expressions.
fn variables(project: &ProjectEnv<'_>, build: &BuildConfig, derived: DerivedCounts) -> IndexMap<String, ParamValue> {
    let mut vars = project.config().clone();
    vars.insert("builder".to_string(), ParamValue::Str(build.builder.clone()));
    vars.insert("parallel".to_string(), ParamValue::Int(build.resolved_parallel() as i64));
    vars.insert("keep".to_string(), ParamValue::Int(i64::from(build.effective_keep())));
    vars.insert("browser".to_string(), ParamValue::Int(i64::from(build.browser)));
    vars.insert("debug".to_string(), ParamValue::Int(i64::from(build.debug)));
    vars.insert("page_amount".to_string(), ParamValue::Int(derived.page_amount));
    vars.insert("index_amount".to_string(), ParamValue::Int(derived.index_amount));
    vars
}

fn param_to_value(value: &ParamValue) -> Value {
    match value {
        ParamValue::Int(value) => Value::from(*value),
        ParamValue::Str(value) => Value::from(value.as_str()),
    }
}

fn evaluate_info(preset: &ProjectPreset, variables: &IndexMap<String, ParamValue>) -> Result<Metrics> {
    let mut info = Metrics::with_capacity(preset.descriptor.info.len());
    for (name, expr) in &preset.descriptor.info {
        info.insert(name.clone(), expr.eval(variables)?.to_string());
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::preset::ProjectLocation;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = r##"
[parameters]
dummies = 2
pages = 3
folders = 0
depth = 1

[info]
"#pages" = "page_amount"
"#dummies" = "dummies * page_amount"
"#indexes" = "index_amount"
"##;

    fn preset_bundle(dir: &Path) -> ProjectPreset {
        fs::write(dir.join(DESCRIPTOR_FILE), DESCRIPTOR).unwrap();
        fs::write(dir.join(CONFIG_TEMPLATE), "project = 'bench'\nparallel = {{ parallel }}\n").unwrap();
        fs::write(dir.join(DEPENDENCY_TEMPLATE), "sphinx\n").unwrap();
        fs::write(
            dir.join(INDEX_TEMPLATE),
            "{{ title }}\n{% if has_folders %}folders\n{% endif %}#{{ global_page }}\n",
        )
        .unwrap();
        fs::write(
            dir.join(PAGE_TEMPLATE),
            "{{ title }}\ndepth={{ current_depth }}\n#{{ global_page }}\n",
        )
        .unwrap();
        fs::create_dir_all(dir.join("_static")).unwrap();
        fs::write(dir.join("_static/custom.css"), "body {}\n").unwrap();

        ProjectPreset::load(&ProjectLocation {
            name: "fixture".to_string(),
            path: dir.to_path_buf(),
        })
        .unwrap()
    }

    fn config(pairs: &[(&str, i64)]) -> ProjectConfig {
        pairs.iter().map(|(k, v)| (k.to_string(), ParamValue::Int(*v))).collect()
    }

    fn generate(preset: &ProjectPreset, overrides: &[(&str, i64)], counter: &mut PageCounter) -> GeneratedProject {
        let mut env = ProjectEnv::new(preset, &config(overrides));
        assert!(env.config_is_valid(), "{:?}", env.errors());
        ContentGenerator::new(None)
            .generate(&env, &BuildConfig::default(), counter)
            .unwrap()
    }

    #[test]
    fn test_flat_project() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        let mut counter = PageCounter::new();

        let project = generate(&preset, &[], &mut counter);

        assert_eq!(project.pages_rendered, 3);
        assert_eq!(project.indexes_rendered, 1);
        assert_eq!(project.info["#pages"], "3");
        assert_eq!(project.info["#dummies"], "6");
        assert_eq!(project.sources.count, 4);

        let root = &project.root;
        assert!(root.join("conf.py").exists());
        assert!(root.join("requirements.txt").exists());
        assert!(root.join("_static/custom.css").exists());
        assert!(!root.join(DESCRIPTOR_FILE).exists());
        assert!(!root.join(PAGE_TEMPLATE).exists());
        assert!(!root.join("folder_0").exists());

        let index = fs::read_to_string(root.join("index.rst")).unwrap();
        assert!(index.starts_with(MAIN_INDEX_TITLE));
        assert!(!index.contains("folders"));

        project.cleanup().unwrap();
        assert!(!project.root.exists());
    }

    #[test]
    fn test_nested_folders() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        let mut counter = PageCounter::new();

        let project = generate(&preset, &[("pages", 2), ("folders", 2), ("depth", 2)], &mut counter);

        // 2 * (1 + 2 + 4) pages and 1 + 2 + 4 indexes
        assert_eq!(project.pages_rendered, 14);
        assert_eq!(project.indexes_rendered, 7);
        assert_eq!(project.info["#indexes"], "7");
        // one number per index, page, config and dependency render
        assert_eq!(counter.current(), 14 + 7 + 2);

        let root = &project.root;
        let nested = fs::read_to_string(root.join("folder_1/folder_0/page_1.rst")).unwrap();
        assert!(nested.contains("depth=2"));

        let middle = fs::read_to_string(root.join("folder_1/index.rst")).unwrap();
        assert!(middle.starts_with("Index folder 1 depth 1"));
        assert!(middle.contains("folders"));
        let leaf = fs::read_to_string(root.join("folder_1/folder_0/index.rst")).unwrap();
        assert!(!leaf.contains("folders"));
        assert!(!root.join("folder_1/folder_0/folder_0").exists());

        project.cleanup().unwrap();
    }

    #[test]
    fn test_depth_zero_skips_folders() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        let mut counter = PageCounter::new();

        let project = generate(&preset, &[("folders", 3), ("depth", 0)], &mut counter);
        assert_eq!(project.pages_rendered, 3);
        assert_eq!(project.indexes_rendered, 1);
        assert!(!project.root.join("folder_0").exists());
        project.cleanup().unwrap();
    }

    #[test]
    fn test_counter_continues_across_runs() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        let mut counter = PageCounter::new();

        let first = generate(&preset, &[], &mut counter);
        let after_first = counter.current();
        // config + dependencies + index + 3 pages
        assert_eq!(after_first, 6);

        let second = generate(&preset, &[], &mut counter);
        let page = fs::read_to_string(second.root.join("page_0.rst")).unwrap();
        assert!(page.contains(&format!("#{}", after_first + 4)));

        first.cleanup().unwrap();
        second.cleanup().unwrap();
    }

    #[test]
    fn test_keep_flag_preserves_folder() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        let temp_root = TempDir::new().unwrap();
        let mut env = ProjectEnv::new(&preset, &ProjectConfig::new());
        assert!(env.config_is_valid());

        let build = BuildConfig {
            browser: true,
            ..Default::default()
        };
        let project = ContentGenerator::new(Some(temp_root.path().to_path_buf()))
            .generate(&env, &build, &mut PageCounter::new())
            .unwrap();

        assert!(project.root.starts_with(temp_root.path()));
        assert!(project.keep);
        project.cleanup().unwrap();
        assert!(project.root.exists());
    }

    #[test]
    fn test_missing_template_skips_run() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        fs::remove_file(bundle.path().join(PAGE_TEMPLATE)).unwrap();

        let mut env = ProjectEnv::new(&preset, &ProjectConfig::new());
        assert!(env.config_is_valid());
        let err = ContentGenerator::new(None)
            .generate(&env, &BuildConfig::default(), &mut PageCounter::new())
            .unwrap_err();

        assert!(matches!(err, Error::TemplateNotFound(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unvalidated_env_is_rejected() {
        let bundle = TempDir::new().unwrap();
        let preset = preset_bundle(bundle.path());
        let env = ProjectEnv::new(&preset, &ProjectConfig::new());

        let err = ContentGenerator::new(None)
            .generate(&env, &BuildConfig::default(), &mut PageCounter::new())
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }
}
