//! Whole sessions against a stand-in build tool.
#![cfg(unix)]

use docbench::config::{DriverMode, SessionSettings};
use docbench::instrument::calltree::{CALLTREE_EVENTS, CALLTREE_HTML, CALLTREE_PROFILE, CallTreeSession};
use docbench::instrument::{InstrumentFlags, Instrumentation};
use docbench::matrix::{BuildOptions, ConfigMatrix, Overrides, parse_overrides};
use docbench::preset::PresetRegistry;
use docbench::report::{MISSING, ResultTable};
use docbench::runner::Session;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes one HTML file per source page into the output folder (`$9`).
const FAKE_TOOL: &str = r#"#!/bin/sh
out="$9"
src="$8"
mkdir -p "$out"
for page in "$src"/*.rst; do
    echo "reading sources... [ 50%] $(basename "$page")"
done
for page in "$src"/*.rst; do
    name=$(basename "$page" .rst)
    echo "writing output... [ 50%] $name"
    echo "<html><body>$name</body></html>" > "$out/$name.html"
    sleep 0.05
done
echo "build succeeded."
"#;

const EVENTS_DESCRIPTOR: &str = r##"
[parameters]
pages = 1
folders = 0
depth = 1

[info]
"#pages" = "page_amount"

[events]
delay_ms = 5
names = ["builder-inited", "env-updated", "build-finished"]
"##;

struct Fixture {
    dir: TempDir,
    tool: PathBuf,
    temp: PathBuf,
    profile: PathBuf,
    out: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let tool = dir.path().join("fake-sphinx-build");
    fs::write(&tool, FAKE_TOOL).unwrap();
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

    let temp = dir.path().join("tmp");
    fs::create_dir(&temp).unwrap();

    Fixture {
        tool,
        temp,
        profile: dir.path().join("profile"),
        out: dir.path().join("out"),
        dir,
    }
}

fn settings(fixture: &Fixture) -> SessionSettings {
    let mut settings = SessionSettings {
        temp: Some(fixture.temp.clone()),
        profile_dir: fixture.profile.clone(),
        show_progress: false,
        ..Default::default()
    };
    settings.tool.program = fixture.tool.display().to_string();
    settings
}

fn events_preset(root: &Path) -> PathBuf {
    let dir = root.join("events-fast");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("performance.toml"), EVENTS_DESCRIPTOR).unwrap();
    fs::write(dir.join("conf.template"), "project = 'events'\n").unwrap();
    fs::write(dir.join("index.template"), "{{ title }}\n").unwrap();
    fs::write(dir.join("page.template"), "{{ title }}\n").unwrap();
    fs::write(dir.join("requirements.template"), "sphinx\n").unwrap();
    dir
}

#[tokio::test]
async fn test_external_session_over_matrix() {
    let fixture = fixture();
    let mut settings = settings(&fixture);
    settings.csv = Some(fixture.out.join("results.csv"));
    settings.json = Some(fixture.out.join("results.json"));

    let mut session = Session::new(settings);
    let overrides = parse_overrides(&["--pages", "2", "--pages", "3", "--dummies", "1"]).unwrap();
    let matrix = ConfigMatrix::new(&["basic"], session.registry(), &BuildOptions::default(), &overrides).unwrap();
    assert_eq!(matrix.runs(), 2);

    let report = session.run(&matrix).await.unwrap();

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.skipped, 0);

    let table = report.table();
    assert_eq!(table.value("pages", 0), Some("2"));
    assert_eq!(table.value("pages", 1), Some("3"));
    assert_eq!(table.value("#pages", 1), Some("3"));
    assert_eq!(table.value("exit status", 0), Some("0"));
    // index plus pages
    assert_eq!(table.value("# files", 0), Some("3"));
    assert_eq!(table.value("# files", 1), Some("4"));
    assert_ne!(table.value("writing time", 0), Some("0.00 s"));
    assert!(table.value("peak memory", 0).is_some());

    let reread = ResultTable::read_csv(&fixture.out.join("results.csv")).unwrap();
    assert_eq!(reread, table);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fixture.out.join("results.json")).unwrap()).unwrap();
    assert_eq!(json["results"].as_array().unwrap().len(), 2);
    assert!(report.artifacts.contains(&fixture.out.join("results.csv")));

    assert_eq!(fs::read_dir(&fixture.temp).unwrap().count(), 0);
}

#[tokio::test]
async fn test_results_of_different_projects_are_unified() {
    let fixture = fixture();
    let mut session = Session::new(settings(&fixture));
    let overrides = parse_overrides(&["--pages", "1", "--dummies", "0"]).unwrap();
    let matrix = ConfigMatrix::new(&["basic", "needs"], session.registry(), &BuildOptions::default(), &overrides).unwrap();

    let report = session.run(&matrix).await.unwrap();
    let table = report.table();

    assert_eq!(table.run_count(), 2);
    assert_eq!(table.value("project", 0), Some("basic"));
    assert_eq!(table.value("project", 1), Some("needs"));
    assert_eq!(table.value("#needs", 0), Some(MISSING));
    assert_eq!(table.value("#needs", 1), Some("10"));
    assert_eq!(table.value("sphinx", 0), Some("4.2"));
    assert_eq!(table.value("sphinx", 1), Some("5.1"));
}

#[tokio::test]
async fn test_invalid_configuration_does_not_stop_session() {
    let fixture = fixture();
    let mut session = Session::new(settings(&fixture));
    let overrides = parse_overrides(&["--pages", "1", "--pages", "lots"]).unwrap();
    let matrix = ConfigMatrix::new(&["basic"], session.registry(), &BuildOptions::default(), &overrides).unwrap();

    let report = session.run(&matrix).await.unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.results[0].config["pages"], "1");
}

#[tokio::test]
async fn test_failing_build_is_recorded() {
    let fixture = fixture();
    fs::write(&fixture.tool, "#!/bin/sh\necho \"reading sources...\"\nexit 2\n").unwrap();

    let mut session = Session::new(settings(&fixture));
    let overrides = parse_overrides(&["--pages", "1"]).unwrap();
    let matrix = ConfigMatrix::new(&["basic"], session.registry(), &BuildOptions::default(), &overrides).unwrap();

    let report = session.run(&matrix).await.unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].info["exit status"], "2");
    assert_eq!(report.results[0].extra["# files"], "0");
}

#[tokio::test]
async fn test_call_tree_session_exports_artifacts() {
    let fixture = fixture();
    let preset = events_preset(fixture.dir.path());

    let mut settings = settings(&fixture);
    settings.instrumentation = Instrumentation::from_flags(
        InstrumentFlags {
            call_tree: true,
            ..Default::default()
        },
        &fixture.profile,
    )
    .unwrap();
    assert_eq!(settings.effective_mode(), DriverMode::Api);

    let mut presets = BTreeMap::new();
    presets.insert("events-fast".to_string(), preset);
    let mut session = Session::new(settings).with_registry(PresetRegistry::empty().with_presets(&presets));
    let matrix = ConfigMatrix::new(&["events-fast"], session.registry(), &BuildOptions::default(), &Overrides::new())
        .unwrap();

    let report = session.run(&matrix).await.unwrap();
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].extra.contains_key("reading time"));

    let recorded = CallTreeSession::load(&fixture.profile.join(CALLTREE_PROFILE)).unwrap();
    assert_eq!(recorded.program, fixture.tool.display().to_string());

    let events: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fixture.profile.join(CALLTREE_EVENTS)).unwrap()).unwrap();
    let waited = events["Event: builder-inited"]["docbench/delay: DelayHandler.wait_builder_inited"]
        .as_f64()
        .unwrap();
    assert!(waited >= 0.005);

    assert!(fixture.profile.join(CALLTREE_HTML).exists());
    assert_eq!(report.html_reports, vec![fixture.profile.join(CALLTREE_HTML)]);
}

#[tokio::test]
async fn test_missing_tool_aborts_before_first_run() {
    let fixture = fixture();
    let mut settings = settings(&fixture);
    settings.tool.program = fixture.temp.join("no-such-build").display().to_string();

    let mut session = Session::new(settings);
    let matrix =
        ConfigMatrix::new(&["basic"], session.registry(), &BuildOptions::default(), &Overrides::new()).unwrap();

    let err = session.run(&matrix).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(session.page_counter().current(), 0);
}
