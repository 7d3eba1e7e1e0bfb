//! Session planning: matrix expansion and the checks that abort a session.

use docbench::config::ParamValue;
use docbench::instrument::{InstrumentFlags, Instrumentation, MemoryDestination};
use docbench::matrix::{BuildOptions, ConfigMatrix, Overrides, parse_overrides};
use docbench::preset::PresetRegistry;
use docbench::{Error, PageCounter};
use std::path::Path;

#[test]
fn test_two_by_two_build_options_without_overrides() {
    let options = BuildOptions {
        builders: vec!["html".to_string(), "singlehtml".to_string()],
        parallel: vec![1, 2],
        ..Default::default()
    };
    let matrix = ConfigMatrix::new(&["basic"], &PresetRegistry::builtin(), &options, &Overrides::new()).unwrap();

    assert_eq!(matrix.build_configs().len(), 4);
    assert_eq!(matrix.project_configs().len(), 1);
    assert!(matrix.project_configs()[0].is_empty());
    assert_eq!(matrix.runs(), 4);
}

#[test]
fn test_override_values_are_coerced() {
    let overrides = parse_overrides(&["--needs", "5", "--theme", "furo"]).unwrap();

    assert_eq!(overrides["needs"], vec![ParamValue::Int(5)]);
    assert_eq!(overrides["theme"], vec![ParamValue::Str("furo".to_string())]);
}

#[test]
fn test_runs_follow_project_then_build_then_config() {
    let options = BuildOptions {
        builders: vec!["html".to_string(), "dirhtml".to_string()],
        ..Default::default()
    };
    let overrides = parse_overrides(&["--pages", "1", "--pages", "2"]).unwrap();
    let matrix = ConfigMatrix::new(&["basic", "needs"], &PresetRegistry::builtin(), &options, &overrides).unwrap();

    let plan: Vec<(String, String, String)> = matrix
        .iter()
        .map(|run| {
            (
                run.project.name,
                run.build.builder,
                run.project_config["pages"].to_string(),
            )
        })
        .collect();

    assert_eq!(plan.len(), 8);
    assert_eq!(plan[0], ("basic".into(), "html".into(), "1".into()));
    assert_eq!(plan[1], ("basic".into(), "html".into(), "2".into()));
    assert_eq!(plan[2], ("basic".into(), "dirhtml".into(), "1".into()));
    assert_eq!(plan[4], ("needs".into(), "html".into(), "1".into()));
    assert_eq!(plan[7], ("needs".into(), "dirhtml".into(), "2".into()));
}

#[test]
fn test_project_path_is_accepted() {
    let preset = Path::new(env!("CARGO_MANIFEST_DIR")).join("presets").join("theme");
    let name = preset.display().to_string();
    let matrix = ConfigMatrix::new(&[name.as_str()], &PresetRegistry::empty(), &BuildOptions::default(), &Overrides::new())
        .unwrap();

    assert_eq!(matrix.projects()[0].path, preset);
}

#[test]
fn test_combined_instrumentation_is_rejected() {
    let flags = InstrumentFlags {
        runtime: true,
        memory: true,
        ..Default::default()
    };

    let err = Instrumentation::from_flags(flags, Path::new("profile")).unwrap_err();
    assert!(matches!(err, Error::ConflictingInstrumentation(ref names) if names == "runtime, memory"));
    assert!(err.is_fatal());
}

#[test]
fn test_single_instrumentation_is_selected() {
    let memory = Instrumentation::from_flags(
        InstrumentFlags {
            memory: true,
            ..Default::default()
        },
        Path::new("profile"),
    )
    .unwrap();
    assert_eq!(
        memory,
        Instrumentation::Memory(MemoryDestination::File(Path::new("profile").join("memory_all.jsonl")))
    );

    let none = Instrumentation::from_flags(InstrumentFlags::default(), Path::new("profile")).unwrap();
    assert!(!none.is_active());
}

#[test]
fn test_unknown_project_aborts_planning() {
    let err = ConfigMatrix::new(
        &["basic", "no-such-preset"],
        &PresetRegistry::builtin(),
        &BuildOptions::default(),
        &Overrides::new(),
    )
    .unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("no-such-preset"));
}

#[test]
fn test_fresh_page_counter_starts_at_one() {
    let mut counter = PageCounter::new();
    assert_eq!(counter.current(), 0);
    assert_eq!(counter.advance(), 1);
    assert_eq!(counter.advance(), 2);
}
