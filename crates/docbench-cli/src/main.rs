//! docbench CLI

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use docbench::config::{DriverMode, SessionSettings};
use docbench::driver::open_browser;
use docbench::instrument::{InstrumentFlags, Instrumentation};
use docbench::matrix::{BuildOptions, ConfigMatrix, Overrides, parse_overrides};
use docbench::preset::{ParameterDefault, PresetRegistry, ProjectEnv, ProjectPreset};
use docbench::runner::{Session, display_path};
use docbench::viewers::launch_viewers;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// Subcommands accepting project parameters as unknown `--key value` pairs
const OVERRIDE_COMMANDS: [&str; 2] = ["run", "validate"];

/// CLI enum for driver mode
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    /// Spawn the build tool and scrape its output
    External,
    /// Call the build entry point in-process
    Api,
}

impl From<CliMode> for DriverMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::External => DriverMode::External,
            CliMode::Api => DriverMode::Api,
        }
    }
}

#[derive(Parser)]
#[command(name = "docbench", version)]
#[command(about = "Benchmark documentation builds against generated projects", long_about = None)]
#[command(after_help = "Unknown --key value pairs are project parameters and may repeat, e.g. --pages 10 --pages 100")]
struct Cli {
    /// Settings file [default: docbench.toml in the current folder or a parent]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show build output and debug logs
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered project presets
    Presets,

    /// Check project configurations without building them
    Validate(ProjectArgs),

    /// Build every configuration of the matrix and compare the results
    Run(RunArgs),
}

#[derive(Args)]
struct ProjectArgs {
    /// Preset name or project folder (repeatable)
    #[arg(short, long = "project", default_value = "basic")]
    projects: Vec<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Builder to use (repeatable)
    #[arg(short, long = "builder", default_value = "html")]
    builders: Vec<String>,

    /// Number of parallel build processes, 0 for all cores (repeatable)
    #[arg(short = 'j', long, default_value = "1")]
    parallel: Vec<usize>,

    /// Keep the generated source and build folders
    #[arg(long)]
    keep: bool,

    /// Open each built project in the browser
    #[arg(long)]
    browser: bool,

    /// Base folder for generated projects; must exist
    #[arg(long)]
    temp: Option<PathBuf>,

    /// Write the result table to this CSV file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Write all results to this JSON file
    #[arg(long)]
    json: Option<PathBuf>,

    /// How the build tool is executed
    #[arg(short, long, value_enum)]
    mode: Option<CliMode>,

    /// Plugin part the build tool shall profile (repeatable)
    #[arg(long = "profile")]
    profiles: Vec<String>,

    /// Folder receiving profiling artifacts
    #[arg(long)]
    profile_dir: Option<PathBuf>,

    /// Record CPU times and stack samples of the build
    #[arg(long)]
    runtime: bool,

    /// Track memory usage into a file
    #[arg(long)]
    memory: bool,

    /// Stream memory usage to a live listener
    #[arg(long)]
    memory_live: bool,

    /// Record the call tree of all build events
    #[arg(long)]
    call_tree: bool,

    /// Derive flamegraphs and HTML reports from the profiles
    #[arg(long)]
    flamegraph: bool,

    /// Print profile statistics after each run
    #[arg(long)]
    stats: bool,

    /// Start the configured viewer for exported runtime profiles
    #[arg(long)]
    viewers: bool,

    /// Do not ask before profiling more than one run
    #[arg(long)]
    silent: bool,

    /// Hide the build status spinner
    #[arg(long)]
    no_progress: bool,
}

/// Separate unknown `--key value` pairs of the override commands from the
/// arguments clap knows about.
fn split_overrides(args: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut command = Cli::command();
    command.build();

    let mut known = Vec::with_capacity(args.len());
    let mut overrides = Vec::new();
    let mut subcommand: Option<&clap::Command> = None;
    let mut args = args.into_iter();

    if let Some(program) = args.next() {
        known.push(program);
    }

    while let Some(arg) = args.next() {
        if arg == "--" {
            known.push(arg);
            known.extend(args.by_ref());
            break;
        }

        let Some(long) = arg.strip_prefix("--") else {
            if subcommand.is_none() {
                subcommand = command.find_subcommand(&arg);
            }
            known.push(arg);
            continue;
        };

        let (name, inline_value) = match long.split_once('=') {
            Some((name, _)) => (name, true),
            None => (long, false),
        };

        let find = |cmd: &clap::Command| cmd.get_arguments().find(|a| a.get_long() == Some(name)).cloned();
        let option = subcommand.and_then(find).or_else(|| find(&command));
        match option {
            Some(option) => {
                let takes_value = option.get_action().takes_values() && !inline_value;
                known.push(arg);
                if takes_value && let Some(value) = args.next() {
                    known.push(value);
                }
            }
            None if subcommand.is_some_and(|s| OVERRIDE_COMMANDS.contains(&s.get_name())) => {
                overrides.push(arg);
                if let Some(value) = args.next() {
                    overrides.push(value);
                }
            }
            None => known.push(arg),
        }
    }

    (known, overrides)
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<SessionSettings> {
    match path {
        Some(path) => {
            tracing::debug!("Loading settings from {}", path.display());
            SessionSettings::from_toml_file(path).context("Failed to load settings")
        }
        None => {
            let discovered = SessionSettings::discover().context("Failed to discover settings")?;
            if discovered.is_none() {
                tracing::debug!("No settings file found, using defaults");
            }
            Ok(discovered.unwrap_or_default())
        }
    }
}

fn list_presets(settings: &SessionSettings) -> Result<()> {
    let registry = PresetRegistry::builtin().with_presets(&settings.presets);

    for name in registry.names() {
        let preset = match registry.resolve(name).and_then(|location| ProjectPreset::load(&location)) {
            Ok(preset) => preset,
            Err(e) => {
                println!("✗ {name}: {e}");
                continue;
            }
        };

        println!("{} ({})", name, display_path(&preset.location.path));

        let parameters: Vec<String> = preset
            .descriptor
            .parameters
            .iter()
            .map(|(param, default)| match default {
                ParameterDefault::Value(value) => format!("{param}={value}"),
                ParameterDefault::Required => format!("{param}=<required>"),
            })
            .collect();
        println!("  parameters: {}", parameters.join(", "));

        if !preset.descriptor.references.is_empty() {
            let references: Vec<&str> = preset.descriptor.references.keys().map(String::as_str).collect();
            println!("  references: {}", references.join(", "));
        }

        let info: Vec<&str> = preset.descriptor.info.keys().map(String::as_str).collect();
        println!("  info:       {}", info.join(", "));
    }

    Ok(())
}

fn validate(settings: &SessionSettings, args: &ProjectArgs, overrides: &Overrides) -> Result<()> {
    let registry = PresetRegistry::builtin().with_presets(&settings.presets);
    let matrix = ConfigMatrix::new(&args.projects, &registry, &BuildOptions::default(), overrides)?;

    let mut invalid = 0;
    for location in matrix.projects() {
        let preset = ProjectPreset::load(location)?;

        for config in matrix.project_configs() {
            let label = config
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");

            let mut env = ProjectEnv::new(&preset, config);
            if env.config_is_valid()
                && let Some(counts) = env.derived()
            {
                println!(
                    "✓ {} {}: {} pages, {} indexes",
                    preset.name(),
                    label,
                    counts.page_amount,
                    counts.index_amount
                );
            } else {
                invalid += 1;
                println!("✗ {} {}", preset.name(), label);
                for problem in env.errors() {
                    println!("    {problem}");
                }
            }
        }
    }

    if invalid > 0 {
        bail!("{invalid} configuration(s) are invalid");
    }
    Ok(())
}

/// Ask before profiling more than one run. Anything but `y` declines.
fn confirm(runs: usize) -> Result<bool> {
    eprintln!("There should not be more than 1 run for performance analysing. Given are {runs}.");

    let stdin = io::stdin();
    loop {
        print!("Really continue? [y/N]  ");
        io::stdout().flush()?;

        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer)? == 0 {
            return Ok(false);
        }
        match answer.trim().to_lowercase().as_str() {
            "y" => return Ok(true),
            "n" | "" => return Ok(false),
            _ => continue,
        }
    }
}

async fn run(mut settings: SessionSettings, args: RunArgs, overrides: &Overrides, debug: bool) -> Result<()> {
    if args.temp.is_some() {
        settings.temp = args.temp;
    }
    if args.csv.is_some() {
        settings.csv = args.csv;
    }
    if args.json.is_some() {
        settings.json = args.json;
    }
    if let Some(profile_dir) = args.profile_dir {
        settings.profile_dir = profile_dir;
    }
    if let Some(mode) = args.mode {
        settings.mode = mode.into();
    }
    settings.flamegraph |= args.flamegraph;
    settings.print_stats |= args.stats;
    settings.launch_viewers |= args.viewers;
    settings.show_progress &= !args.no_progress;
    settings.tool.request_plugin_profiles(&args.profiles);

    settings.instrumentation = Instrumentation::from_flags(
        InstrumentFlags {
            runtime: args.runtime,
            memory: args.memory,
            memory_live: args.memory_live,
            call_tree: args.call_tree,
        },
        &settings.profile_dir,
    )?;

    let options = BuildOptions {
        builders: args.builders,
        parallel: args.parallel,
        keep: args.keep,
        browser: args.browser,
        debug,
    };

    let mut session = Session::new(settings);
    let matrix = ConfigMatrix::new(&args.project.projects, session.registry(), &options, overrides)?;

    println!("\nRunning {} test configurations.\n", matrix.runs());
    if session.settings().instrumentation.is_active() && matrix.runs() > 1 && !args.silent && !confirm(matrix.runs())? {
        println!("Exit now.");
        return Ok(());
    }

    let report = session.run(&matrix).await?;

    println!("\n{}", report.table().render());
    println!("\nOverall runtime: {:.2} seconds.", report.overall_runtime());
    if report.skipped > 0 {
        println!("Skipped configurations: {}", report.skipped);
    }
    for artifact in &report.artifacts {
        println!("  → {}", display_path(artifact));
    }

    let settings = session.settings();
    if settings.flamegraph {
        for page in &report.html_reports {
            open_browser(page);
        }
    }

    if settings.launch_viewers {
        let mut profiles = report.runtime_profiles.clone();
        profiles.extend(
            args.profiles
                .iter()
                .map(|name| settings.profile_dir.join(format!("{name}.prof")))
                .filter(|path| path.exists()),
        );
        launch_viewers(&settings.viewer, &profiles).await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (args, raw_overrides) = split_overrides(std::env::args().collect());
    let cli = Cli::parse_from(args);

    init_tracing(cli.debug);

    let settings = load_settings(cli.config.as_deref())?;
    let overrides = parse_overrides(&raw_overrides)?;

    match cli.command {
        Commands::Presets => list_presets(&settings),
        Commands::Validate(args) => validate(&settings, &args, &overrides),
        Commands::Run(args) => run(settings, args, &overrides, cli.debug).await,
    }
}
