use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use hooktime::aggregate::aggregate;
use hooktime::cli::{Cli, Command, OutputFormat};
use hooktime::config::ProfilerOptions;
use hooktime::host::{host_profile, sample_compiler, sample_sources};
use hooktime::ledger::LedgerSnapshot;
use hooktime::report::{render, write_report};
use hooktime::Profiler;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Options from the config file (or defaults) with command-line overrides
fn load_options(
    config: Option<&Path>,
    format: Option<OutputFormat>,
    output: Option<PathBuf>,
) -> Result<ProfilerOptions> {
    let mut options = match config {
        Some(path) => ProfilerOptions::from_file(path)?,
        None => ProfilerOptions::default(),
    };
    if let Some(format) = format {
        options.format = format.into();
    }
    if output.is_some() {
        options.output_file = output;
    }
    Ok(options)
}

fn use_color(no_color: bool) -> bool {
    !no_color && std::io::stdout().is_terminal()
}

fn run_report(ledger: &Path, options: &ProfilerOptions, color: bool) -> Result<()> {
    let json = std::fs::read_to_string(ledger)
        .with_context(|| format!("failed to read ledger {}", ledger.display()))?;
    let snapshot = LedgerSnapshot::from_json(&json)
        .with_context(|| format!("{} is not a ledger snapshot", ledger.display()))?;

    let result = aggregate(&snapshot, &options.policy())?;
    for advisory in &result.advisories {
        tracing::warn!(%advisory, "profiling advisory");
    }
    let color = color && options.output_file.is_none();
    let report = render(&result, options, color)?;
    write_report(&report, options.output_file.as_deref())
}

fn run_simulate(
    options: ProfilerOptions,
    uninstrumented: bool,
    color: bool,
    print_artifacts: bool,
) -> Result<()> {
    let profiler = if uninstrumented {
        None
    } else {
        let profiler = Profiler::new(options, host_profile())?;
        profiler.set_color(color);
        Some(profiler)
    };

    let compiler = sample_compiler(profiler.as_ref())?;
    let artifacts = compiler.run(&sample_sources())?;
    tracing::debug!(artifacts = artifacts.len(), "simulation finished");

    if print_artifacts {
        for (name, contents) in &artifacts {
            println!("=== {name} ===");
            println!("{}", contents.trim_end_matches('\n'));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Report {
            ledger,
            config,
            format,
            output,
            no_color,
        } => {
            let options = load_options(config.as_deref(), format, output)?;
            run_report(&ledger, &options, use_color(no_color))
        }
        Command::Simulate {
            config,
            uninstrumented,
            format,
            output,
            no_color,
            print_artifacts,
        } => {
            let options = load_options(config.as_deref(), format, output)?;
            run_simulate(options, uninstrumented, use_color(no_color), print_artifacts)
        }
    }
}
