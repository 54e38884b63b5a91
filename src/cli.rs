//! CLI argument parsing for hooktime

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::ReportFormat;

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tree (default)
    Text,
    /// JSON document for machine parsing
    Json,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => ReportFormat::Text,
            OutputFormat::Json => ReportFormat::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "hooktime")]
#[command(version)]
#[command(about = "Timing instrumentation for callback-driven build pipelines", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Aggregate a saved ledger snapshot and render the report
    Report {
        /// Ledger snapshot (JSON)
        #[arg(value_name = "LEDGER")]
        ledger: PathBuf,

        /// Profiler options (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output format, overriding the configuration
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        /// Write the report to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Never color durations
        #[arg(long)]
        no_color: bool,
    },

    /// Run the reference pipeline over the sample workload
    Simulate {
        /// Profiler options (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Run without any instrumentation
        #[arg(long)]
        uninstrumented: bool,

        /// Output format, overriding the configuration
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        /// Write the report to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Never color durations
        #[arg(long)]
        no_color: bool,

        /// Print every emitted artifact after the run
        #[arg(long)]
        print_artifacts: bool,
    },
}
