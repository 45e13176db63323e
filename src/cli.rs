//! CLI argument parsing for huella

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::instrument::NotifyStrategy;

/// Output format for `inspect`
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "huella")]
#[command(version)]
#[command(about = "Load-time class coverage with self-disabling notifications", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Instrument a class file or a directory of classes ahead of time
    Instrument {
        /// Class name prefix to instrument (e.g. "com.acme.")
        #[arg(long, value_name = "PREFIX")]
        prefix: String,

        /// Class file or class path root to read
        #[arg(long, value_name = "PATH")]
        input: PathBuf,

        /// Directory to write the rewritten tree to
        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        /// How notify routines reach the recording store
        #[arg(long, value_enum, default_value_t = NotifyStrategy::Direct)]
        strategy: NotifyStrategy,
    },

    /// Show a class file's version, flags and per-method trackability
    Inspect {
        /// Class file to inspect
        file: PathBuf,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Write the huella.DoNotTrack and huella.Runtime class files
    Stubs {
        /// Class path root to write into
        #[arg(long, value_name = "DIR")]
        output: PathBuf,
    },
}
