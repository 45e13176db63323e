use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use huella::agent::CoverageAgent;
use huella::cli::{Cli, Command, OutputFormat};
use huella::filter::LoadFilter;
use huella::instrument::Instrumenter;
use huella::{inspect, offline, stubs};
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

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Instrument {
            prefix,
            input,
            output,
            strategy,
        } => {
            if prefix.trim().is_empty() {
                anyhow::bail!("Invalid value for --prefix: must not be empty");
            }
            let agent = CoverageAgent::new(LoadFilter::new(&prefix), Instrumenter::new(strategy));
            let summary = offline::instrument_tree(&agent, &input, &output)?;
            println!(
                "{} classes scanned, {} instrumented, {} other files copied",
                summary.classes, summary.instrumented, summary.copied
            );
        }
        Command::Inspect { file, format } => {
            let bytes =
                fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let report = inspect::inspect(&bytes)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            match format {
                OutputFormat::Text => print!("{report}"),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Command::Stubs { output } => {
            for stub in stubs::generate().context("Failed to generate bridge classes")? {
                let path = output.join(stub.relative_path());
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                fs::write(&path, &stub.bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("wrote {}", path.display());
            }
        }
    }

    Ok(())
}
