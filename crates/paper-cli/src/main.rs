//! Paper CLI - drives an LLM through writing, debugging and reviewing analysis code

use anyhow::{Context as _, Result};
use clap::Parser as _;
use paper_cli::cli::{Cli, Commands};
use paper_cli::{RunArgs, handle_config, handle_run};
use paper_core::{CodeStep, RecordingMode};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            project,
            step,
            output,
            record,
            replay,
        } => {
            let step: CodeStep = step.parse().context("Invalid --step")?;
            let recording = if replay {
                Some(RecordingMode::Replay)
            } else if record {
                Some(RecordingMode::Record)
            } else {
                None
            };
            let output = output.unwrap_or_else(|| project.join("output"));
            handle_run(RunArgs {
                project,
                step,
                output,
                recording,
            })
            .await?;
        }
        Commands::Config { project } => {
            let rendered = handle_config(&project)?;
            // Configuration is printed to stdout by convention for CLI tools
            #[allow(clippy::print_stdout, reason = "Configuration output")]
            {
                print!("{rendered}");
            }
        }
    }

    Ok(())
}
