use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the paper CLI
#[derive(Parser)]
#[command(name = "paper")]
#[command(about = "Drive an LLM through writing and debugging data analysis code", long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one code step of a project end to end
    #[command(about = "Write, debug and review the code of one step")]
    Run {
        /// Project directory holding `project.toml`, `config.toml` and the data files
        #[arg(short, long, default_value = ".", help = "Project directory")]
        project: PathBuf,

        /// Code step to run
        #[arg(
            short,
            long,
            default_value = "data_analysis",
            help = "Code step (data_exploration, data_preprocessing, data_analysis)"
        )]
        step: String,

        /// Output directory
        #[arg(short, long, help = "Output directory [default: <project>/output]")]
        output: Option<PathBuf>,

        /// Record every LLM call
        #[arg(long, conflicts_with = "replay", help = "Record LLM calls to the call log")]
        record: bool,

        /// Replay recorded LLM calls
        #[arg(long, help = "Replay LLM calls from the call log")]
        replay: bool,
    },

    /// Show the effective configuration
    #[command(about = "Show the effective configuration")]
    Config {
        /// Project directory holding `config.toml`
        #[arg(short, long, default_value = ".", help = "Project directory")]
        project: PathBuf,
    },
}
