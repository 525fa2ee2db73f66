mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "codepad-cli")]
#[command(about = "Codepad CLI - Submit C++ programs and inspect the job queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
pub struct SourceArgs {
    /// C++ source file to submit
    #[arg(short, long)]
    pub file: PathBuf,

    /// File whose contents become the program's stdin
    #[arg(long, conflicts_with = "stdin")]
    pub stdin_file: Option<PathBuf>,

    /// Literal stdin for the program
    #[arg(long)]
    pub stdin: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a program and print its job id
    Submit {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Show the current state of a job
    Status {
        /// Job id returned by submit
        job_id: Uuid,
    },

    /// Submit a program and wait for its result
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Delay between polls in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Give up after this many polls (the job keeps running)
        #[arg(long, default_value = "60")]
        max_attempts: u32,
    },

    /// Show how many jobs are waiting
    Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { source } => {
            commands::submit(&source).await?;
        }
        Commands::Status { job_id } => {
            commands::status(&job_id).await?;
        }
        Commands::Run {
            source,
            interval_ms,
            max_attempts,
        } => {
            commands::run(&source, interval_ms, max_attempts).await?;
        }
        Commands::Queue => {
            commands::queue_depth().await?;
        }
    }

    Ok(())
}
