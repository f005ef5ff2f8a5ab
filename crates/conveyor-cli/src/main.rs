//! conveyor CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Resumable, stage-structured job runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise one job through its pipeline
    Run {
        /// Job identifier under the current lifecycle dir
        job_id: String,
        /// Pipeline definition file
        #[arg(long, default_value = "pipeline.kdl")]
        pipeline: PathBuf,
    },
    /// Create a job skeleton under the current lifecycle dir
    Submit {
        /// Job identifier
        job_id: String,
        /// Pipeline definition file
        #[arg(long, default_value = "pipeline.kdl")]
        pipeline: PathBuf,
        /// Seed document
        #[arg(long)]
        seed: PathBuf,
    },
    /// Validate a pipeline definition
    Validate {
        /// Path to the definition file
        #[arg(default_value = "pipeline.kdl")]
        path: PathBuf,
    },
    /// Print a job's status document
    Status {
        /// Job identifier
        job_id: String,
    },
    /// List jobs per lifecycle directory
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run { job_id, pipeline } => commands::run(&job_id, &pipeline).await?,
        Commands::Submit {
            job_id,
            pipeline,
            seed,
        } => {
            commands::submit(&job_id, &pipeline, &seed).await?;
            0
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
            0
        }
        Commands::Status { job_id } => {
            commands::status(&job_id).await?;
            0
        }
        Commands::List => {
            commands::list().await?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
