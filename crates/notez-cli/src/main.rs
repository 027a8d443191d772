//! notez CLI - Command-line client for shared notes addressed by their title
//!
//! Read, write and watch notes, or edit one interactively with autosave and
//! conflict resolution.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ImageCommands};
use crate::commands::edit::run_edit;
use crate::commands::get::run_get;
use crate::commands::image::{run_image_get, run_image_put, run_image_rm};
use crate::commands::put::run_put;
use crate::commands::strength::run_strength;
use crate::commands::watch::run_watch;
use crate::error::CliError;


const DEFAULT_LOG_FILTER: &str = "notez=info,notez_core=info";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api_url = cli.api_url.as_deref();

    match cli.command {
        Commands::Get { title, json } => run_get(&title, json, api_url).await?,
        Commands::Put {
            title,
            content,
            version,
            force,
        } => run_put(&title, &content, version, force, api_url).await?,
        Commands::Watch { title } => run_watch(&title, api_url).await?,
        Commands::Edit { title } => run_edit(&title, api_url).await?,
        Commands::Image { command } => match command {
            ImageCommands::Get { title, output } => run_image_get(&title, &output, api_url).await?,
            ImageCommands::Put { title, path } => run_image_put(&title, &path, api_url).await?,
            ImageCommands::Rm { title } => run_image_rm(&title, api_url).await?,
        },
        Commands::Strength { title, json } => run_strength(&title, json)?,
    }

    Ok(())
}
