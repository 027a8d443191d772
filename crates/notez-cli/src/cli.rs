use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "notez")]
#[command(about = "Shared notes addressed by their title")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Note API base URL (overrides NOTEZ_API_BASE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub api_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print a note
    #[command(alias = "cat")]
    Get {
        /// Note title
        title: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace a note's content
    Put {
        /// Note title
        title: String,
        /// New content
        #[arg(required = true)]
        content: Vec<String>,
        /// Only write if the server still holds this version
        #[arg(long, value_name = "N", conflicts_with = "force")]
        version: Option<i64>,
        /// Overwrite regardless of concurrent changes
        #[arg(long)]
        force: bool,
    },
    /// Follow a note and print changes made elsewhere
    Watch {
        /// Note title
        title: String,
    },
    /// Interactive editing session with autosave
    Edit {
        /// Note title
        title: String,
    },
    /// Manage the image attached to a note
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },
    /// Rate how guessable a title is
    Strength {
        /// Note title
        title: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Download the attached image
    Get {
        /// Note title
        title: String,
        /// Destination file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
    },
    /// Attach an image, replacing any existing one
    Put {
        /// Note title
        title: String,
        /// Image file to upload
        path: PathBuf,
    },
    /// Remove the attached image
    Rm {
        /// Note title
        title: String,
    },
}
