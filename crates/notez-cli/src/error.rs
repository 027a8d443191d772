use std::io;

use notez_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] notez_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No note exists for \"{0}\" yet")]
    NoteNotFound(String),
    #[error("No note content provided")]
    EmptyContent,
    #[error("Invalid image path: {0}")]
    InvalidImagePath(String),
    #[error("Note failed to load: {0}")]
    LoadFailed(String),
}
