use std::path::Path;

use notez_core::store::{AttachmentStore, AttachmentUpload};

use crate::commands::common::{open_store, parse_title};
use crate::error::CliError;

pub async fn run_image_get(title: &str, output: &Path, api_url: Option<&str>) -> Result<(), CliError> {
    let key = parse_title(title)?;
    let store = open_store(api_url)?;

    let attachment = store.fetch_attachment(&key).await?;
    tokio::fs::write(output, &attachment.bytes).await?;
    println!(
        "Wrote {} to {}",
        format_size(attachment.bytes.len() as u64),
        output.display()
    );

    Ok(())
}

pub async fn run_image_put(title: &str, path: &Path, api_url: Option<&str>) -> Result<(), CliError> {
    let key = parse_title(title)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CliError::InvalidImagePath(path.display().to_string()))?;

    let bytes = tokio::fs::read(path).await?;
    let upload = AttachmentUpload::from_file_name(file_name, bytes);
    upload.validate()?;

    let store = open_store(api_url)?;
    let metadata = store.upload_attachment(&key, upload).await?;
    println!(
        "Attached {} ({}, {})",
        metadata.file_name,
        metadata.content_type,
        format_size(metadata.file_size)
    );

    Ok(())
}

pub async fn run_image_rm(title: &str, api_url: Option<&str>) -> Result<(), CliError> {
    let key = parse_title(title)?;
    let store = open_store(api_url)?;

    store.delete_attachment(&key).await?;
    println!("Removed image from \"{}\"", key.as_str());

    Ok(())
}

#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;

    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    }
}
