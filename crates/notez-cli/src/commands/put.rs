use std::io::{self, IsTerminal, Read};

use notez_core::store::{HttpNoteStore, NoteStore, UNCREATED_VERSION};
use notez_core::{Error, NoteKey};

use crate::commands::common::{open_store, parse_title};
use crate::error::CliError;

pub async fn run_put(
    title: &str,
    content_parts: &[String],
    version: Option<i64>,
    force: bool,
    api_url: Option<&str>,
) -> Result<(), CliError> {
    let key = parse_title(title)?;
    let content = resolve_put_content(content_parts)?;
    let store = open_store(api_url)?;

    let expected_version = if force {
        None
    } else if let Some(version) = version {
        Some(version)
    } else {
        Some(current_version(&store, &key).await?)
    };

    let record = store.save(&key, &content, expected_version).await?;
    tracing::debug!(version = record.version, forced = force, "Note written");
    println!("Saved \"{}\" (v{})", key.as_str(), record.version);

    Ok(())
}

/// Content from the arguments, or from stdin when the only argument is `-`.
pub fn resolve_put_content(content_parts: &[String]) -> Result<String, CliError> {
    if content_parts.len() == 1 && content_parts[0] == "-" {
        let stdin = io::stdin();
        if stdin.is_terminal() {
            return Err(CliError::EmptyContent);
        }
        let mut content = String::new();
        stdin.lock().read_to_string(&mut content)?;
        return non_empty(content);
    }

    non_empty(content_parts.join(" "))
}

fn non_empty(content: String) -> Result<String, CliError> {
    if content.trim().is_empty() {
        Err(CliError::EmptyContent)
    } else {
        Ok(content)
    }
}

async fn current_version(store: &HttpNoteStore, key: &NoteKey) -> Result<i64, CliError> {
    match store.fetch(key).await {
        Ok(record) => Ok(record.version),
        Err(Error::NotFound(_)) => Ok(UNCREATED_VERSION),
        Err(error) => Err(error.into()),
    }
}
