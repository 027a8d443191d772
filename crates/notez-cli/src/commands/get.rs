use notez_core::store::NoteStore;
use notez_core::Error;

use crate::commands::common::{note_to_output, open_store, parse_title};
use crate::error::CliError;

pub async fn run_get(title: &str, as_json: bool, api_url: Option<&str>) -> Result<(), CliError> {
    let key = parse_title(title)?;
    let store = open_store(api_url)?;

    let record = match store.fetch(&key).await {
        Ok(record) => record,
        Err(Error::NotFound(_)) => return Err(CliError::NoteNotFound(key.as_str().to_string())),
        Err(error) => return Err(error.into()),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&note_to_output(&key, &record))?);
    } else if record.content.ends_with('\n') {
        print!("{}", record.content);
    } else {
        println!("{}", record.content);
    }

    Ok(())
}
