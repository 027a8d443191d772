use notez_core::models::{is_common_phrase, KeyStrength, MIN_KEY_CHARS};
use notez_core::NoteKey;
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct StrengthReport {
    pub strength: KeyStrength,
    pub length: usize,
    pub usable: bool,
    pub common_phrase: bool,
}

pub fn strength_report(title: &str) -> StrengthReport {
    StrengthReport {
        strength: KeyStrength::classify(title),
        length: title.chars().count(),
        usable: NoteKey::is_valid(title),
        common_phrase: is_common_phrase(title),
    }
}

pub fn run_strength(title: &str, as_json: bool) -> Result<(), CliError> {
    let report = strength_report(title);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} ({} characters)", report.strength.as_str(), report.length);
    if !report.usable {
        println!("Titles need at least {MIN_KEY_CHARS} characters.");
    }
    if report.common_phrase {
        println!("Contains a common phrase. Anyone who guesses the title can read and edit the note.");
    }

    Ok(())
}
