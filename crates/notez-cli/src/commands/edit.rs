use notez_core::sync::ReloadConfirmation;
use notez_core::{Error, NoteSession};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::common::{open_session, status_line, transition_notices};
use crate::error::CliError;

const HELP: &str = "\
Lines are appended to the note and autosaved.
  :save      save now
  :reload    fetch the latest version (fails with unsaved changes)
  :reload!   fetch the latest version, discarding unsaved changes
  :theirs    resolve a conflict by loading the remote version
  :mine      resolve a conflict by overwriting it with yours
  :dismiss   hide the remote-change notice and the last error
  :show      print the note
  :quit      save and leave
Start a line with :: to append a line beginning with ':'.";

/// One line of input to the interactive editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditCommand {
    Append(String),
    Save,
    Reload { discard: bool },
    Theirs,
    Mine,
    Dismiss,
    Show,
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_edit_line(line: &str) -> EditCommand {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(escaped) = line.strip_prefix("::") {
        return EditCommand::Append(format!(":{escaped}"));
    }
    let Some(command) = line.strip_prefix(':') else {
        return EditCommand::Append(line.to_string());
    };

    match command.trim() {
        "save" | "w" => EditCommand::Save,
        "reload" => EditCommand::Reload { discard: false },
        "reload!" => EditCommand::Reload { discard: true },
        "theirs" => EditCommand::Theirs,
        "mine" => EditCommand::Mine,
        "dismiss" => EditCommand::Dismiss,
        "show" | "p" => EditCommand::Show,
        "help" | "h" | "?" => EditCommand::Help,
        "quit" | "q" => EditCommand::Quit,
        other => EditCommand::Unknown(other.to_string()),
    }
}

pub fn append_line(content: &str, line: &str) -> String {
    if content.is_empty() {
        line.to_string()
    } else if content.ends_with('\n') {
        format!("{content}{line}")
    } else {
        format!("{content}\n{line}")
    }
}

pub async fn run_edit(title: &str, api_url: Option<&str>) -> Result<(), CliError> {
    let session = open_session(title, api_url).await?;
    let mut updates = session.subscribe();
    let mut previous = updates.borrow_and_update().clone();

    if !previous.content.is_empty() {
        println!("{}", previous.content);
    }
    println!("-- {} (:help for commands)", status_line(&previous));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let command = parse_edit_line(&line);
                if command == EditCommand::Quit {
                    break;
                }
                if let Err(error) = apply_command(&session, command).await {
                    report_error(&error);
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = updates.borrow_and_update().clone();
                for notice in transition_notices(&previous, &current) {
                    println!("-- {notice}");
                }
                previous = current;
            }
        }
    }

    flush_on_exit(&session).await;
    session.close().await?;
    Ok(())
}

async fn apply_command(session: &NoteSession, command: EditCommand) -> Result<(), CliError> {
    match command {
        EditCommand::Append(line) => {
            let current = session.snapshot().content;
            session.edit(append_line(&current, &line)).await?;
        }
        EditCommand::Save => {
            session.manual_save().await?;
            println!("-- {}", status_line(&session.snapshot()));
        }
        EditCommand::Reload { discard } => {
            let confirmation = if discard {
                ReloadConfirmation::DiscardLocalChanges
            } else {
                ReloadConfirmation::Unconfirmed
            };
            session.reload(confirmation).await?;
            println!("{}", session.snapshot().content);
        }
        EditCommand::Theirs => {
            session.use_theirs().await?;
            println!("{}", session.snapshot().content);
        }
        EditCommand::Mine => {
            session.keep_mine().await?;
            println!("-- Remote changes overwritten");
        }
        EditCommand::Dismiss => {
            session.dismiss_remote_update().await?;
            session.dismiss_error().await?;
        }
        EditCommand::Show => {
            let snapshot = session.snapshot();
            println!("{}", snapshot.content);
            println!("-- {}", status_line(&snapshot));
        }
        EditCommand::Help => println!("{HELP}"),
        EditCommand::Unknown(command) => eprintln!("Unknown command :{command} (try :help)"),
        EditCommand::Quit => {}
    }

    Ok(())
}

/// Save what is left before leaving, unless it would clobber a remote change.
async fn flush_on_exit(session: &NoteSession) {
    let snapshot = session.snapshot();
    if !snapshot.has_unsaved_changes {
        return;
    }
    if snapshot.conflict_state.is_conflict() {
        eprintln!("Unsaved changes were not written because the note changed elsewhere.");
        return;
    }
    if let Err(error) = session.manual_save().await {
        report_error(&CliError::Core(error));
    }
}

fn report_error(error: &CliError) {
    match error {
        CliError::Core(Error::UnsavedChanges) => {
            eprintln!("You have unsaved changes. Use :reload! to discard them.");
        }
        CliError::Core(Error::ConflictPending) => {
            eprintln!("The note changed elsewhere. Use :theirs or :mine first.");
        }
        CliError::Core(error) if !error.is_user_visible() => {}
        CliError::Core(error) => eprintln!("{}", error.user_message()),
        other => eprintln!("{other}"),
    }
}
