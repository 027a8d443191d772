use crate::commands::common::{open_session, status_line, transition_notices};
use crate::error::CliError;

pub async fn run_watch(title: &str, api_url: Option<&str>) -> Result<(), CliError> {
    let session = open_session(title, api_url).await?;
    let mut updates = session.subscribe();
    let mut previous = updates.borrow_and_update().clone();
    println!("Watching \"{title}\" ({}). Press Ctrl-C to stop.", status_line(&previous));

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = updates.borrow_and_update().clone();
                for notice in transition_notices(&previous, &current) {
                    println!("{notice}");
                }
                if current.content != previous.content && !current.is_loading {
                    println!("{}", current.content);
                }
                previous = current;
            }
        }
    }

    session.close().await?;
    Ok(())
}
