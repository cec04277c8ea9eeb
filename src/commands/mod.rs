/*!
Command handlers for the CLI

- `run`: Execute a prompt and print the paced stream
- `ping`: Measure request round-trip time
- `session`: Inspect or reset the stored session
*/

use crate::client::LiveClient;
use crate::config::Config;
use crate::error::{ChatlinkError, Result};
use crate::sync::SessionStore;

// Prompt execution handler
pub mod run {
    //! Connects, resumes or creates a session, runs one prompt and prints
    //! each revealed fragment as it appears.

    use super::*;
    use crate::stream::StreamUpdate;
    use std::io::Write;

    /// Run `prompt` and print the stream to stdout.
    ///
    /// # Errors
    ///
    /// Connection or session failures, or the execution's own failure after
    /// its content was printed.
    pub async fn run_prompt(config: Config, prompt: String, session: Option<String>) -> Result<()> {
        let client = LiveClient::new(config)?;
        let session_id = client.init(session).await?;
        tracing::info!(%session_id, "Session ready");

        let mut updates = client.formatter().subscribe();
        let printer = tokio::spawn(async move {
            let mut printed = String::new();
            while let Ok(update) = updates.recv().await {
                match update {
                    StreamUpdate::Content(content) => {
                        print_delta(&printed, &content);
                        printed = content;
                    }
                    StreamUpdate::Completed { .. } | StreamUpdate::Failed { .. } => break,
                    _ => {}
                }
            }
        });

        let result = client.run_prompt(&prompt).await;
        let _ = printer.await;
        println!();

        let outcome = match result {
            Ok(result) => {
                if let Some(summary) = &result.summary {
                    println!("\n--- summary ---");
                    println!(
                        "{}",
                        serde_json::to_string_pretty(summary).unwrap_or_else(|_| summary.to_string())
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        };

        client.shutdown().await?;
        outcome
    }

    /// Print what `next` adds to `printed`, or all of it after an overwrite.
    fn print_delta(printed: &str, next: &str) {
        let mut out = std::io::stdout().lock();
        let written = match next.strip_prefix(printed) {
            Some(delta) => write!(out, "{delta}"),
            None => write!(out, "\n{next}"),
        };
        if written.and_then(|_| out.flush()).is_err() {
            tracing::debug!("stdout closed");
        }
    }
}

// Round-trip probe handler
pub mod ping {
    //! Opens the channel and times one correlated request.

    use super::*;

    /// Connect and print the round-trip time.
    pub async fn ping(config: Config) -> Result<()> {
        let client = LiveClient::new(config)?;
        let endpoint = client.config().connection.endpoint.clone();
        client.manager().connect(&endpoint).await?;

        let rtt = client.ping().await;
        client.manager().disconnect().await?;
        let rtt = rtt?;
        println!("{endpoint}: {} ms", rtt.as_millis());
        Ok(())
    }
}

// Local session handlers
pub mod session {
    //! Works on the local store only; no connection is opened.

    use super::*;

    /// Print the stored session.
    pub fn show(config: &Config) -> Result<()> {
        let store = SessionStore::open(&config.storage)?;
        let Some(persisted) = store.load()? else {
            println!("No stored session ({})", store.path().display());
            return Ok(());
        };

        println!("Session:  {}", persisted.session_id);
        println!("Updated:  {}", persisted.updated_at.to_rfc3339());
        println!("Pending:  {} change(s)", persisted.pending.len());
        let fields: Vec<&str> = persisted.base.keys().map(String::as_str).collect();
        println!("Fields:   {}", fields.join(", "));
        for change in &persisted.pending {
            println!(
                "  {} {}",
                change.timestamp.to_rfc3339(),
                change.mutation.touched_fields().join(", ")
            );
        }
        Ok(())
    }

    /// Forget the stored session.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::UnsyncedChanges`] when changes were never synced and
    /// `discard` is false.
    pub fn reset(config: &Config, discard: bool) -> Result<()> {
        let store = SessionStore::open(&config.storage)?;
        if let Some(persisted) = store.load()? {
            let count = persisted.pending.len();
            if count > 0 && !discard {
                return Err(ChatlinkError::UnsyncedChanges { count }.into());
            }
            store.clear()?;
            println!("Session {} forgotten", persisted.session_id);
        } else {
            println!("No stored session");
        }
        Ok(())
    }

}
