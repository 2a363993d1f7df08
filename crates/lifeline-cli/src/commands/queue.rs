//! Queue command handlers

use anyhow::{Context, Result};

use lifeline_core::Client;

use crate::output::Output;

/// List queued actions in send order
pub fn list(client: &Client, output: &Output) -> Result<()> {
    output.print_actions(&client.queued_actions());
    Ok(())
}

/// Discard the queue
pub async fn clear(client: &Client, output: &Output) -> Result<()> {
    let discarded = client
        .clear_queue()
        .await
        .context("Failed to clear the queue")?;
    output.success(&format!("Discarded {} queued action(s)", discarded));
    Ok(())
}
