//! Sync command handler

use anyhow::{bail, Result};

use lifeline_core::Client;

use crate::output::Output;

/// Send every due action in the queue
pub async fn sync(client: &Client, output: &Output) -> Result<()> {
    if !client.is_authenticated() {
        bail!("Not signed in. Sign in with:\n  lifeline login --username <name> --password <password>");
    }

    if client.pending_count() == 0 {
        output.success("Nothing to sync");
        return Ok(());
    }

    let mut notifications = client.notifications();
    output.message(&format!("Syncing {} queued change(s)...", client.pending_count()));

    let report = client.sync_now().await;

    while let Ok(notification) = notifications.try_recv() {
        output.print_notification(&notification);
    }

    if let Some(reason) = &report.paused {
        output.message(&format!("Sync paused: {}", reason));
    }
    if let Some(wait) = report.next_retry_in {
        output.message(&format!("Next retry in {}s", wait.as_secs().max(1)));
    }

    output.success(&format!(
        "{} sent, {} retrying, {} failed, {} pending",
        report.sent.len(),
        report.rescheduled.len(),
        report.dropped.len(),
        client.pending_count()
    ));

    Ok(())
}

/// Push queued changes after a local edit; failures only reported
pub async fn sync_quiet(client: &Client, output: &Output) {
    if !client.is_authenticated() {
        return;
    }
    let mut notifications = client.notifications();
    client.sync_now().await;
    while let Ok(notification) = notifications.try_recv() {
        output.print_notification(&notification);
    }
}
