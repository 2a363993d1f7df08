//! Watch command handler

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use lifeline_core::{Client, Config, ConnectionState, ServerEvent};

use crate::output::Output;

/// Print live events until Ctrl-C
///
/// The background worker runs meanwhile, so events also update the local
/// cache and queued changes are sent as the connection allows.
pub async fn watch(client: &Client, config: &Config, types: Vec<String>, output: &Output) -> Result<()> {
    if !config.realtime_enabled {
        bail!("Real-time updates are disabled. Enable them with:\n  lifeline config set realtime_enabled true");
    }
    if !client.is_authenticated() {
        bail!("Not signed in. Sign in with:\n  lifeline login --username <name> --password <password>");
    }

    let (tx, mut events) = mpsc::unbounded_channel::<ServerEvent>();
    let forward = move |event: &ServerEvent| {
        let _ = tx.send(event.clone());
    };
    let _subscriptions = if types.is_empty() {
        vec![client.on_any(forward)]
    } else {
        types
            .iter()
            .map(|event_type| client.on_event(event_type, forward.clone()))
            .collect()
    };

    let mut notifications = client.notifications();
    let mut connection = client.watch_connection();
    client.start();
    output.message(&format!("Watching {} (Ctrl-C to stop)", config.resolved_events_url()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.recv() => output.print_event(&event),
            Ok(notification) = notifications.recv() => {
                // Remote notifications are already printed as events
                if !matches!(notification, lifeline_core::Notification::Remote { .. }) {
                    output.print_notification(&notification);
                }
            }
            Ok(()) = connection.changed() => {
                let state = *connection.borrow_and_update();
                output.message(&format!("[{}]", state));
                if state == ConnectionState::Disconnected && !client.is_authenticated() {
                    break;
                }
            }
        }
    }

    client.shutdown().await;
    output.message("Stopped watching.");
    Ok(())
}
