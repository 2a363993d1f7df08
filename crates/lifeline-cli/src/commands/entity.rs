//! Entity mutation handlers
//!
//! Every change is applied locally and queued first, then pushed right away
//! when a session exists.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use lifeline_core::{CacheChange, CacheFilter, Client, EntityKey};

use crate::output::Output;

use super::sync::sync_quiet;

pub async fn create(
    client: &Client,
    entity_type: &str,
    id: &str,
    data: &str,
    output: &Output,
) -> Result<()> {
    let payload = parse_object(data)?;
    client.load_collection(entity_type).await?;
    let mut changes = client.subscribe_cache(CacheFilter::Type(entity_type.to_string()));

    let action = client
        .create_entity(entity_type, id, payload)
        .await
        .context("Failed to record the new entity")?;
    sync_quiet(client, output).await;

    // The server may have assigned its own id
    let mut key = action.entity_key();
    while let Some(change) = changes.try_recv() {
        if let CacheChange::Updated { key: updated, .. } = change {
            key = updated;
        }
    }

    report(client, &key, output);
    Ok(())
}

pub async fn update(client: &Client, key: &str, data: &str, output: &Output) -> Result<()> {
    let key = parse_key(key)?;
    let patch = parse_object(data)?;
    client.load_collection(&key.entity_type).await?;

    client
        .update_entity(&key, patch)
        .await
        .with_context(|| format!("Failed to record update to {}", key))?;
    sync_quiet(client, output).await;

    report(client, &key, output);
    Ok(())
}

pub async fn delete(client: &Client, key: &str, output: &Output) -> Result<()> {
    let key = parse_key(key)?;
    client.load_collection(&key.entity_type).await?;

    client
        .delete_entity(&key)
        .await
        .with_context(|| format!("Failed to record deletion of {}", key))?;
    sync_quiet(client, output).await;

    output.success(&format!("Deleted {}", key));
    report_pending(client, output);
    Ok(())
}

fn report(client: &Client, key: &EntityKey, output: &Output) {
    output.print_entity(key, client.cached(key).as_ref());
    report_pending(client, output);
}

fn report_pending(client: &Client, output: &Output) {
    let pending = client.pending_count();
    if pending > 0 {
        output.message(&format!("{} change(s) waiting to sync", pending));
    }
}

fn parse_key(key: &str) -> Result<EntityKey> {
    key.parse()
        .with_context(|| format!("Invalid entity key '{}', expected type:id", key))
}

fn parse_object(data: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(data).context("--data must be valid JSON")?;
    if !value.is_object() {
        bail!("--data must be a JSON object");
    }
    Ok(value)
}
