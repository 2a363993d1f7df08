//! Login and logout handlers

use anyhow::{Context, Result};

use lifeline_core::Client;

use crate::output::Output;

pub async fn login(client: &Client, username: &str, password: &str, output: &Output) -> Result<()> {
    client
        .login(username, password)
        .await
        .context("Login failed")?;

    output.success(&format!("Signed in as {}", username));

    if client.pending_count() > 0 {
        super::sync::sync_quiet(client, output).await;
        output.message(&format!("{} change(s) still pending", client.pending_count()));
    }
    Ok(())
}

pub async fn logout(client: &Client, output: &Output) -> Result<()> {
    if !client.is_authenticated() {
        output.message("Not signed in.");
        return Ok(());
    }
    client.logout().await;
    output.success("Signed out");
    Ok(())
}
