//! Status command handler

use anyhow::Result;

use lifeline_core::{Client, Config};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(client: &Client, config: &Config, output: &Output) -> Result<()> {
    let creds = client.credentials();
    let expires_at = creds.as_ref().and_then(|c| c.expires_at);
    let pending = client.pending_count();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "api_url": config.api_url,
                    "events_url": config.resolved_events_url(),
                    "realtime_enabled": config.realtime_enabled,
                    "authenticated": creds.is_some(),
                    "token_expires_at": expires_at,
                    "pending": pending,
                    "storage": {
                        "data_dir": config.data_dir,
                        "database": config.database_path()
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", pending);
        }
        OutputFormat::Human => {
            println!("Lifeline Status");
            println!("===============");
            println!();
            println!("Session:");
            match (&creds, expires_at) {
                (None, _) => println!("  Signed out"),
                (Some(_), Some(at)) => {
                    println!("  Signed in (token expires {})", at.format("%Y-%m-%d %H:%M"))
                }
                (Some(_), None) => println!("  Signed in"),
            }
            println!();
            println!("Server:");
            println!("  API:      {}", config.api_url);
            println!(
                "  Realtime: {}",
                if config.realtime_enabled {
                    config.resolved_events_url()
                } else {
                    "disabled".to_string()
                }
            );
            println!();
            println!("Queue:");
            println!("  Pending:  {}", pending);
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
        }
    }

    Ok(())
}
