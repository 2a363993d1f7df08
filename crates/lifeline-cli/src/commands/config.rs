//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use lifeline_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!("  api_url:              {}", config.api_url);
            println!(
                "  events_url:           {}",
                config
                    .events_url
                    .clone()
                    .unwrap_or_else(|| format!("(derived: {})", config.resolved_events_url()))
            );
            println!("  realtime_enabled:     {}", config.realtime_enabled);
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(stderr)".to_string())
            );
            println!();
            println!("Queue:");
            println!("  max_retries:          {}", config.queue.max_retries);
            println!(
                "  retry delay:          {}ms .. {}ms",
                config.queue.base_retry_delay_ms, config.queue.max_retry_delay_ms
            );
            println!("  eviction:             {}h", config.queue.eviction_horizon_hours);
            println!();
            println!("Realtime:");
            println!(
                "  reconnect delay:      {}ms .. {}ms",
                config.realtime.base_reconnect_delay_ms, config.realtime.max_reconnect_delay_ms
            );
            println!("  max attempts:         {}", config.realtime.max_reconnect_attempts);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let unset = value.is_empty() || value == "none";
    match key {
        "data_dir" => config.data_dir = value.into(),
        "api_url" => {
            if unset {
                bail!("api_url cannot be empty");
            }
            config.api_url = value.to_string();
        }
        "events_url" => {
            config.events_url = (!unset).then(|| value.to_string());
        }
        "realtime_enabled" => {
            config.realtime_enabled = value
                .parse()
                .context("Invalid value for realtime_enabled. Use 'true' or 'false'.")?;
        }
        "request_timeout_secs" => {
            config.request_timeout_secs = parse_number(key, value)?;
        }
        "log_file" => {
            config.log_file = (!unset).then(|| value.into());
        }
        "queue.max_retries" => config.queue.max_retries = parse_number(key, value)?,
        "queue.base_retry_delay_ms" => config.queue.base_retry_delay_ms = parse_number(key, value)?,
        "queue.max_retry_delay_ms" => config.queue.max_retry_delay_ms = parse_number(key, value)?,
        "queue.eviction_horizon_hours" => {
            config.queue.eviction_horizon_hours = parse_number(key, value)?
        }
        "realtime.max_reconnect_attempts" => {
            config.realtime.max_reconnect_attempts = parse_number(key, value)?
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, api_url, events_url, realtime_enabled, \
                 request_timeout_secs, log_file, queue.max_retries, \
                 queue.base_retry_delay_ms, queue.max_retry_delay_ms, \
                 queue.eviction_horizon_hours, realtime.max_reconnect_attempts",
                key
            );
        }
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: expected a number", key))
}
