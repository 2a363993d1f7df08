//! Lifeline CLI
//!
//! Command-line interface for Lifeline - inspect and drive the offline sync
//! layer (queue, session, live events) from a shell.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use lifeline_core::{Client, Config};

mod commands;
mod logging;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "lifeline")]
#[command(about = "Lifeline - offline-first sync client")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show session, queue and connection status
    Status,
    /// Inspect or clear the offline queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// Send queued changes now
    Sync,
    /// Sign in to the API
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Sign out and forget stored credentials
    Logout,
    /// Create an entity
    #[command(alias = "add")]
    Create {
        /// Entity type (task, health, badge, ...)
        entity_type: String,
        /// Client-side id
        id: String,
        /// JSON object with the entity's fields
        #[arg(short, long, default_value = "{}")]
        data: String,
    },
    /// Update fields of an entity
    Update {
        /// Entity key as type:id
        key: String,
        /// JSON object with the fields to change
        #[arg(short, long)]
        data: String,
    },
    /// Delete an entity
    #[command(alias = "rm")]
    Delete {
        /// Entity key as type:id
        key: String,
    },
    /// Stream live events until interrupted
    Watch {
        /// Only show these event types (repeatable)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum QueueCommands {
    /// List queued actions
    #[command(alias = "ls")]
    List,
    /// Discard every queued action and undo its local effect
    Clear,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, api_url, events_url, realtime_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work without opening any local state
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config = Config::load_with_cli_override(config_path)?;
    logging::init(&config);

    let client = Client::open(&config).await?;

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Status => commands::status::show(&client, &config, &output),
        Commands::Queue { command } => match command {
            Some(QueueCommands::List) | None => commands::queue::list(&client, &output),
            Some(QueueCommands::Clear) => commands::queue::clear(&client, &output).await,
        },
        Commands::Sync => commands::sync::sync(&client, &output).await,
        Commands::Login { username, password } => {
            commands::auth::login(&client, &username, &password, &output).await
        }
        Commands::Logout => commands::auth::logout(&client, &output).await,
        Commands::Create {
            entity_type,
            id,
            data,
        } => commands::entity::create(&client, &entity_type, &id, &data, &output).await,
        Commands::Update { key, data } => {
            commands::entity::update(&client, &key, &data, &output).await
        }
        Commands::Delete { key } => commands::entity::delete(&client, &key, &output).await,
        Commands::Watch { types } => commands::watch::watch(&client, &config, types, &output).await,
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}
