//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

use lifeline_core::{EntityKey, Notification, QueuedAction, ServerEvent};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print the offline queue
    pub fn print_actions(&self, actions: &[QueuedAction]) {
        match self.format {
            OutputFormat::Human => {
                if actions.is_empty() {
                    println!("Queue is empty.");
                    return;
                }
                for action in actions {
                    let retry = match (action.retry_count, action.next_attempt_at) {
                        (0, _) => String::new(),
                        (n, Some(at)) => format!(" | retry {} at {}", n, at.format("%H:%M:%S")),
                        (n, None) => format!(" | retry {}", n),
                    };
                    println!(
                        "{} | {:<6} | {}{} | {}",
                        &action.id[..8.min(action.id.len())],
                        action.kind,
                        truncate(&action.entity_key().to_string(), 30),
                        retry,
                        action.enqueued_at.format("%Y-%m-%d %H:%M")
                    );
                }
                println!("\n{} action(s) pending", actions.len());
            }
            OutputFormat::Json => {
                println!("{}", to_json(actions));
            }
            OutputFormat::Quiet => {
                for action in actions {
                    println!("{}", action.id);
                }
            }
        }
    }

    /// Print an entity as the cache holds it
    pub fn print_entity(&self, key: &EntityKey, value: Option<&Value>) {
        match self.format {
            OutputFormat::Human => match value {
                Some(value) => println!("{} = {}", key, value),
                None => println!("{} (removed)", key),
            },
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"key": key.to_string(), "value": value}));
            }
            OutputFormat::Quiet => println!("{}", key),
        }
    }

    pub fn print_event(&self, event: &ServerEvent) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "{} {}",
                    event.event_type,
                    truncate(&event.data.to_string(), 100)
                );
            }
            OutputFormat::Json => println!("{}", to_json(event)),
            OutputFormat::Quiet => println!("{}", event.event_type),
        }
    }

    /// Print a user-facing notification (warnings go to stderr)
    pub fn print_notification(&self, notification: &Notification) {
        let text = describe(notification);
        match self.format {
            OutputFormat::Human => eprintln!("! {}", text),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"notification": text}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// One-line text for a notification
pub fn describe(notification: &Notification) -> String {
    match notification {
        Notification::SyncFailed { entity, reason, .. } => {
            format!("Sync failed for {}: {}", entity, reason)
        }
        Notification::ChangeNotSaved { entity, reason } => {
            format!("Change to {} could not be saved ({})", entity, reason)
        }
        Notification::SessionExpired => {
            "Session expired. Run `lifeline login` to sign in again.".to_string()
        }
        Notification::RealtimeUnavailable => "Real-time updates unavailable".to_string(),
        Notification::Remote { event_type, .. } => format!("New {}", event_type),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
