//! Queued mutation record

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::EntityKey;

/// Retry budget for actions built without explicit settings
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What the queued mutation does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation waiting to be transmitted
///
/// `id` is a v4 UUID assigned at construction. It is never reused, and is
/// also sent as the request's idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub kind: ActionKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedAction {
    pub fn new(kind: ActionKind, entity: &EntityKey, payload: Value, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            entity_type: entity.entity_type.clone(),
            entity_id: entity.id.clone(),
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_attempt_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// True when no retry delay is pending at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.enqueued_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_action_defaults() {
        let now = Utc::now();
        let action = QueuedAction::new(
            ActionKind::Create,
            &EntityKey::new("task", "task-1"),
            json!({"title": "Stretch"}),
            now,
        );

        assert_eq!(action.retry_count, 0);
        assert_eq!(action.max_retries, DEFAULT_MAX_RETRIES);
        assert!(action.is_due(now));
        assert_eq!(action.entity_key().to_string(), "task:task-1");
        assert!(Uuid::parse_str(&action.id).is_ok());
    }

    #[test]
    fn test_serializes_camel_case() {
        let action = QueuedAction::new(
            ActionKind::Delete,
            &EntityKey::new("badge", "b7"),
            Value::Null,
            Utc::now(),
        );
        let value = serde_json::to_value(&action).unwrap();

        assert_eq!(value["kind"], "delete");
        assert_eq!(value["entityType"], "badge");
        assert_eq!(value["retryCount"], 0);
        assert!(value.get("nextAttemptAt").is_none());
    }

    #[test]
    fn test_due_and_exhausted() {
        let now = Utc::now();
        let mut action = QueuedAction::new(
            ActionKind::Update,
            &EntityKey::new("task", "t"),
            json!({}),
            now,
        )
        .with_max_retries(2);

        action.next_attempt_at = Some(now + Duration::seconds(2));
        assert!(!action.is_due(now));
        assert!(action.is_due(now + Duration::seconds(2)));

        action.retry_count = 2;
        assert!(action.is_exhausted());
    }
}
