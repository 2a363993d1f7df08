//! Reconciliation dispatcher
//!
//! Turns server events into local effects. The mapping is a table, not
//! branching spread across callers:
//!
//! 1. the event type `<domain>.<action>` is classified into an [`EventKind`]
//!    (domain overrides first, then the action table)
//! 2. each kind has a fixed list of [`Effect`]s
//! 3. [`plan`] resolves the effects against the event payload into
//!    [`Instruction`]s, which [`Dispatcher::dispatch`] executes
//!
//! Entity updates go through [`OptimisticEngine::reconcile_remote`], the
//! same path locally confirmed changes take.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::EntityKey;
use crate::events::ServerEvent;
use crate::notify::{Notification, Notifier};
use crate::optimistic::OptimisticEngine;
use crate::storage::StorageResult;

/// What an event means for local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An entity was created or changed
    EntityChanged,
    /// An entity is gone
    EntityRemoved,
    /// Too much changed to patch; refetch the collection
    CollectionStale,
    /// An entity changed in a way the user should hear about (badge earned,
    /// friend request received)
    EntityAnnounced,
    /// Informational only (reminders, notification center)
    Notice,
    Unrecognized,
}

/// One kind of local effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    PatchEntity,
    RemoveEntity,
    InvalidateCollection,
    Notify,
}

/// Domains whose events never describe a cached entity
const DOMAIN_KINDS: &[(&str, EventKind)] = &[
    ("notification", EventKind::Notice),
    ("reminder", EventKind::Notice),
];

const ACTION_KINDS: &[(&str, EventKind)] = &[
    ("created", EventKind::EntityChanged),
    ("updated", EventKind::EntityChanged),
    ("completed", EventKind::EntityChanged),
    ("logged", EventKind::EntityChanged),
    ("deleted", EventKind::EntityRemoved),
    ("removed", EventKind::EntityRemoved),
    ("archived", EventKind::EntityRemoved),
    ("synced", EventKind::CollectionStale),
    ("reset", EventKind::CollectionStale),
    ("bulk_updated", EventKind::CollectionStale),
    ("earned", EventKind::EntityAnnounced),
    ("unlocked", EventKind::EntityAnnounced),
    ("requested", EventKind::EntityAnnounced),
    ("accepted", EventKind::EntityAnnounced),
];

pub fn classify(event: &ServerEvent) -> EventKind {
    let domain = event.domain();
    if let Some((_, kind)) = DOMAIN_KINDS.iter().find(|(d, _)| *d == domain) {
        return *kind;
    }
    event
        .action()
        .and_then(|action| ACTION_KINDS.iter().find(|(a, _)| *a == action))
        .map_or(EventKind::Unrecognized, |(_, kind)| *kind)
}

pub fn effects(kind: EventKind) -> &'static [Effect] {
    match kind {
        EventKind::EntityChanged => &[Effect::PatchEntity],
        EventKind::EntityRemoved => &[Effect::RemoveEntity],
        EventKind::CollectionStale => &[Effect::InvalidateCollection],
        EventKind::EntityAnnounced => &[Effect::PatchEntity, Effect::Notify],
        EventKind::Notice => &[Effect::Notify],
        EventKind::Unrecognized => &[],
    }
}

/// A concrete step derived from one event
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Patch { key: EntityKey, value: Value },
    Remove { key: EntityKey },
    Invalidate { entity_type: String },
    Notify(Notification),
}

/// Resolve an event into instructions without touching any state
///
/// An entity effect whose payload carries no `id` degrades to invalidating
/// the whole collection.
pub fn plan(event: &ServerEvent) -> Vec<Instruction> {
    let entity_type = event.domain().to_string();
    let entity_id = payload_id(&event.data);

    effects(classify(event))
        .iter()
        .map(|effect| match (effect, &entity_id) {
            (Effect::PatchEntity, Some(id)) => Instruction::Patch {
                key: EntityKey::new(entity_type.clone(), id.clone()),
                value: event.data.clone(),
            },
            (Effect::RemoveEntity, Some(id)) => Instruction::Remove {
                key: EntityKey::new(entity_type.clone(), id.clone()),
            },
            (Effect::PatchEntity | Effect::RemoveEntity, None) | (Effect::InvalidateCollection, _) => {
                Instruction::Invalidate {
                    entity_type: entity_type.clone(),
                }
            }
            (Effect::Notify, _) => Instruction::Notify(Notification::Remote {
                event_type: event.event_type.clone(),
                payload: event.data.clone(),
            }),
        })
        .collect()
}

fn payload_id(data: &Value) -> Option<String> {
    match data.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Executes planned instructions against the cache and notifier
pub struct Dispatcher {
    engine: Arc<OptimisticEngine>,
    notifier: Notifier,
}

impl Dispatcher {
    pub fn new(engine: Arc<OptimisticEngine>, notifier: Notifier) -> Self {
        Self { engine, notifier }
    }

    /// Apply one event; returns how many instructions ran
    pub async fn dispatch(&self, event: &ServerEvent) -> StorageResult<usize> {
        let instructions = plan(event);
        if instructions.is_empty() {
            debug!("No effects for event {}", event.event_type);
            return Ok(0);
        }

        for instruction in &instructions {
            match instruction {
                Instruction::Patch { key, value } => {
                    self.engine.reconcile_remote(key, Some(value.clone())).await?
                }
                Instruction::Remove { key } => self.engine.reconcile_remote(key, None).await?,
                Instruction::Invalidate { entity_type } => {
                    if payload_id(&event.data).is_none() && classify(event) != EventKind::CollectionStale {
                        warn!("Event {} has no entity id, invalidating {}", event.event_type, entity_type);
                    }
                    self.engine.cache().invalidate(entity_type);
                }
                Instruction::Notify(notification) => self.notifier.notify(notification.clone()),
            }
        }
        Ok(instructions.len())
    }
}
