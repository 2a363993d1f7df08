//! Lifeline Core Library
//!
//! Client-side resilience layer for the Lifeline API: local edits apply
//! instantly, survive restarts and network loss, and reconcile with the
//! server once it is reachable again.
//!
//! # Architecture
//!
//! - **Durable store**: namespaced key-value persistence (SQLite or files)
//! - **Action queue**: persisted FIFO of mutations with retry and eviction
//! - **Optimistic engine**: cache-first edits with rollback on failure
//! - **Transport**: request pipeline with single-flight token refresh
//! - **Event channel**: reconnecting push connection with backoff
//! - **Dispatcher**: table-driven mapping from server events to cache effects
//!
//! # Quick Start
//!
//! ```text
//! let client = Client::open(&Config::load()?).await?;
//! client.start();
//!
//! let action = client.create_entity("task", "task-1", json!({"title": "Walk"})).await?;
//! println!("{} pending", client.pending_count());
//! ```
//!
//! # Modules
//!
//! - `client`: Dependency-injected service instance (main entry point)
//! - `storage`: Durable store adapters
//! - `queue`: Offline action queue
//! - `optimistic` / `cache`: Optimistic mutations over the entity cache
//! - `transport`: HTTP pipeline and credentials
//! - `events` / `dispatch`: Live events and reconciliation
//! - `config`: Application configuration

pub mod backoff;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod network;
pub mod notify;
pub mod optimistic;
pub mod queue;
pub mod storage;
pub mod transport;

pub use backoff::Backoff;
pub use cache::{CacheChange, CacheFilter, EntityKey};
pub use client::{Client, ClientSettings, Components};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatch::Dispatcher;
pub use events::{ConnectionState, EventChannel, ServerEvent, Subscription};
pub use network::{NetworkObserver, NetworkStatus};
pub use notify::{Notification, Notifier};
pub use optimistic::OptimisticEngine;
pub use queue::{ActionKind, ActionQueue, DrainReport, QueuedAction};
pub use storage::{DurableStore, StorageError, TransactionalStore};
pub use transport::{CredentialSet, Transport, TransportError};
