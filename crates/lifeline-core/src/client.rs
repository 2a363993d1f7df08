//! Lifeline client
//!
//! [`Client`] is the single entry point for applications. It owns one set of
//! stores, queue, credentials and event channel; nothing is shared between
//! instances, so tests can run several side by side.
//!
//! # Example
//!
//! ```text
//! let client = Client::open(&Config::load()?).await?;
//! client.start();
//!
//! client.create_entity("task", "task-1", json!({"title": "Stretch"})).await?;
//! // shows up in `cached()` right away, reaches the server when online
//! ```
//!
//! # Background worker
//!
//! [`Client::start`] spawns a task that drains the action queue on start,
//! after every local mutation, when the device comes back online and when the
//! next scheduled retry is due. While a session exists it also keeps the event
//! channel connected and routes incoming events through the dispatcher.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheFilter, CacheSubscription, EntityCache, EntityKey};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::events::{
    ChannelSettings, ConnectionState, EventChannel, EventRegistry, EventSource, ServerEvent,
    Subscription, WebSocketSource,
};
use crate::network::{NetworkObserver, NetworkStatus};
use crate::notify::{Notification, Notifier};
use crate::optimistic::{merge_server, OptimisticEngine};
use crate::queue::{ActionKind, ActionQueue, DrainReport, QueueSettings, QueuedAction};
use crate::storage::{DurableStore, FileStore, SqliteStore, StorageResult, TransactionalStore};
use crate::transport::{
    CredentialSet, CredentialVault, HttpBackend, Request, ReqwestBackend, Response, Transport,
    TransportError, TransportSettings,
};

/// Adapters a [`Client`] is built from
pub struct Components {
    /// Small key-value state (credentials)
    pub state_store: Arc<dyn DurableStore>,
    /// Queue and entity collections
    pub collection_store: Arc<dyn TransactionalStore>,
    pub backend: Arc<dyn HttpBackend>,
    pub event_source: Arc<dyn EventSource>,
    pub network: Arc<dyn NetworkObserver>,
    pub clock: Arc<dyn Clock>,
}

/// Policies for every component
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub queue: QueueSettings,
    pub transport: TransportSettings,
    pub channel: ChannelSettings,
    /// Hold an event connection while signed in
    pub realtime_enabled: bool,
}

impl From<&Config> for ClientSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue_settings(),
            transport: config.transport_settings(),
            channel: config.channel_settings(),
            realtime_enabled: config.realtime_enabled,
        }
    }
}

enum WorkerCommand {
    Shutdown,
}

struct Worker {
    commands: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

struct Shared {
    queue: Arc<ActionQueue>,
    engine: Arc<OptimisticEngine>,
    transport: Arc<Transport>,
    channel: EventChannel,
    dispatcher: Dispatcher,
    notifier: Notifier,
    network: Arc<dyn NetworkObserver>,
    kick: Notify,
    realtime_enabled: bool,
}

/// Offline-first client for the Lifeline API
pub struct Client {
    inner: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Client {
    /// Build a client with on-disk stores and real network adapters
    pub async fn open(config: &Config) -> Result<Self> {
        let collection_store = SqliteStore::open(&config.database_path())
            .with_context(|| format!("Failed to open database: {:?}", config.database_path()))?;
        let backend = ReqwestBackend::new(config.api_url.clone())
            .with_context(|| format!("Failed to create HTTP client for {}", config.api_url))?;

        let components = Components {
            state_store: Arc::new(FileStore::new(config.state_dir())),
            collection_store: Arc::new(collection_store),
            backend: Arc::new(backend),
            event_source: Arc::new(WebSocketSource::new(config.resolved_events_url())),
            network: Arc::new(NetworkStatus::online()),
            clock: Arc::new(SystemClock),
        };

        Self::with_components(components, ClientSettings::from(config))
            .await
            .context("Failed to load local state")
    }

    /// Build a client from explicit adapters
    pub async fn with_components(
        components: Components,
        settings: ClientSettings,
    ) -> StorageResult<Self> {
        let Components {
            state_store,
            collection_store,
            backend,
            event_source,
            network,
            clock,
        } = components;

        let notifier = Notifier::default();
        let vault = CredentialVault::load(state_store).await?;
        let transport = Arc::new(Transport::new(
            backend,
            vault,
            Arc::clone(&network),
            Arc::clone(&clock),
            notifier.clone(),
            settings.transport,
        ));

        let queue = Arc::new(
            ActionQueue::load(
                Arc::clone(&collection_store),
                Arc::clone(&clock),
                notifier.clone(),
                settings.queue,
            )
            .await?,
        );
        let cache = Arc::new(EntityCache::new(collection_store));
        let engine = Arc::new(OptimisticEngine::new(
            cache,
            Arc::clone(&queue),
            notifier.clone(),
            clock,
        ));

        let channel = EventChannel::new(
            event_source,
            EventRegistry::new(),
            notifier.clone(),
            settings.channel,
        );
        let dispatcher = Dispatcher::new(Arc::clone(&engine), notifier.clone());

        debug!("Client ready with {} queued actions", queue.size());
        Ok(Self {
            inner: Arc::new(Shared {
                queue,
                engine,
                transport,
                channel,
                dispatcher,
                notifier,
                network,
                kick: Notify::new(),
                realtime_enabled: settings.realtime_enabled,
            }),
            worker: Mutex::new(None),
        })
    }

    // ==================== Mutations ====================

    /// Create an entity locally and queue it for the server
    ///
    /// `id` is a client-side id; the server may assign a different one, in
    /// which case the cached entity moves to the new key on confirmation.
    pub async fn create_entity(
        &self,
        entity_type: &str,
        id: &str,
        payload: Value,
    ) -> StorageResult<QueuedAction> {
        let key = EntityKey::new(entity_type, id);
        let mut fields = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                let mut fields = Map::new();
                fields.insert("value".to_string(), other);
                fields
            }
        };
        fields
            .entry("id")
            .or_insert_with(|| Value::String(id.to_string()));
        let body = Value::Object(fields);

        let action = self
            .inner
            .engine
            .apply(ActionKind::Create, &key, body.clone(), |_| Some(body))
            .await?;
        self.inner.kick.notify_one();
        Ok(action)
    }

    /// Shallow-merge `patch` into an entity and queue the change
    pub async fn update_entity(
        &self,
        key: &EntityKey,
        patch: Value,
    ) -> StorageResult<QueuedAction> {
        let action = self
            .inner
            .engine
            .apply(ActionKind::Update, key, patch.clone(), |current| {
                Some(merge_server(current, &patch))
            })
            .await?;
        self.inner.kick.notify_one();
        Ok(action)
    }

    pub async fn delete_entity(&self, key: &EntityKey) -> StorageResult<QueuedAction> {
        let action = self
            .inner
            .engine
            .apply(ActionKind::Delete, key, Value::Null, |_| None)
            .await?;
        self.inner.kick.notify_one();
        Ok(action)
    }

    // ==================== Session ====================

    pub async fn login(&self, username: &str, password: &str) -> Result<(), TransportError> {
        self.inner.transport.login(username, password).await
    }

    pub async fn set_credentials(&self, creds: CredentialSet) -> Result<(), TransportError> {
        self.inner.transport.set_credentials(creds).await
    }

    pub async fn logout(&self) {
        self.inner.transport.logout().await;
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.transport.is_authenticated()
    }

    pub fn credentials(&self) -> Option<CredentialSet> {
        self.inner.transport.credentials()
    }

    /// Send a request through the resilient pipeline
    pub async fn request(&self, request: &Request) -> Result<Response, TransportError> {
        self.inner.transport.send(request).await
    }

    // ==================== Sync ====================

    /// Run one drain pass now
    pub async fn sync_now(&self) -> DrainReport {
        self.inner.sync_now().await
    }

    /// Drop every queued action, rolling back their optimistic edits
    pub async fn clear_queue(&self) -> StorageResult<usize> {
        let actions = self.inner.queue.snapshot();
        for action in &actions {
            self.inner.engine.rollback(action, "discarded").await?;
        }
        self.inner.queue.clear().await?;
        info!("Discarded {} queued actions", actions.len());
        Ok(actions.len())
    }

    /// Spawn the background worker; no-op if it is already running
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }
        let (commands, command_rx) = mpsc::channel(4);
        let handle = tokio::spawn(Arc::clone(&self.inner).run(command_rx));
        *worker = Some(Worker { commands, handle });
    }

    /// Stop the worker and close the event connection
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.commands.send(WorkerCommand::Shutdown).await;
            if let Err(e) = worker.handle.await {
                warn!("Sync worker ended abnormally: {}", e);
            }
        }
        self.inner.channel.disconnect().await;
    }

    // ==================== Reads ====================

    pub fn pending_count(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.inner.queue.watch_size()
    }

    pub fn queued_actions(&self) -> Vec<QueuedAction> {
        self.inner.queue.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.channel.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.channel.watch_state()
    }

    pub fn cached(&self, key: &EntityKey) -> Option<Value> {
        self.inner.engine.cache().get(key)
    }

    /// Load a persisted collection into memory; returns how many entities
    pub async fn load_collection(&self, entity_type: &str) -> StorageResult<usize> {
        self.inner.engine.cache().hydrate(entity_type).await
    }

    pub fn entities(&self, entity_type: &str) -> Vec<(EntityKey, Value)> {
        self.inner.engine.cache().entries_of(entity_type)
    }

    pub fn subscribe_cache(&self, filter: CacheFilter) -> CacheSubscription {
        self.inner.engine.cache().subscribe(filter)
    }

    pub fn on_event<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.channel.registry().on_event(event_type, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.channel.registry().on_any(handler)
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }
}

impl Shared {
    async fn sync_now(&self) -> DrainReport {
        let report = self
            .queue
            .drain(|action| async move {
                let response = match self.transport.send(&request_for(&action)).await {
                    Ok(response) => response,
                    Err(e) => return Err(e.into_send_failure()),
                };
                // Accepted by the server either way; a local write failure
                // must not cause a resend
                if let Err(e) = self.engine.confirm(&action, response.body.as_ref()).await {
                    warn!("Failed to record confirmation of {}: {}", action.id, e);
                }
                Ok(())
            })
            .await;

        for dropped in &report.dropped {
            if let Err(e) = self.engine.rollback(&dropped.action, &dropped.reason).await {
                warn!("Failed to roll back {}: {}", dropped.action.entity_key(), e);
            }
        }

        if !report.skipped && (!report.sent.is_empty() || !report.dropped.is_empty()) {
            info!(
                "Sync pass: {} sent, {} rescheduled, {} dropped, {} left",
                report.sent.len(),
                report.rescheduled.len(),
                report.dropped.len(),
                self.queue.size()
            );
        }
        report
    }

    /// Connect the event channel while signed in, disconnect otherwise
    async fn sync_realtime(&self) {
        if !self.realtime_enabled {
            return;
        }
        if self.transport.is_authenticated() {
            let transport = Arc::clone(&self.transport);
            self.channel.connect(Arc::new(move || transport.access_token()));
        } else {
            self.channel.disconnect().await;
        }
    }

    async fn drain_if_online(&self) {
        if self.network.is_online() {
            self.sync_now().await;
        }
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<WorkerCommand>) {
        let mut online = self.network.watch();
        let mut session = self.transport.watch_session();

        let (event_tx, mut events) = mpsc::unbounded_channel();
        let _forward = self.channel.registry().on_any(move |event| {
            let _ = event_tx.send(event.clone());
        });

        info!("Sync worker started");
        self.sync_realtime().await;
        self.drain_if_online().await;

        loop {
            let retry_in = self.queue.next_due_in();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Shutdown) | None => break,
                },
                _ = self.kick.notified() => {
                    self.drain_if_online().await;
                }
                Ok(()) = online.changed() => {
                    if *online.borrow_and_update() {
                        info!("Back online, resuming sync");
                        self.sync_realtime().await;
                        self.sync_now().await;
                    }
                }
                Ok(()) = session.changed() => {
                    let signed_in = *session.borrow_and_update();
                    self.sync_realtime().await;
                    if signed_in {
                        self.drain_if_online().await;
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.dispatcher.dispatch(&event).await {
                        warn!("Failed to apply event {}: {}", event.event_type, e);
                    }
                }
                _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {
                    self.drain_if_online().await;
                }
            }
        }

        info!("Sync worker stopped");
    }
}

/// REST request for a queued action
///
/// Collections live at `/{type}`, entities at `/{type}/{id}`. The action id
/// doubles as the idempotency key so a resend after a lost response is safe.
fn request_for(action: &QueuedAction) -> Request {
    let collection = format!("/{}", action.entity_type);
    let entity = format!("{}/{}", collection, action.entity_id);
    let request = match action.kind {
        ActionKind::Create => Request::post(collection, action.payload.clone()),
        ActionKind::Update => Request::patch(entity, action.payload.clone()),
        ActionKind::Delete => Request::delete(entity),
    };
    request.with_header("Idempotency-Key", action.id.clone())
}
