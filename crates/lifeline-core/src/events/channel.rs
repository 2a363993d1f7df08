//! Reconnecting event channel
//!
//! One background task owns the connection, so connection attempts never
//! overlap. State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     ^            |  error / closed by peer
//!                     |            v
//!                     +------- Backoff   (delay = min(base * 2^attempt, cap))
//! ```
//!
//! Reaching `Connected` resets the attempt counter. After `max_attempts`
//! consecutive failed reconnects the task stops in `Disconnected` and raises
//! a single "real-time updates unavailable" notification.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChannelError, EventRegistry, EventSource};
use crate::backoff::Backoff;
use crate::notify::{Notification, Notifier};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Not connected, not trying
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and receiving events
    Connected,
    /// Waiting before the next attempt
    Backoff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub backoff: Backoff,
    /// Consecutive failed reconnects before giving up
    pub max_attempts: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 10,
        }
    }
}

/// Supplies the current access token for each connection attempt
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Commands sent to the channel task
#[derive(Debug)]
enum ChannelCommand {
    Disconnect,
}

struct RunningTask {
    commands: mpsc::Sender<ChannelCommand>,
    handle: JoinHandle<()>,
}

/// Long-lived push connection delivering events to an [`EventRegistry`]
pub struct EventChannel {
    source: Arc<dyn EventSource>,
    registry: EventRegistry,
    notifier: Notifier,
    settings: ChannelSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    attempt: Arc<AtomicU32>,
    task: Mutex<Option<RunningTask>>,
}

impl EventChannel {
    pub fn new(
        source: Arc<dyn EventSource>,
        registry: EventRegistry,
        notifier: Notifier,
        settings: ChannelSettings,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            registry,
            notifier,
            settings,
            state_tx: Arc::new(state_tx),
            attempt: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Start the connection task; no-op if one is already running
    pub fn connect(&self, token: TokenProvider) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Event channel already running");
            return;
        }

        let (commands, command_rx) = mpsc::channel(4);
        let worker = ChannelLoop {
            source: Arc::clone(&self.source),
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
            settings: self.settings,
            state_tx: Arc::clone(&self.state_tx),
            attempt: Arc::clone(&self.attempt),
        };
        let handle = tokio::spawn(worker.run(token, command_rx));
        *task = Some(RunningTask { commands, handle });
    }

    /// Stop the connection task and any pending backoff timer
    ///
    /// Safe to call in any state, including when nothing is running.
    pub async fn disconnect(&self) {
        let running = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            let _ = running.commands.send(ChannelCommand::Disconnect).await;
            if let Err(e) = running.handle.await {
                warn!("Event channel task ended abnormally: {}", e);
            }
        }
        self.state_tx.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }
}

struct ChannelLoop {
    source: Arc<dyn EventSource>,
    registry: EventRegistry,
    notifier: Notifier,
    settings: ChannelSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    attempt: Arc<AtomicU32>,
}

impl ChannelLoop {
    async fn run(self, token: TokenProvider, mut commands: mpsc::Receiver<ChannelCommand>) {
        let mut attempt: u32 = 0;
        self.attempt.store(0, Ordering::SeqCst);

        loop {
            self.set_state(ConnectionState::Connecting);

            let opened = tokio::select! {
                opened = self.source.open(token()) => opened,
                _ = commands.recv() => break,
            };

            match opened {
                Ok(mut stream) => {
                    attempt = 0;
                    self.attempt.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    info!("Event channel connected");

                    let failure = loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(event)) => {
                                    debug!("Event received: {}", event.event_type);
                                    self.registry.deliver(&event);
                                }
                                Some(Err(ChannelError::Decode(details))) => {
                                    warn!("Skipping malformed event: {}", details);
                                }
                                Some(Err(e)) => break Some(e),
                                None => break None,
                            },
                            _ = commands.recv() => {
                                self.set_state(ConnectionState::Disconnected);
                                info!("Event channel disconnected");
                                return;
                            }
                        }
                    };

                    match failure {
                        Some(e) => warn!("Event channel error: {}", e),
                        None => info!("Event channel closed by server"),
                    }
                }
                Err(e) => warn!("Event channel connect failed: {}", e),
            }

            if attempt >= self.settings.max_attempts {
                warn!(
                    "Event channel giving up after {} reconnect attempts",
                    attempt
                );
                self.set_state(ConnectionState::Disconnected);
                self.notifier.notify(Notification::RealtimeUnavailable);
                return;
            }

            let delay = self.settings.backoff.delay(attempt);
            attempt += 1;
            self.attempt.store(attempt, Ordering::SeqCst);
            self.set_state(ConnectionState::Backoff);
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = commands.recv() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Event channel disconnected");
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("Event channel {} -> {}", state, next);
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventStream, ServerEvent};
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    enum Script {
        /// Connection attempt fails
        Fail,
        /// Deliver these events, then the server closes the connection
        Close(Vec<ServerEvent>),
        /// Deliver these events and stay open
        Hold(Vec<ServerEvent>),
    }

    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Script>>,
        opens: AtomicUsize,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn open(&self, token: Option<String>) -> Result<EventStream, ChannelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(token);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Fail);
            match next {
                Script::Fail => Err(ChannelError::Connect("refused".to_string())),
                Script::Close(events) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
                Script::Hold(events) => Ok(stream::iter(events.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()),
            }
        }
    }

    fn channel(source: Arc<ScriptedSource>, max_attempts: u32) -> (EventChannel, Notifier) {
        let notifier = Notifier::default();
        let channel = EventChannel::new(
            source,
            EventRegistry::new(),
            notifier.clone(),
            ChannelSettings {
                backoff: Backoff::default(),
                max_attempts,
            },
        );
        (channel, notifier)
    }

    fn token() -> TokenProvider {
        Arc::new(|| Some("access-1".to_string()))
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
        loop {
            if *rx.borrow_and_update() == wanted {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_events_while_connected() {
        let source = ScriptedSource::new(vec![Script::Hold(vec![
            ServerEvent::new("task.updated", json!({"id": "t1"})),
            ServerEvent::new("badge.earned", json!({"id": "b1"})),
        ])]);
        let (channel, _) = channel(source.clone(), 10);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let typed_tx = tx.clone();
        let _typed = channel.registry().on_event("badge.earned", move |e| {
            let _ = typed_tx.send(format!("typed:{}", e.event_type));
        });
        let _any = channel.registry().on_any(move |e| {
            let _ = tx.send(format!("any:{}", e.event_type));
        });

        let mut state = channel.watch_state();
        channel.connect(token());
        wait_for(&mut state, ConnectionState::Connected).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec!["any:task.updated", "typed:badge.earned", "any:badge.earned"]);
        assert_eq!(source.tokens.lock().unwrap()[0].as_deref(), Some("access-1"));

        channel.disconnect().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_reconnect_resets_attempts() {
        let source = ScriptedSource::new(vec![Script::Fail, Script::Fail, Script::Hold(vec![])]);
        let (channel, _) = channel(source.clone(), 10);
        let mut state = channel.watch_state();

        let started = tokio::time::Instant::now();
        channel.connect(token());
        wait_for(&mut state, ConnectionState::Backoff).await;
        assert_eq!(channel.attempt(), 1);

        wait_for(&mut state, ConnectionState::Connected).await;
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(channel.attempt(), 0);
        assert_eq!(source.opens(), 3);

        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_triggers_reconnect() {
        let source = ScriptedSource::new(vec![
            Script::Close(vec![ServerEvent::new("task.deleted", json!({"id": "t1"}))]),
            Script::Hold(vec![]),
        ]);
        let (channel, _) = channel(source.clone(), 10);
        let mut state = channel.watch_state();

        channel.connect(token());
        wait_for(&mut state, ConnectionState::Backoff).await;
        wait_for(&mut state, ConnectionState::Connected).await;

        assert_eq!(source.opens(), 2);
        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let source = ScriptedSource::new(vec![]);
        let (channel, notifier) = channel(source.clone(), 3);
        let mut notifications = notifier.subscribe();

        channel.connect(token());
        assert_eq!(notifications.recv().await.unwrap(), Notification::RealtimeUnavailable);

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        // The first attempt plus three reconnects
        assert_eq!(source.opens(), 4);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_backoff_timer() {
        let source = ScriptedSource::new(vec![Script::Fail]);
        let (channel, _) = channel(source.clone(), 10);
        let mut state = channel.watch_state();

        channel.connect(token());
        wait_for(&mut state, ConnectionState::Backoff).await;
        channel.disconnect().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let (channel, _) = channel(ScriptedSource::new(vec![]), 10);
        channel.disconnect().await;
        channel.disconnect().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_is_ignored_while_running() {
        let source = ScriptedSource::new(vec![Script::Hold(vec![])]);
        let (channel, _) = channel(source.clone(), 10);
        let mut state = channel.watch_state();

        channel.connect(token());
        channel.connect(token());
        wait_for(&mut state, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(source.opens(), 1);
        channel.disconnect().await;
    }
}
