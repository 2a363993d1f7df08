//! Resilient request pipeline
//!
//! Every request passes through the same ordered steps:
//!
//! 1. **Offline check**: a device known to be offline fails fast with
//!    `Retryable(NetworkAbsent)`
//! 2. **Credentials**: the bearer token is attached; a token expiring within
//!    the refresh horizon is refreshed first
//! 3. **401**: one shared refresh for all concurrently failing requests, then
//!    a single retry with the new token
//! 4. **429**: wait for the server's hint (or a default) and retry once; a
//!    hint longer than `max_rate_limit_wait` is returned to the caller instead
//! 5. **5xx**: reads are retried once after a short delay; writes are not
//! 6. **Classification** into [`TransportError`]
//!
//! Only the action queue turns a `Retryable` result into a delayed retry.

mod credentials;
mod error;
mod http;

pub use credentials::{CredentialSet, CredentialVault};
pub use error::{RetryReason, TransportError};
pub use http::{BackendError, HttpBackend, Method, ReqwestBackend, Request, Response};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::network::NetworkObserver;
use crate::notify::{Notification, Notifier};

use credentials::TokenResponse;

/// Timing and endpoint policy for [`Transport`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub request_timeout: Duration,
    /// Refresh proactively when the token expires within this window
    pub refresh_horizon: chrono::Duration,
    /// Wait used for a 429 without a usable `Retry-After`
    pub rate_limit_fallback: Duration,
    /// Longest 429 hint honored inline; longer ones go back to the caller
    pub max_rate_limit_wait: Duration,
    /// Pause before re-issuing a read that got a 5xx
    pub server_retry_delay: Duration,
    pub login_path: String,
    pub refresh_path: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            refresh_horizon: chrono::Duration::minutes(5),
            rate_limit_fallback: Duration::from_secs(5),
            max_rate_limit_wait: Duration::from_secs(30),
            server_retry_delay: Duration::from_secs(1),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
        }
    }
}

/// Owns the credential set and every outgoing request
pub struct Transport {
    backend: Arc<dyn HttpBackend>,
    vault: CredentialVault,
    network: Arc<dyn NetworkObserver>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    settings: TransportSettings,
    /// Outcome of the most recent refresh, handed to callers that queued behind it
    refresh_gate: tokio::sync::Mutex<Option<Result<String, TransportError>>>,
    refresh_generation: AtomicU64,
    refreshes: AtomicUsize,
    session_tx: watch::Sender<bool>,
}

impl Transport {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        vault: CredentialVault,
        network: Arc<dyn NetworkObserver>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        settings: TransportSettings,
    ) -> Self {
        let (session_tx, _rx) = watch::channel(vault.current().is_some());
        Self {
            backend,
            vault,
            network,
            clock,
            notifier,
            settings,
            refresh_gate: tokio::sync::Mutex::new(None),
            refresh_generation: AtomicU64::new(0),
            refreshes: AtomicUsize::new(0),
            session_tx,
        }
    }

    /// Send `request` through the full pipeline
    pub async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        if !self.network.is_online() {
            return Err(TransportError::Retryable(RetryReason::NetworkAbsent {
                offline: true,
            }));
        }

        let mut token = if request.authenticated {
            Some(self.ensure_fresh().await?)
        } else {
            None
        };

        let mut response = self.execute(request, token.as_deref()).await?;

        if response.status == 401 {
            if let Some(rejected) = token.take() {
                debug!("{} {} got 401, refreshing", request.method.as_str(), request.path);
                let fresh = match self.refresh_single_flight(&rejected).await {
                    Ok(fresh) => fresh,
                    Err(TransportError::Retryable(reason)) => {
                        self.expire_session(&format!("refresh failed: {}", reason)).await;
                        return Err(TransportError::SessionExpired);
                    }
                    Err(e) => return Err(e),
                };
                response = self.execute(request, Some(&fresh)).await?;
                if response.status == 401 {
                    self.expire_session("token rejected after refresh").await;
                    return Err(TransportError::SessionExpired);
                }
                token = Some(fresh);
            }
        }

        if response.status == 429 {
            let wait = response
                .retry_after(self.clock.now())
                .unwrap_or(self.settings.rate_limit_fallback);
            if wait > self.settings.max_rate_limit_wait {
                info!("Rate limited on {} for {:?}, deferring", request.path, wait);
                return Err(TransportError::Retryable(RetryReason::RateLimited {
                    retry_after: Some(wait),
                }));
            }
            info!("Rate limited on {}, retrying in {:?}", request.path, wait);
            tokio::time::sleep(wait).await;

            response = self.execute(request, token.as_deref()).await?;
            if response.status == 429 {
                return Err(TransportError::Retryable(RetryReason::RateLimited {
                    retry_after: response.retry_after(self.clock.now()),
                }));
            }
        }

        if response.status >= 500 && request.method.is_idempotent() {
            debug!("{} on {}, retrying read once", response.status, request.path);
            tokio::time::sleep(self.settings.server_retry_delay).await;
            response = self.execute(request, token.as_deref()).await?;
        }

        classify(response)
    }

    /// Exchange a username and password for a new session
    pub async fn login(&self, username: &str, password: &str) -> Result<(), TransportError> {
        let request = Request::post(
            self.settings.login_path.clone(),
            json!({"username": username, "password": password}),
        )
        .unauthenticated();
        let response = self.send(&request).await?;

        let creds = response
            .body
            .and_then(|body| serde_json::from_value::<TokenResponse>(body).ok())
            .and_then(|tokens| tokens.into_credentials(None, self.clock.now()))
            .ok_or_else(|| TransportError::Fatal("login response did not contain tokens".to_string()))?;

        self.store_credentials(creds).await?;
        info!("Signed in as {}", username);
        Ok(())
    }

    /// Adopt tokens obtained elsewhere
    pub async fn set_credentials(&self, creds: CredentialSet) -> Result<(), TransportError> {
        self.store_credentials(creds).await
    }

    pub async fn logout(&self) {
        if let Err(e) = self.vault.clear().await {
            warn!("Failed to clear stored credentials: {}", e);
        }
        self.session_tx.send_replace(false);
        info!("Signed out");
    }

    pub fn is_authenticated(&self) -> bool {
        self.vault.current().is_some()
    }

    /// Flips to `false` when the session ends, `true` when one starts
    pub fn watch_session(&self) -> watch::Receiver<bool> {
        self.session_tx.subscribe()
    }

    pub fn credentials(&self) -> Option<CredentialSet> {
        self.vault.current()
    }

    pub fn access_token(&self) -> Option<String> {
        self.vault.access_token()
    }

    /// Number of refresh calls issued to the server so far
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Current access token, refreshed first if it is about to expire
    async fn ensure_fresh(&self) -> Result<String, TransportError> {
        let creds = self.vault.current().ok_or(TransportError::SessionExpired)?;
        let now = self.clock.now();
        if !creds.expires_within(now, self.settings.refresh_horizon) {
            return Ok(creds.access_token);
        }

        debug!("Access token expires soon, refreshing");
        match self.refresh_single_flight(&creds.access_token).await {
            Ok(token) => Ok(token),
            Err(TransportError::Retryable(reason)) if !creds.is_expired(now) => {
                debug!("Refresh unavailable ({}), using current token", reason);
                Ok(creds.access_token)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh unless someone else already replaced `stale`
    ///
    /// Callers queue on `refresh_gate`; whoever gets it first talks to the
    /// server. A caller that was waiting while that refresh ran takes its
    /// outcome, success or failure, instead of issuing another one.
    async fn refresh_single_flight(&self, stale: &str) -> Result<String, TransportError> {
        let seen = self.refresh_generation.load(Ordering::SeqCst);
        let mut last = self.refresh_gate.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != seen {
            if let Some(outcome) = last.as_ref() {
                return outcome.clone();
            }
        }

        let creds = match self.vault.current() {
            None => return Err(TransportError::SessionExpired),
            Some(creds) if creds.access_token != stale => return Ok(creds.access_token),
            Some(creds) => creds,
        };

        let outcome = self.refresh(&creds).await;
        *last = Some(outcome.clone());
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// One refresh exchange; a rejection clears the session
    async fn refresh(&self, creds: &CredentialSet) -> Result<String, TransportError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let request = Request::post(
            self.settings.refresh_path.clone(),
            json!({"refreshToken": creds.refresh_token}),
        )
        .unauthenticated();

        let response = match self.execute(&request, None).await {
            Ok(response) => response,
            Err(TransportError::Retryable(reason)) => {
                warn!("Token refresh unreachable: {}", reason);
                return Err(TransportError::Retryable(reason));
            }
            Err(e) => {
                self.expire_session(&e.to_string()).await;
                return Err(TransportError::SessionExpired);
            }
        };

        if response.status == 429 || response.status >= 500 {
            warn!("Token refresh failed with {}", response.status);
            return Err(TransportError::Retryable(RetryReason::ServerError {
                status: response.status,
            }));
        }

        let refreshed = response
            .is_success()
            .then_some(response.body)
            .flatten()
            .and_then(|body| serde_json::from_value::<TokenResponse>(body).ok())
            .and_then(|tokens| tokens.into_credentials(Some(&creds.refresh_token), self.clock.now()));

        match refreshed {
            Some(new_creds) => {
                let token = new_creds.access_token.clone();
                if let Err(e) = self.vault.replace(new_creds).await {
                    warn!("Refreshed token could not be persisted: {}", e);
                }
                info!("Access token refreshed");
                Ok(token)
            }
            None => {
                self.expire_session(&format!("refresh rejected with {}", response.status))
                    .await;
                Err(TransportError::SessionExpired)
            }
        }
    }

    async fn expire_session(&self, reason: &str) {
        let had_session = match self.vault.clear().await {
            Ok(had) => had,
            Err(e) => {
                warn!("Failed to clear stored credentials: {}", e);
                true
            }
        };
        self.session_tx.send_replace(false);
        if had_session {
            warn!("Session expired: {}", reason);
            self.notifier.notify(Notification::SessionExpired);
        }
    }

    async fn store_credentials(&self, creds: CredentialSet) -> Result<(), TransportError> {
        let result = self.vault.replace(creds).await;
        self.session_tx.send_replace(true);
        result.map_err(|e| TransportError::Fatal(format!("could not store credentials: {}", e)))
    }

    /// One exchange with a timeout; no response at all is `NetworkAbsent`
    async fn execute(&self, request: &Request, bearer: Option<&str>) -> Result<Response, TransportError> {
        let absent = || {
            TransportError::Retryable(RetryReason::NetworkAbsent {
                offline: !self.network.is_online(),
            })
        };

        match tokio::time::timeout(
            self.settings.request_timeout,
            self.backend.execute(request, bearer),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(BackendError::InvalidRequest(details))) => Err(TransportError::Fatal(details)),
            Ok(Err(e)) => {
                debug!("{} {} failed: {}", request.method.as_str(), request.path, e);
                Err(absent())
            }
            Err(_) => {
                debug!("{} {} timed out", request.method.as_str(), request.path);
                Err(absent())
            }
        }
    }
}

fn classify(response: Response) -> Result<Response, TransportError> {
    match response.status {
        200..=299 => Ok(response),
        429 => Err(TransportError::Retryable(RetryReason::RateLimited {
            retry_after: None,
        })),
        500..=599 => Err(TransportError::Retryable(RetryReason::ServerError {
            status: response.status,
        })),
        400..=499 => Err(TransportError::ClientError {
            status: response.status,
            body: response.body,
        }),
        other => Err(TransportError::Fatal(format!("unexpected status {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::network::NetworkStatus;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures_util::future::join_all;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&Request, Option<&str>) -> Response + Send + Sync>;

    /// Answers from a closure, optionally after a delay per path
    struct ScriptedBackend {
        handler: Handler,
        delays: Vec<(String, Duration)>,
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedBackend {
        fn new(handler: impl Fn(&Request, Option<&str>) -> Response + Send + Sync + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                delays: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, path: &str, delay: Duration) -> Self {
            self.delays.push((path.to_string(), delay));
            self
        }

        fn calls_to(&self, path: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|(p, _)| p == path).count()
        }
    }

    #[async_trait]
    impl HttpBackend for ScriptedBackend {
        async fn execute(&self, request: &Request, bearer: Option<&str>) -> Result<Response, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.path.clone(), bearer.map(str::to_string)));
            if let Some((_, delay)) = self.delays.iter().find(|(p, _)| *p == request.path) {
                tokio::time::sleep(*delay).await;
            }
            Ok((self.handler)(request, bearer))
        }
    }

    struct Setup {
        transport: Arc<Transport>,
        backend: Arc<ScriptedBackend>,
        network: Arc<NetworkStatus>,
        clock: Arc<ManualClock>,
        notifier: Notifier,
    }

    async fn setup(backend: ScriptedBackend, creds: Option<CredentialSet>) -> Setup {
        let backend = Arc::new(backend);
        let network = Arc::new(NetworkStatus::online());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Notifier::default();
        let vault = CredentialVault::load(Arc::new(MemoryStore::new())).await.unwrap();
        if let Some(creds) = creds {
            vault.replace(creds).await.unwrap();
        }
        let transport = Transport::new(
            backend.clone(),
            vault,
            network.clone(),
            clock.clone(),
            notifier.clone(),
            TransportSettings::default(),
        );
        Setup {
            transport: Arc::new(transport),
            backend,
            network,
            clock,
            notifier,
        }
    }

    fn session() -> Option<CredentialSet> {
        Some(CredentialSet::new("old", "refresh-1", None))
    }

    fn token_pair(access: &str) -> Response {
        Response::new(200).with_body(json!({
            "accessToken": access,
            "refreshToken": "refresh-2",
            "expiresIn": 3600
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_one_refresh() {
        let backend = ScriptedBackend::new(|req, bearer| match (req.path.as_str(), bearer) {
            ("/auth/refresh", _) => token_pair("new"),
            (_, Some("new")) => Response::new(200).with_body(json!({"ok": true})),
            _ => Response::new(401),
        })
        .with_delay("/auth/refresh", Duration::from_millis(200));
        let s = setup(backend, session()).await;

        let requests: Vec<Request> = (0..5).map(|i| Request::get(format!("/tasks/{}", i))).collect();
        let results = join_all(requests.iter().map(|r| s.transport.send(r))).await;

        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|resp| resp.status == 200)));
        assert_eq!(s.transport.refresh_count(), 1);
        assert_eq!(s.backend.calls_to("/auth/refresh"), 1);
        assert_eq!(s.transport.access_token().as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_expires_every_waiter() {
        let backend = ScriptedBackend::new(|req, _| match req.path.as_str() {
            "/auth/refresh" => Response::new(401),
            _ => Response::new(401),
        })
        .with_delay("/auth/refresh", Duration::from_millis(200));
        let s = setup(backend, session()).await;
        let mut notifications = s.notifier.subscribe();

        let requests: Vec<Request> = (0..4).map(|i| Request::get(format!("/tasks/{}", i))).collect();
        let results = join_all(requests.iter().map(|r| s.transport.send(r))).await;

        assert!(results
            .iter()
            .all(|r| matches!(r, Err(TransportError::SessionExpired))));
        assert_eq!(s.transport.refresh_count(), 1);
        assert!(!s.transport.is_authenticated());
        assert!(!*s.transport.watch_session().borrow());
        assert_eq!(notifications.try_recv().unwrap(), Notification::SessionExpired);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_refresh_after_401_fails_whole_batch_once() {
        let backend = ScriptedBackend::new(|req, _| match req.path.as_str() {
            "/auth/refresh" => Response::new(503),
            _ => Response::new(401),
        })
        .with_delay("/auth/refresh", Duration::from_millis(200));
        let s = setup(backend, session()).await;
        let mut notifications = s.notifier.subscribe();

        let requests: Vec<Request> = (0..5).map(|i| Request::get(format!("/tasks/{}", i))).collect();
        let results = join_all(requests.iter().map(|r| s.transport.send(r))).await;

        assert_eq!(s.backend.calls_to("/auth/refresh"), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(TransportError::SessionExpired))));
        assert!(s.transport.credentials().is_none());
        assert_eq!(notifications.try_recv().unwrap(), Notification::SessionExpired);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_proactive_refresh_is_shared_by_waiters() {
        let backend = ScriptedBackend::new(|req, bearer| match req.path.as_str() {
            "/auth/refresh" => Response::new(503),
            _ if bearer == Some("old") => Response::new(200),
            _ => Response::new(401),
        })
        .with_delay("/auth/refresh", Duration::from_millis(200));
        let now = Utc::now();
        let s = setup(
            backend,
            Some(CredentialSet::new("old", "r", Some(now + chrono::Duration::minutes(2)))),
        )
        .await;
        s.clock.set(now);

        let requests: Vec<Request> = (0..3).map(|i| Request::get(format!("/tasks/{}", i))).collect();
        let results = join_all(requests.iter().map(|r| s.transport.send(r))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(s.backend.calls_to("/auth/refresh"), 1);
        assert!(s.transport.is_authenticated());
    }

    #[tokio::test]
    async fn test_second_401_after_refresh_expires_session() {
        let backend = ScriptedBackend::new(|req, _| match req.path.as_str() {
            "/auth/refresh" => token_pair("new"),
            _ => Response::new(401),
        });
        let s = setup(backend, session()).await;

        let err = s.transport.send(&Request::get("/profile")).await.unwrap_err();
        assert_eq!(err, TransportError::SessionExpired);
        assert!(s.transport.credentials().is_none());
    }

    #[tokio::test]
    async fn test_proactive_refresh_before_expiry() {
        let backend = ScriptedBackend::new(|req, bearer| match req.path.as_str() {
            "/auth/refresh" => token_pair("fresh"),
            _ if bearer == Some("fresh") => Response::new(200),
            _ => Response::new(401),
        });
        let clock_start = Utc::now();
        let s = setup(
            backend,
            Some(CredentialSet::new(
                "old",
                "refresh-1",
                Some(clock_start + chrono::Duration::minutes(3)),
            )),
        )
        .await;
        s.clock.set(clock_start);

        s.transport.send(&Request::get("/tasks")).await.unwrap();

        assert_eq!(s.transport.refresh_count(), 1);
        let creds = s.transport.credentials().unwrap();
        assert_eq!(creds.refresh_token, "refresh-2");
        assert_eq!(creds.expires_at, Some(clock_start + chrono::Duration::seconds(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_unreachable_keeps_valid_token() {
        let backend = ScriptedBackend::new(|req, bearer| match req.path.as_str() {
            "/auth/refresh" => Response::new(503),
            _ if bearer == Some("old") => Response::new(200),
            _ => Response::new(401),
        });
        let now = Utc::now();
        let s = setup(
            backend,
            Some(CredentialSet::new("old", "r", Some(now + chrono::Duration::minutes(2)))),
        )
        .await;
        s.clock.set(now);

        assert!(s.transport.send(&Request::get("/tasks")).await.is_ok());
        assert!(s.transport.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_429_waits_hint_then_returns_retryable() {
        let backend = ScriptedBackend::new(|_, _| Response::new(429).with_header("Retry-After", "2"));
        let s = setup(backend, session()).await;

        let started = tokio::time::Instant::now();
        let err = s
            .transport
            .send(&Request::post("/tasks", json!({"title": "x"})))
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
        assert_eq!(s.backend.calls_to("/tasks"), 2);
        assert_eq!(
            err,
            TransportError::Retryable(RetryReason::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_429_hint_is_not_waited_inline() {
        let backend =
            ScriptedBackend::new(|_, _| Response::new(429).with_header("Retry-After", "86400"));
        let s = setup(backend, session()).await;

        let started = tokio::time::Instant::now();
        let err = s
            .transport
            .send(&Request::post("/tasks", json!({"title": "x"})))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(s.backend.calls_to("/tasks"), 1);
        assert_eq!(
            err,
            TransportError::Retryable(RetryReason::RateLimited {
                retry_after: Some(Duration::from_secs(86400))
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_429_without_hint_uses_fallback() {
        let hits = AtomicUsize::new(0);
        let backend = ScriptedBackend::new(move |_, _| {
            if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                Response::new(429)
            } else {
                Response::new(201)
            }
        });
        let s = setup(backend, session()).await;

        let started = tokio::time::Instant::now();
        let response = s.transport.send(&Request::post("/tasks", json!({}))).await.unwrap();

        assert_eq!(response.status, 201);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_retries_reads_only() {
        let reads = AtomicUsize::new(0);
        let backend = ScriptedBackend::new(move |req, _| match req.method {
            Method::Get if reads.fetch_add(1, Ordering::SeqCst) == 0 => Response::new(503),
            Method::Get => Response::new(200),
            _ => Response::new(503),
        });
        let s = setup(backend, session()).await;

        assert!(s.transport.send(&Request::get("/tasks")).await.is_ok());
        assert_eq!(s.backend.calls_to("/tasks"), 2);

        let err = s
            .transport
            .send(&Request::post("/logs", json!({"steps": 10})))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Retryable(RetryReason::ServerError { status: 503 }));
        assert_eq!(s.backend.calls_to("/logs"), 1);
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let s = setup(ScriptedBackend::new(|_, _| Response::new(200)), session()).await;
        s.network.set_online(false);

        let err = s.transport.send(&Request::get("/tasks")).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Retryable(RetryReason::NetworkAbsent { offline: true })
        );
        assert!(s.backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_network_absent() {
        let backend = ScriptedBackend::new(|_, _| Response::new(200))
            .with_delay("/slow", Duration::from_secs(60));
        let s = setup(backend, session()).await;

        let err = s.transport.send(&Request::post("/slow", json!({}))).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Retryable(RetryReason::NetworkAbsent { offline: false })
        );
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let backend = ScriptedBackend::new(|_, _| Response::new(422).with_body(json!({"error": "title required"})));
        let s = setup(backend, session()).await;

        let err = s.transport.send(&Request::post("/tasks", json!({}))).await.unwrap_err();
        assert!(matches!(err, TransportError::ClientError { status: 422, .. }));
        assert_eq!(s.backend.calls_to("/tasks"), 1);
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let backend = ScriptedBackend::new(|req, bearer| match req.path.as_str() {
            "/auth/login" if bearer.is_none() => token_pair("a1"),
            _ => Response::new(404),
        });
        let s = setup(backend, None).await;
        assert!(matches!(
            s.transport.send(&Request::get("/tasks")).await,
            Err(TransportError::SessionExpired)
        ));

        s.transport.login("sam", "hunter2").await.unwrap();
        assert_eq!(s.transport.access_token().as_deref(), Some("a1"));
        assert!(*s.transport.watch_session().borrow());

        s.transport.logout().await;
        assert!(!s.transport.is_authenticated());
    }
}
