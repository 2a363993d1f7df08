//! Session credentials and their persistence

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{DurableStore, StorageResult, AUTH_NAMESPACE};

const CREDENTIALS_KEY: &str = "credentials";

/// Bearer token pair for the current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialSet {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// True if the access token expires before `now + horizon`
    pub fn expires_within(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now + horizon)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_within(now, Duration::zero())
    }
}

/// Token pair as returned by the login and refresh endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    #[serde(alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default, alias = "expires_in")]
    expires_in: Option<i64>,
    #[serde(default, alias = "expires_at")]
    expires_at: Option<DateTime<Utc>>,
}

impl TokenResponse {
    /// Build credentials; a response without a refresh token keeps the old one
    pub(crate) fn into_credentials(self, previous_refresh: Option<&str>, now: DateTime<Utc>) -> Option<CredentialSet> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))?;
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| now + Duration::seconds(secs)));
        Some(CredentialSet {
            access_token: self.access_token,
            refresh_token,
            expires_at,
        })
    }
}

/// Holds the live credential set and mirrors it into the `auth` namespace
pub struct CredentialVault {
    store: Arc<dyn DurableStore>,
    current: RwLock<Option<CredentialSet>>,
}

impl CredentialVault {
    /// Restore a persisted session, if there is a readable one
    pub async fn load(store: Arc<dyn DurableStore>) -> StorageResult<Self> {
        let current = match store.get(AUTH_NAMESPACE, CREDENTIALS_KEY).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(creds) => Some(creds),
                Err(e) => {
                    warn!("Discarding unreadable credentials: {}", e);
                    store.delete(AUTH_NAMESPACE, CREDENTIALS_KEY).await?;
                    None
                }
            },
            Ok(None) => None,
            Err(e) if matches!(e, crate::storage::StorageError::CorruptValue { .. }) => {
                warn!("Discarding unreadable credentials: {}", e);
                store.delete(AUTH_NAMESPACE, CREDENTIALS_KEY).await?;
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            current: RwLock::new(current),
        })
    }

    pub fn current(&self) -> Option<CredentialSet> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().map(|c| c.access_token)
    }

    /// Swap in a new credential set
    ///
    /// The in-memory copy is updated even if persisting fails, so the running
    /// session keeps working; the error tells the caller it won't survive a
    /// restart.
    pub async fn replace(&self, creds: CredentialSet) -> StorageResult<()> {
        let value = serde_json::to_value(&creds)?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(creds);
        self.store.set(AUTH_NAMESPACE, CREDENTIALS_KEY, value).await
    }

    /// Forget the session; returns whether there was one
    pub async fn clear(&self) -> StorageResult<bool> {
        let had = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        self.store.delete(AUTH_NAMESPACE, CREDENTIALS_KEY).await?;
        Ok(had)
    }
}
