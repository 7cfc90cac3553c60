// Backend collaborator contract: auth, persistence and fan-out live in the hosted service.
// The controller only ever talks to it through `Backend`.

mod error;
mod hosted;
mod memory;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{AuthError, BackendError, HostedInitError};
pub use hosted::{HostedBackend, HostedBackendOptions};
pub use memory::{CallCounts, MemoryBackend};

/// Table the live feed subscribes to.
pub const MESSAGES_TABLE: &str = "messages";

/// Authenticated identity held by the controller between sign-in and sign-out.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
    pub user_id: String,
    pub email: String,
}

impl Session {
    pub fn expires_within(&self, now_secs: i64, margin_secs: i64) -> bool {
        self.expires_at
            .map(|at| at <= now_secs + margin_secs)
            .unwrap_or(false)
    }
}

// Tokens never reach logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A chat message as persisted by the backend. Never mutated once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Unix milliseconds.
    pub created_at: i64,
    pub content: String,
    pub user_id: String,
    pub user_email: String,
}

impl Message {
    /// Feed ordering key: `created_at` ascending, `id` breaks ties.
    pub fn order_key(&self) -> (i64, i64) {
        (self.created_at, self.id)
    }
}

/// Insert payload; the backend assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessage {
    pub content: String,
    pub user_id: String,
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

pub type AuthCallback = Box<dyn Fn(Option<Session>) + Send + Sync>;
pub type InsertCallback = Box<dyn Fn(Message) + Send + Sync>;

/// Handle to a standing backend subscription. Closing (or dropping) releases it.
pub struct Subscription {
    label: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(label: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.release.is_some()
    }

    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!(label = %self.label, "subscription released");
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    /// Creates the account; confirmation happens out of band (email link).
    async fn register(&self, email: &str, password: &str) -> Result<(), AuthError>;

    async fn deauthenticate(&self) -> Result<(), AuthError>;

    /// Session left over from a previous run, if the backend keeps one.
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    /// Fires on sign-in, sign-out, token refresh and expiry.
    fn subscribe_to_auth_changes(&self, callback: AuthCallback) -> Subscription;

    /// Full history ordered by `created_at` ascending.
    async fn query_messages(&self) -> Result<Vec<Message>, BackendError>;

    async fn query_profiles(&self, ids: &BTreeSet<String>) -> Result<Vec<Profile>, BackendError>;

    async fn insert_message(&self, message: NewMessage) -> Result<Message, BackendError>;

    async fn subscribe_to_inserts(
        &self,
        table: &str,
        on_insert: InsertCallback,
    ) -> Result<Subscription, BackendError>;
}
