// REST + realtime client for the hosted backend-as-a-service.
//
// Auth lives under `/auth/v1`, table access under `/rest/v1`, live inserts on the
// `/realtime/v1/websocket` channel. The anon API key goes in the `apikey` header of every
// call; user-scoped calls add the session's bearer token.

mod realtime;
mod session_store;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{
    AuthCallback, AuthError, Backend, BackendError, HostedInitError, InsertCallback, Message,
    NewMessage, Profile, Session, Subscription,
};
use crate::state::now_seconds;

const REFRESH_MARGIN_SECS: i64 = 60;
const REFRESH_RETRY_SECS: u64 = 10;
const MIN_REFRESH_WAIT_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct HostedBackendOptions {
    pub endpoint_url: String,
    pub api_key: String,
    /// Where the session is persisted between runs. `None` keeps it in memory only.
    pub session_path: Option<PathBuf>,
    pub heartbeat: Duration,
    pub request_timeout: Duration,
}

impl HostedBackendOptions {
    pub fn new(endpoint_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            api_key: api_key.into(),
            session_path: None,
            heartbeat: Duration::from_secs(25),
            request_timeout: Duration::from_secs(15),
        }
    }
}

type Listeners = Mutex<HashMap<u64, Arc<AuthCallback>>>;

// State shared between the backend handle and its background tasks (token refresh,
// realtime channels).
struct Shared {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    session_path: Option<PathBuf>,
    session: Mutex<Option<Session>>,
    listeners: Listeners,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

pub struct HostedBackend {
    shared: Arc<Shared>,
    heartbeat: Duration,
    next_listener_id: AtomicU64,
}

impl HostedBackend {
    pub fn new(options: HostedBackendOptions) -> Result<Self, HostedInitError> {
        let mut base = Url::parse(options.endpoint_url.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                http,
                base,
                api_key: options.api_key,
                session_path: options.session_path,
                session: Mutex::new(None),
                listeners: Mutex::new(HashMap::new()),
                refresh_task: Mutex::new(None),
            }),
            heartbeat: options.heartbeat,
            next_listener_id: AtomicU64::new(1),
        })
    }

    fn bearer(&self) -> Result<String, BackendError> {
        lock(&self.shared.session)
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(BackendError::NotAuthenticated)
    }

    fn rest_url(&self, table: &str) -> Result<Url, BackendError> {
        self.shared
            .base
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

impl Drop for HostedBackend {
    fn drop(&mut self) {
        self.shared.cancel_refresh();
    }
}

impl Shared {
    fn auth_url(&self, path: &str) -> Result<Url, AuthError> {
        self.base
            .join(&format!("auth/v1/{path}"))
            .map_err(|e| AuthError::Rejected(e.to_string()))
    }

    async fn token_request(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Session, AuthError> {
        let mut url = self.auth_url("token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let resp = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(auth_error_from_body(status.as_u16(), &text));
        }
        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::Rejected(e.to_string()))?;
        Ok(token.into_session())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        self.token_request(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    fn store_session(&self, session: Option<Session>) {
        if let Some(path) = self.session_path.as_deref() {
            match session.as_ref() {
                Some(s) => {
                    if let Err(e) = session_store::save(path, s) {
                        tracing::warn!(%e, "failed to persist session");
                    }
                }
                None => session_store::clear(path),
            }
        }
        *lock(&self.session) = session;
    }

    fn notify(&self, session: Option<Session>) {
        let listeners: Vec<Arc<AuthCallback>> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(session.clone());
        }
    }

    fn cancel_refresh(&self) {
        if let Some(task) = lock(&self.refresh_task).take() {
            task.abort();
        }
    }
}

// Keeps the access token fresh. Must be called from inside the tokio runtime.
fn schedule_refresh(shared: &Arc<Shared>) {
    shared.cancel_refresh();
    let task_shared = shared.clone();
    let task = tokio::spawn(async move {
        loop {
            let Some(current) = lock(&task_shared.session).clone() else {
                return;
            };
            let (Some(expires_at), Some(refresh_token)) =
                (current.expires_at, current.refresh_token.clone())
            else {
                return;
            };
            let wait = (expires_at - now_seconds() - REFRESH_MARGIN_SECS).max(MIN_REFRESH_WAIT_SECS);
            tokio::time::sleep(Duration::from_secs(wait as u64)).await;

            match task_shared.refresh(&refresh_token).await {
                Ok(next) => {
                    tracing::info!(user_id = %next.user_id, "access token refreshed");
                    task_shared.store_session(Some(next.clone()));
                    task_shared.notify(Some(next));
                }
                Err(AuthError::Network(e)) => {
                    tracing::warn!(%e, "token refresh failed; retrying");
                    tokio::time::sleep(Duration::from_secs(REFRESH_RETRY_SECS)).await;
                }
                Err(e) => {
                    tracing::warn!(%e, "token refresh rejected; session expired");
                    task_shared.store_session(None);
                    task_shared.notify(None);
                    return;
                }
            }
        }
    });
    *lock(&shared.refresh_task) = Some(task);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: UserRecord,
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| now_seconds() + secs));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id: self.user.id,
            email: self.user.email.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

fn auth_error_from_body(status: u16, body: &str) -> AuthError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error_code
        .clone()
        .or_else(|| parsed.error.clone())
        .unwrap_or_default();
    let message = parsed
        .error_description
        .or(parsed.msg)
        .or(parsed.message)
        .or(parsed.error)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("Request failed ({status})"));

    if code == "email_not_confirmed" || message.eq_ignore_ascii_case("Email not confirmed") {
        AuthError::EmailNotConfirmed
    } else if code == "invalid_credentials"
        || message.eq_ignore_ascii_case("Invalid login credentials")
    {
        AuthError::InvalidCredentials
    } else {
        AuthError::Rejected(message)
    }
}

fn backend_error_from_body(status: u16, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.msg)
        .or(parsed.error_description)
        .or(parsed.error)
        .unwrap_or_else(|| body.chars().take(200).collect());
    BackendError::Status { status, message }
}

/// Row shape of the `messages` table, shared by REST responses and realtime records.
#[derive(Debug, Deserialize)]
pub(super) struct MessageRecord {
    id: i64,
    created_at: String,
    content: String,
    user_id: String,
    #[serde(default)]
    user_email: Option<String>,
}

impl MessageRecord {
    fn into_message(self) -> Result<Message, BackendError> {
        let created_at = parse_timestamp_ms(&self.created_at).ok_or_else(|| {
            BackendError::Decode(format!("bad created_at: {}", self.created_at))
        })?;
        Ok(Message {
            id: self.id,
            created_at,
            content: self.content,
            user_id: self.user_id,
            user_email: self.user_email.unwrap_or_default(),
        })
    }
}

/// Postgres `timestamptz` as emitted by REST (RFC 3339) or realtime (sometimes without
/// an offset, which means UTC).
pub(super) fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

/// PostgREST `in.(...)` filter with each id quoted.
fn in_filter(ids: &BTreeSet<String>) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "")))
        .collect();
    format!("in.({})", quoted.join(","))
}

#[async_trait]
impl Backend for HostedBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let session = self
            .shared
            .token_request(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        tracing::info!(user_id = %session.user_id, "signed in");
        self.shared.store_session(Some(session.clone()));
        schedule_refresh(&self.shared);
        self.shared.notify(Some(session.clone()));
        Ok(session)
    }

    async fn register(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let url = self.shared.auth_url("signup")?;
        let resp = self
            .shared
            .http
            .post(url)
            .header("apikey", &self.shared.api_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(auth_error_from_body(status.as_u16(), &text));
        }
        tracing::info!("sign-up accepted; confirmation pending");
        Ok(())
    }

    async fn deauthenticate(&self) -> Result<(), AuthError> {
        let token = lock(&self.shared.session)
            .as_ref()
            .map(|s| s.access_token.clone());
        self.shared.cancel_refresh();
        self.shared.store_session(None);
        self.shared.notify(None);

        let Some(token) = token else {
            return Ok(());
        };
        let url = self.shared.auth_url("logout")?;
        let resp = self
            .shared
            .http
            .post(url)
            .header("apikey", &self.shared.api_key)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(auth_error_from_body(status.as_u16(), &text));
        }
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let existing = lock(&self.shared.session).clone().or_else(|| {
            self.shared
                .session_path
                .as_deref()
                .and_then(session_store::load)
        });
        let Some(session) = existing else {
            return Ok(None);
        };

        let session = if session.expires_within(now_seconds(), REFRESH_MARGIN_SECS) {
            let Some(refresh_token) = session.refresh_token.clone() else {
                self.shared.store_session(None);
                return Ok(None);
            };
            match self.shared.refresh(&refresh_token).await {
                Ok(next) => next,
                Err(AuthError::Network(e)) => return Err(AuthError::Network(e)),
                Err(e) => {
                    tracing::info!(%e, "stored session could not be refreshed");
                    self.shared.store_session(None);
                    return Ok(None);
                }
            }
        } else {
            session
        };

        self.shared.store_session(Some(session.clone()));
        schedule_refresh(&self.shared);
        Ok(Some(session))
    }

    fn subscribe_to_auth_changes(&self, callback: AuthCallback) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.listeners).insert(id, Arc::new(callback));
        let shared = self.shared.clone();
        Subscription::new(format!("auth:{id}"), move || {
            lock(&shared.listeners).remove(&id);
        })
    }

    async fn query_messages(&self) -> Result<Vec<Message>, BackendError> {
        let token = self.bearer()?;
        let mut url = self.rest_url(super::MESSAGES_TABLE)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("order", "created_at.asc,id.asc");
        let resp = self
            .shared
            .http
            .get(url)
            .header("apikey", &self.shared.api_key)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(backend_error_from_body(status.as_u16(), &text));
        }
        let records: Vec<MessageRecord> =
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        records.into_iter().map(MessageRecord::into_message).collect()
    }

    async fn query_profiles(&self, ids: &BTreeSet<String>) -> Result<Vec<Profile>, BackendError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let token = self.bearer()?;
        let mut url = self.rest_url("profiles")?;
        url.query_pairs_mut()
            .append_pair("select", "id,username,avatar_url")
            .append_pair("id", &in_filter(ids));
        let resp = self
            .shared
            .http
            .get(url)
            .header("apikey", &self.shared.api_key)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(backend_error_from_body(status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, BackendError> {
        let token = self.bearer()?;
        let url = self.rest_url(super::MESSAGES_TABLE)?;
        let resp = self
            .shared
            .http
            .post(url)
            .header("apikey", &self.shared.api_key)
            .header("Prefer", "return=representation")
            .bearer_auth(token)
            .json(&message)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(backend_error_from_body(status.as_u16(), &text));
        }
        let mut records: Vec<MessageRecord> =
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        match records.pop() {
            Some(record) => record.into_message(),
            None => Err(BackendError::Decode("insert returned no row".into())),
        }
    }

    async fn subscribe_to_inserts(
        &self,
        table: &str,
        on_insert: InsertCallback,
    ) -> Result<Subscription, BackendError> {
        // Fail fast when signed out; the channel itself re-reads the token per connect.
        self.bearer()?;
        let params = realtime::ChannelParams {
            url: realtime::websocket_url(&self.shared.base, &self.shared.api_key)?,
            table: table.to_string(),
            heartbeat: self.heartbeat,
        };
        let shared = self.shared.clone();
        let token_source = move || lock(&shared.session).as_ref().map(|s| s.access_token.clone());
        let task = tokio::spawn(realtime::run_insert_channel(
            params,
            Box::new(token_source),
            on_insert,
        ));
        Ok(Subscription::new(format!("realtime:{table}"), move || {
            task.abort();
        }))
    }
}
