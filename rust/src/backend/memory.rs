// In-process backend: deterministic stand-in for the hosted service.
//
// Used by tests and by `disable_network` mode. Keeps enough bookkeeping (call counts,
// open subscriptions, requested profile batches) for tests to assert on the controller's
// side effects.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AuthCallback, AuthError, Backend, BackendError, InsertCallback, Message, NewMessage, Profile,
    Session, Subscription,
};

const BASE_TIMESTAMP_MS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub authenticate: usize,
    pub register: usize,
    pub deauthenticate: usize,
    pub current_session: usize,
    pub query_messages: usize,
    pub query_profiles: usize,
    pub insert_message: usize,
    pub subscribe_to_inserts: usize,
}

impl CallCounts {
    /// Calls that would have touched the network.
    pub fn total(&self) -> usize {
        self.authenticate
            + self.register
            + self.deauthenticate
            + self.current_session
            + self.query_messages
            + self.query_profiles
            + self.insert_message
            + self.subscribe_to_inserts
    }
}

struct Account {
    password: String,
    user_id: String,
    confirmed: bool,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    messages: Vec<Message>,
    profiles: HashMap<String, Profile>,
    auth_listeners: HashMap<u64, Arc<AuthCallback>>,
    insert_listeners: HashMap<u64, (String, Arc<InsertCallback>)>,
    next_user: u64,
    next_message_id: i64,
    next_token: u64,
    last_created_at: i64,
    calls: CallCounts,
    profile_batches: Vec<BTreeSet<String>>,
    peak_insert_listeners: usize,
    fail_message_queries: bool,
    fail_profile_queries: bool,
    fail_inserts: bool,
    message_query_delay: Option<Duration>,
    profile_query_delay: Option<Duration>,
    auth_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    next_listener_id: Arc<AtomicU64>,
    open_inserts: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Registers a confirmed account and returns its user id.
    pub fn add_account(&self, email: &str, password: &str) -> String {
        self.insert_account(email, password, true)
    }

    fn insert_account(&self, email: &str, password: &str, confirmed: bool) -> String {
        let mut inner = self.lock();
        inner.next_user += 1;
        let user_id = format!("user-{}", inner.next_user);
        inner.accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user_id: user_id.clone(),
                confirmed,
            },
        );
        user_id
    }

    /// Marks a registered account as confirmed (the email link was followed).
    pub fn confirm_account(&self, email: &str) {
        if let Some(account) = self.lock().accounts.get_mut(email) {
            account.confirmed = true;
        }
    }

    pub fn set_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id.clone(), profile);
    }

    /// Stores a message without notifying live subscribers (pre-existing history).
    pub fn seed_message(&self, user_id: &str, user_email: &str, content: &str) -> Message {
        let mut inner = self.lock();
        let created_at = next_timestamp(&mut inner);
        store_message(&mut inner, user_id, user_email, content, created_at)
    }

    pub fn seed_message_at(
        &self,
        user_id: &str,
        user_email: &str,
        content: &str,
        created_at: i64,
    ) -> Message {
        let mut inner = self.lock();
        inner.last_created_at = inner.last_created_at.max(created_at);
        store_message(&mut inner, user_id, user_email, content, created_at)
    }

    /// Stores a message written by someone else and fans it out to live subscribers.
    pub fn insert_external(&self, user_id: &str, user_email: &str, content: &str) -> Message {
        let message = self.seed_message(user_id, user_email, content);
        self.deliver_insert(&message);
        message
    }

    /// Pushes an insert event to every live subscriber without storing it. Calling it twice
    /// with the same message simulates redelivery.
    pub fn deliver_insert(&self, message: &Message) {
        let listeners: Vec<Arc<InsertCallback>> = self
            .lock()
            .insert_listeners
            .values()
            .filter(|(table, _)| table == super::MESSAGES_TABLE)
            .map(|(_, cb)| cb.clone())
            .collect();
        for listener in listeners {
            listener(message.clone());
        }
    }

    /// Simulates an out-of-band auth event (token refresh, expiry, sign-in elsewhere).
    pub fn emit_auth_change(&self, session: Option<Session>) {
        self.lock().session = session.clone();
        self.notify_auth(session);
    }

    /// Session reported by `current_session` at start-up.
    pub fn set_stored_session(&self, session: Option<Session>) {
        self.lock().session = session;
    }

    /// A session for an existing account, as a token refresh would produce.
    pub fn issue_session(&self, email: &str) -> Option<Session> {
        let mut inner = self.lock();
        let user_id = inner.accounts.get(email)?.user_id.clone();
        Some(new_session(&mut inner, &user_id, email))
    }

    pub fn fail_message_queries(&self, fail: bool) {
        self.lock().fail_message_queries = fail;
    }

    pub fn fail_profile_queries(&self, fail: bool) {
        self.lock().fail_profile_queries = fail;
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.lock().fail_inserts = fail;
    }

    pub fn delay_message_queries(&self, delay: Option<Duration>) {
        self.lock().message_query_delay = delay;
    }

    pub fn delay_profile_queries(&self, delay: Option<Duration>) {
        self.lock().profile_query_delay = delay;
    }

    pub fn delay_authentication(&self, delay: Option<Duration>) {
        self.lock().auth_delay = delay;
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls.clone()
    }

    pub fn profile_batches(&self) -> Vec<BTreeSet<String>> {
        self.lock().profile_batches.clone()
    }

    pub fn stored_messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn open_insert_subscriptions(&self) -> usize {
        self.open_inserts.load(Ordering::SeqCst)
    }

    pub fn peak_insert_subscriptions(&self) -> usize {
        self.lock().peak_insert_listeners
    }

    pub fn auth_listener_count(&self) -> usize {
        self.lock().auth_listeners.len()
    }

    fn notify_auth(&self, session: Option<Session>) {
        let listeners: Vec<Arc<AuthCallback>> =
            self.lock().auth_listeners.values().cloned().collect();
        for listener in listeners {
            listener(session.clone());
        }
    }
}

fn next_timestamp(inner: &mut Inner) -> i64 {
    let ts = if inner.last_created_at == 0 {
        BASE_TIMESTAMP_MS
    } else {
        inner.last_created_at + 1_000
    };
    inner.last_created_at = ts;
    ts
}

fn store_message(
    inner: &mut Inner,
    user_id: &str,
    user_email: &str,
    content: &str,
    created_at: i64,
) -> Message {
    inner.next_message_id += 1;
    let message = Message {
        id: inner.next_message_id,
        created_at,
        content: content.to_string(),
        user_id: user_id.to_string(),
        user_email: user_email.to_string(),
    };
    inner.messages.push(message.clone());
    message
}

fn new_session(inner: &mut Inner, user_id: &str, email: &str) -> Session {
    inner.next_token += 1;
    Session {
        access_token: format!("access-{user_id}-{}", inner.next_token),
        refresh_token: Some(format!("refresh-{user_id}-{}", inner.next_token)),
        expires_at: Some(crate::state::now_seconds() + 3_600),
        user_id: user_id.to_string(),
        email: email.to_string(),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let delay = self.lock().auth_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let session = {
            let mut inner = self.lock();
            inner.calls.authenticate += 1;
            let (user_id, confirmed) = match inner.accounts.get(email) {
                Some(account) if account.password == password => {
                    (account.user_id.clone(), account.confirmed)
                }
                _ => return Err(AuthError::InvalidCredentials),
            };
            if !confirmed {
                return Err(AuthError::EmailNotConfirmed);
            }
            let session = new_session(&mut inner, &user_id, email);
            inner.session = Some(session.clone());
            session
        };
        self.notify_auth(Some(session.clone()));
        Ok(session)
    }

    async fn register(&self, email: &str, password: &str) -> Result<(), AuthError> {
        {
            let mut inner = self.lock();
            inner.calls.register += 1;
            if inner.accounts.contains_key(email) {
                return Err(AuthError::Rejected("User already registered".into()));
            }
        }
        self.insert_account(email, password, false);
        Ok(())
    }

    async fn deauthenticate(&self) -> Result<(), AuthError> {
        let had_session = {
            let mut inner = self.lock();
            inner.calls.deauthenticate += 1;
            inner.session.take().is_some()
        };
        if had_session {
            self.notify_auth(None);
        }
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let mut inner = self.lock();
        inner.calls.current_session += 1;
        Ok(inner.session.clone())
    }

    fn subscribe_to_auth_changes(&self, callback: AuthCallback) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.lock().auth_listeners.insert(id, Arc::new(callback));
        let inner = self.inner.clone();
        Subscription::new(format!("auth:{id}"), move || {
            let mut guard = match inner.lock() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            guard.auth_listeners.remove(&id);
        })
    }

    async fn query_messages(&self) -> Result<Vec<Message>, BackendError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.query_messages += 1;
            inner.message_query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.lock();
        if inner.session.is_none() {
            return Err(BackendError::NotAuthenticated);
        }
        if inner.fail_message_queries {
            return Err(BackendError::Network("connection reset".into()));
        }
        let mut messages = inner.messages.clone();
        messages.sort_by_key(Message::order_key);
        Ok(messages)
    }

    async fn query_profiles(&self, ids: &BTreeSet<String>) -> Result<Vec<Profile>, BackendError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.query_profiles += 1;
            inner.profile_batches.push(ids.clone());
            inner.profile_query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.lock();
        if inner.fail_profile_queries {
            return Err(BackendError::Status {
                status: 503,
                message: "profiles unavailable".into(),
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| inner.profiles.get(id).cloned())
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, BackendError> {
        let stored = {
            let mut inner = self.lock();
            inner.calls.insert_message += 1;
            if inner.session.is_none() {
                return Err(BackendError::NotAuthenticated);
            }
            if inner.fail_inserts {
                return Err(BackendError::Status {
                    status: 500,
                    message: "insert rejected".into(),
                });
            }
            let created_at = next_timestamp(&mut inner);
            store_message(
                &mut inner,
                &message.user_id,
                &message.user_email,
                &message.content,
                created_at,
            )
        };
        self.deliver_insert(&stored);
        Ok(stored)
    }

    async fn subscribe_to_inserts(
        &self,
        table: &str,
        on_insert: InsertCallback,
    ) -> Result<Subscription, BackendError> {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = self.lock();
            inner.calls.subscribe_to_inserts += 1;
            inner
                .insert_listeners
                .insert(id, (table.to_string(), Arc::new(on_insert)));
            let open = self.open_inserts.fetch_add(1, Ordering::SeqCst) + 1;
            inner.peak_insert_listeners = inner.peak_insert_listeners.max(open);
        }
        let inner = self.inner.clone();
        let open_inserts = self.open_inserts.clone();
        Ok(Subscription::new(format!("inserts:{table}:{id}"), move || {
            let mut guard = match inner.lock() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            if guard.insert_listeners.remove(&id).is_some() {
                open_inserts.fetch_sub(1, Ordering::SeqCst);
            }
        }))
    }
}
