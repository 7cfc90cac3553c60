pub(crate) mod config;
mod feed;
mod profiles;
mod session;

use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::backend::{AuthError, Backend, BackendError, Session, Subscription};
use crate::state::{derive_view, AppState, AuthState, AuthView, MessageRow, Notice};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use feed::Feed;
use profiles::ProfileCache;
use session::ActiveSession;

/// The controller actor. Owns all mutable state; runs on one thread and handles one
/// `CoreMsg` at a time. Backend calls run on `runtime` and come back as internal events.
pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    backend: Arc<dyn Backend>,
    runtime: tokio::runtime::Runtime,

    requested_view: AuthView,
    session: Option<ActiveSession>,
    // Bumped on every session start/stop; async results carry the value they were issued under.
    generation: u64,
    auth_listener: Option<Subscription>,
    // Bumped on every sign-out; a sign-in result from an older epoch is discarded.
    sign_out_epoch: u64,
    abandoned_sign_ins: usize,

    feed: Feed,
    profiles: ProfileCache,
    closed: bool,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        shared_state: Arc<RwLock<AppState>>,
        backend: Arc<dyn Backend>,
        runtime: tokio::runtime::Runtime,
    ) -> Self {
        let auth_tx = core_sender.clone();
        let auth_listener = backend.subscribe_to_auth_changes(Box::new(move |session| {
            let _ = auth_tx.send(CoreMsg::Internal(Box::new(InternalEvent::AuthChanged {
                session,
            })));
        }));

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            backend,
            runtime,
            requested_view: AuthView::default(),
            session: None,
            generation: 0,
            auth_listener: Some(auth_listener),
            sign_out_epoch: 0,
            abandoned_sign_ins: 0,
            feed: Feed::default(),
            profiles: ProfileCache::default(),
            closed: false,
        };

        // Ensure ChatApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);

        let backend = this.backend.clone();
        let tx = this.core_sender.clone();
        this.runtime.spawn(async move {
            let result = backend.current_session().await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SessionRestored {
                result,
            })));
        });
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    /// Recomputes derived fields once, then publishes a full snapshot.
    fn emit_state(&mut self) {
        self.state.view = derive_view(&self.state.auth, self.requested_view);
        let me = self.session.as_ref().map(|s| s.session.user_id.as_str());
        self.state.feed = self
            .feed
            .messages()
            .iter()
            .map(|m| MessageRow::build(m, self.profiles.get(&m.user_id), me))
            .collect();

        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn show_error(&mut self, message: impl Into<String>) {
        self.state.notice = Some(Notice::error(message));
        self.emit_state();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        if self.closed {
            return;
        }
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can contain passwords.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            CoreMsg::Shutdown => self.shutdown(),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::SessionRestored { result } => self.handle_session_restored(result),
            InternalEvent::AuthChanged { session } => self.handle_auth_changed(session),
            InternalEvent::SignInFinished { epoch, result } => {
                self.handle_sign_in_finished(epoch, result)
            }
            InternalEvent::SignUpFinished { result } => self.handle_sign_up_finished(result),
            InternalEvent::FeedSubscribed { generation, result } => {
                self.handle_feed_subscribed(generation, result)
            }
            InternalEvent::FeedLoaded { generation, result } => {
                self.handle_feed_loaded(generation, result)
            }
            InternalEvent::MessageInserted {
                generation,
                message,
            } => self.handle_message_inserted(generation, message),
            InternalEvent::MessageSendFinished { generation, result } => {
                self.handle_send_finished(generation, result)
            }
            InternalEvent::ProfilesResolved {
                generation,
                ids,
                result,
            } => self.handle_profiles_resolved(generation, ids, result),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Auth
            AppAction::SignIn { email, password } => self.sign_in(&email, &password),
            AppAction::SignUp { email, password } => self.sign_up(&email, &password),
            AppAction::SignOut => self.sign_out(),
            AppAction::ShowAuthView { view } => {
                if self.requested_view != view {
                    self.requested_view = view;
                    self.emit_state();
                }
            }

            // Chat
            AppAction::SetDraft { text } => {
                if self.state.draft != text {
                    self.state.draft = text;
                    self.emit_state();
                }
            }
            AppAction::SendMessage { content } => self.send_message(&content),

            // UI
            AppAction::SetAccountMenuOpen { open } => {
                let open = open && self.session.is_some();
                if self.state.account_menu_open != open {
                    self.state.account_menu_open = open;
                    self.emit_state();
                }
            }
            AppAction::ClearNotice => {
                if self.state.notice.is_some() {
                    self.state.notice = None;
                    self.emit_state();
                }
            }
        }
    }

    /// Releases every backend subscription. Later messages are ignored.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        tracing::info!("core shutdown");
        self.stop_session();
        if let Some(listener) = self.auth_listener.take() {
            listener.close();
        }
        self.closed = true;
    }
}

impl Drop for AppCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::session::{CREDENTIALS_REQUIRED, PASSWORD_TOO_SHORT, SIGN_UP_CONFIRM};
    use super::*;
    use crate::backend::{Message, MemoryBackend};
    use crate::state::{NoticeKind, ViewState};
    use flume::Receiver;
    use std::collections::BTreeSet;
    use std::time::{Duration, Instant};

    struct Harness {
        core: AppCore,
        core_rx: Receiver<CoreMsg>,
        _update_rx: Receiver<AppUpdate>,
        backend: MemoryBackend,
    }

    fn make_core(backend: MemoryBackend) -> Harness {
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let core = AppCore::new(
            update_tx,
            core_tx,
            Arc::new(RwLock::new(AppState::empty())),
            Arc::new(backend.clone()),
            runtime,
        );
        Harness {
            core,
            core_rx,
            _update_rx: update_rx,
            backend,
        }
    }

    impl Harness {
        fn act(&mut self, action: AppAction) {
            self.core.handle_message(CoreMsg::Action(action));
        }

        /// Feeds queued internal events to the core until `done` holds.
        fn pump_until(&mut self, done: impl Fn(&AppCore) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(&self.core) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let msg = self
                    .core_rx
                    .recv_timeout(remaining)
                    .expect("condition not reached before timeout");
                self.core.handle_message(msg);
            }
        }

        /// Handles everything that arrives within `window`.
        fn drain_for(&mut self, window: Duration) {
            let deadline = Instant::now() + window;
            while let Ok(msg) = self
                .core_rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                self.core.handle_message(msg);
            }
        }

        fn signed_in(&mut self, email: &str, password: &str) {
            self.pump_until(|c| c.state.auth != AuthState::Loading);
            self.act(AppAction::SignIn {
                email: email.into(),
                password: password.into(),
            });
            self.pump_until(|c| {
                c.state.view == ViewState::Chat
                    && !c.state.busy.signing_in
                    && !c.state.busy.loading_feed
            });
        }
    }

    fn feed_ids(core: &AppCore) -> Vec<i64> {
        core.state.feed.iter().map(|r| r.id).collect()
    }

    #[test]
    fn starts_loading_then_logged_out() {
        let mut h = make_core(MemoryBackend::new());
        assert_eq!(h.core.state.view, ViewState::Loading);
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        assert_eq!(h.core.state.view, ViewState::Login);
        assert_eq!(h.backend.calls().current_session, 1);
    }

    #[test]
    fn stored_session_resumes_into_chat() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        backend.seed_message("u-other", "b@x.com", "hello");
        backend.set_stored_session(backend.issue_session("a@x.com"));

        let mut h = make_core(backend);
        h.pump_until(|c| c.state.feed.len() == 1);
        assert_eq!(h.core.state.view, ViewState::Chat);
        assert_eq!(h.backend.calls().query_messages, 1);
    }

    #[test]
    fn empty_credentials_never_reach_backend() {
        let mut h = make_core(MemoryBackend::new());
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        h.act(AppAction::SignIn {
            email: "  ".into(),
            password: "secret1".into(),
        });
        assert_eq!(
            h.core.state.notice,
            Some(Notice::error(CREDENTIALS_REQUIRED))
        );
        assert!(!h.core.state.busy.signing_in);
        assert_eq!(h.backend.calls().authenticate, 0);
    }

    #[test]
    fn short_password_rejected_before_sign_up() {
        let mut h = make_core(MemoryBackend::new());
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        h.act(AppAction::SignUp {
            email: "a@x.com".into(),
            password: "abcde".into(),
        });
        assert_eq!(h.core.state.notice, Some(Notice::error(PASSWORD_TOO_SHORT)));
        assert_eq!(h.backend.calls().register, 0);
    }

    #[test]
    fn sign_up_shows_info_and_stays_signed_out() {
        let mut h = make_core(MemoryBackend::new());
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        h.act(AppAction::ShowAuthView {
            view: AuthView::SignUp,
        });
        h.act(AppAction::SignUp {
            email: "a@x.com".into(),
            password: "abcdef".into(),
        });
        assert!(h.core.state.busy.signing_up);
        h.pump_until(|c| !c.state.busy.signing_up);

        let notice = h.core.state.notice.clone().unwrap();
        assert_eq!(notice.kind, NoticeKind::Info);
        assert_eq!(notice.message, SIGN_UP_CONFIRM);
        assert_eq!(h.core.state.auth, AuthState::LoggedOut);
        assert_eq!(h.core.state.view, ViewState::SignUp);
    }

    #[test]
    fn bad_password_surfaces_backend_message() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        h.act(AppAction::SignIn {
            email: "a@x.com".into(),
            password: "wrong-password".into(),
        });
        h.pump_until(|c| !c.state.busy.signing_in);
        assert_eq!(
            h.core.state.notice,
            Some(Notice::error(AuthError::InvalidCredentials.to_string()))
        );
        assert_eq!(h.core.state.view, ViewState::Login);
    }

    #[test]
    fn sign_in_loads_feed_exactly_once() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        backend.seed_message("u-b", "b@x.com", "first");
        backend.seed_message("u-b", "b@x.com", "second");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        h.drain_for(Duration::from_millis(100));

        assert_eq!(feed_ids(&h.core), vec![1, 2]);
        assert_eq!(h.backend.calls().query_messages, 1);
        assert_eq!(h.backend.calls().subscribe_to_inserts, 1);
        assert_eq!(h.backend.open_insert_subscriptions(), 1);
    }

    #[test]
    fn token_refresh_for_same_user_keeps_feed() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");

        let refreshed = h.backend.issue_session("a@x.com");
        h.backend.emit_auth_change(refreshed.clone());
        h.drain_for(Duration::from_millis(100));

        assert_eq!(h.backend.calls().query_messages, 1);
        assert_eq!(
            h.core.session.as_ref().map(|s| s.session.access_token.clone()),
            refreshed.map(|s| s.access_token)
        );
    }

    #[test]
    fn backend_expiry_signs_out_and_releases_feed() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        h.pump_until(|c| c.session.as_ref().is_some_and(|s| s.feed_sub.is_some()));

        h.backend.emit_auth_change(None);
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        assert_eq!(h.backend.open_insert_subscriptions(), 0);
        assert!(h.core.state.feed.is_empty());
    }

    #[test]
    fn stale_results_are_dropped() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        let old = h.core.session.as_ref().map(|s| s.generation).unwrap();

        h.act(AppAction::SignOut);
        h.core.handle_message(CoreMsg::Internal(Box::new(InternalEvent::FeedLoaded {
            generation: old,
            result: Ok(vec![Message {
                id: 99,
                created_at: 1,
                content: "late".into(),
                user_id: "u1".into(),
                user_email: "a@x.com".into(),
            }]),
        })));
        h.core.handle_message(CoreMsg::Internal(Box::new(
            InternalEvent::ProfilesResolved {
                generation: old,
                ids: BTreeSet::from(["u1".to_string()]),
                result: Ok(vec![]),
            },
        )));
        assert!(h.core.state.feed.is_empty());
        assert_eq!(h.core.state.view, ViewState::Login);
    }

    #[test]
    fn stale_subscription_is_closed_on_arrival() {
        let backend = MemoryBackend::new();
        let mut h = make_core(backend);
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);

        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = released.clone();
        let sub = Subscription::new("late", move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        h.core.handle_message(CoreMsg::Internal(Box::new(InternalEvent::FeedSubscribed {
            generation: 0,
            result: Ok(sub),
        })));
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn sign_out_resets_ui_and_calls_backend() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        backend.seed_message("u-b", "b@x.com", "hi");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        h.act(AppAction::SetAccountMenuOpen { open: true });
        h.act(AppAction::SetDraft {
            text: "unsent".into(),
        });
        assert!(h.core.state.account_menu_open);

        h.act(AppAction::SignOut);
        assert_eq!(h.core.state.auth, AuthState::LoggedOut);
        assert_eq!(h.core.state.view, ViewState::Login);
        assert!(!h.core.state.account_menu_open);
        assert!(h.core.state.feed.is_empty());
        assert!(h.core.state.draft.is_empty());
        assert_eq!(h.backend.open_insert_subscriptions(), 0);

        h.drain_for(Duration::from_millis(100));
        assert_eq!(h.backend.calls().deauthenticate, 1);
        assert_eq!(h.core.state.auth, AuthState::LoggedOut);
    }

    #[test]
    fn whitespace_send_is_a_no_op() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        let rev = h.core.state.rev;

        h.act(AppAction::SendMessage { content: "".into() });
        h.act(AppAction::SendMessage {
            content: "   ".into(),
        });
        h.drain_for(Duration::from_millis(50));
        assert_eq!(h.backend.calls().insert_message, 0);
        assert_eq!(h.core.state.rev, rev);
    }

    #[test]
    fn send_clears_draft_and_arrives_via_live_feed() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        h.pump_until(|c| c.session.as_ref().is_some_and(|s| s.feed_sub.is_some()));

        h.act(AppAction::SetDraft {
            text: "  hello  ".into(),
        });
        h.act(AppAction::SendMessage {
            content: "  hello  ".into(),
        });
        assert!(h.core.state.draft.is_empty());
        assert!(h.core.state.feed.is_empty());

        h.pump_until(|c| c.state.feed.len() == 1);
        let row = &h.core.state.feed[0];
        assert_eq!(row.content, "hello");
        assert!(row.is_mine);
    }

    #[test]
    fn failed_send_keeps_draft_cleared() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        backend.fail_inserts(true);
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");

        h.act(AppAction::SetDraft {
            text: "lost".into(),
        });
        h.act(AppAction::SendMessage {
            content: "lost".into(),
        });
        h.drain_for(Duration::from_millis(100));
        assert_eq!(h.backend.calls().insert_message, 1);
        assert!(h.core.state.draft.is_empty());
        assert!(h.core.state.feed.is_empty());
        assert_eq!(h.core.state.notice, None);
    }

    #[test]
    fn sign_up_is_ignored_while_signed_in() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");

        h.act(AppAction::SignUp {
            email: "new@x.com".into(),
            password: "secret2".into(),
        });
        h.drain_for(Duration::from_millis(50));
        assert!(!h.core.state.busy.signing_up);
        assert_eq!(h.backend.calls().register, 0);
        assert_eq!(h.core.state.view, ViewState::Chat);
    }

    #[test]
    fn late_sign_in_result_after_sign_out_is_discarded() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        backend.delay_authentication(Some(Duration::from_millis(100)));
        let mut h = make_core(backend);
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);

        h.act(AppAction::SignIn {
            email: "a@x.com".into(),
            password: "secret1".into(),
        });
        assert!(h.core.state.busy.signing_in);
        h.act(AppAction::SignOut);
        assert!(!h.core.state.busy.signing_in);

        h.pump_until(|c| c.abandoned_sign_ins == 0);
        h.drain_for(Duration::from_millis(100));
        assert_eq!(h.core.state.auth, AuthState::LoggedOut);
        assert!(h.core.session.is_none());
        assert_eq!(h.backend.calls().deauthenticate, 1);
        assert_eq!(h.backend.calls().query_messages, 0);
    }

    #[test]
    fn account_menu_needs_a_session() {
        let mut h = make_core(MemoryBackend::new());
        h.pump_until(|c| c.state.auth == AuthState::LoggedOut);
        h.act(AppAction::SetAccountMenuOpen { open: true });
        assert!(!h.core.state.account_menu_open);
    }

    #[test]
    fn shutdown_releases_listeners_once() {
        let backend = MemoryBackend::new();
        backend.add_account("a@x.com", "secret1");
        let mut h = make_core(backend);
        h.signed_in("a@x.com", "secret1");
        h.pump_until(|c| c.session.as_ref().is_some_and(|s| s.feed_sub.is_some()));
        assert_eq!(h.backend.auth_listener_count(), 1);

        h.core.handle_message(CoreMsg::Shutdown);
        h.core.shutdown();
        assert!(h.core.is_closed());
        assert_eq!(h.backend.auth_listener_count(), 0);
        assert_eq!(h.backend.open_insert_subscriptions(), 0);

        let rev = h.core.state.rev;
        h.act(AppAction::ClearNotice);
        h.act(AppAction::SetDraft { text: "x".into() });
        assert_eq!(h.core.state.rev, rev);
    }
}
