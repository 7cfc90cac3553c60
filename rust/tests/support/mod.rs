#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use supachat_core::{
    AppAction, AppReconciler, AppState, AppUpdate, ChatApp, MemoryBackend, ViewState,
};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

#[derive(Clone, Default)]
pub struct Collector {
    pub updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

impl Collector {
    pub fn states(&self) -> Vec<AppState> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| match u {
                AppUpdate::FullState(s) => s.clone(),
            })
            .collect()
    }
}

pub struct TestApp {
    pub app: Arc<ChatApp>,
    pub backend: MemoryBackend,
    pub updates: Collector,
    _dir: TempDir,
}

impl TestApp {
    pub fn start(backend: &MemoryBackend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app =
            ChatApp::with_backend(Arc::new(backend.clone()), &dir.path().to_string_lossy())
                .unwrap();
        let updates = Collector::default();
        app.listen_for_updates(Box::new(updates.clone()));
        wait_until("auth settled", TIMEOUT, || {
            app.state().view != ViewState::Loading
        });
        Self {
            app,
            backend: backend.clone(),
            updates,
            _dir: dir,
        }
    }

    pub fn state(&self) -> AppState {
        self.app.state()
    }

    pub fn sign_in(&self, email: &str, password: &str) {
        self.app.dispatch(AppAction::SignIn {
            email: email.into(),
            password: password.into(),
        });
        wait_until("signed in with feed loaded", TIMEOUT, || {
            let s = self.app.state();
            s.view == ViewState::Chat && !s.busy.signing_in && !s.busy.loading_feed
        });
        // Inserts are only delivered once the live subscription exists.
        wait_until("live subscription open", TIMEOUT, || {
            self.backend.open_insert_subscriptions() == 1
        });
    }

    /// Signs out and waits until the backend saw the deauthenticate call.
    pub fn sign_out(&self) {
        let before = self.backend.calls().deauthenticate;
        self.app.dispatch(AppAction::SignOut);
        wait_until("signed out", TIMEOUT, || {
            self.app.state().view == ViewState::Login
        });
        wait_until("backend deauthenticated", TIMEOUT, || {
            self.backend.calls().deauthenticate > before
        });
        std::thread::sleep(Duration::from_millis(50));
    }

    pub fn feed_ids(&self) -> Vec<i64> {
        self.state().feed.iter().map(|r| r.id).collect()
    }
}
