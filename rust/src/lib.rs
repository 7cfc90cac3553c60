mod actions;
pub mod backend;
mod core;
mod logging;
mod state;
mod updates;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use backend::{
    AuthError, Backend, BackendError, HostedBackend, HostedBackendOptions, HostedInitError,
    MemoryBackend, Message, Profile, Session, Subscription,
};
pub use logging::init_logging;
pub use state::*;
pub use updates::*;

use crate::core::config::{load_app_config, AppConfig};

uniffi::setup_scaffolding!();

const SESSION_FILE_NAME: &str = "session.json";

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum SetupError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to start runtime: {0}")]
    Runtime(String),
}

#[derive(uniffi::Object)]
pub struct ChatApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    closed: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    actor: Mutex<Option<thread::JoinHandle<()>>>,
}

#[uniffi::export]
impl ChatApp {
    /// Connects to the hosted backend at `endpoint_url`. Both parameters are public
    /// identifiers, not secrets.
    #[uniffi::constructor]
    pub fn new(
        endpoint_url: String,
        api_key: String,
        data_dir: String,
    ) -> Result<Arc<Self>, SetupError> {
        let config = load_config(&data_dir);
        tracing::info!(data_dir = %data_dir, "ChatApp::new() starting");

        let backend: Arc<dyn Backend> = if config.network_disabled() {
            tracing::warn!("network disabled by config; using in-memory backend");
            Arc::new(MemoryBackend::new())
        } else {
            let mut options = HostedBackendOptions::new(endpoint_url, api_key);
            if config.persist_session() {
                options.session_path = Some(Path::new(&data_dir).join(SESSION_FILE_NAME));
            }
            if let Some(heartbeat) = config.realtime_heartbeat() {
                options.heartbeat = heartbeat;
            }
            if let Some(timeout) = config.request_timeout() {
                options.request_timeout = timeout;
            }
            let hosted = HostedBackend::new(options).map_err(|e| match e {
                HostedInitError::InvalidEndpoint(_) => SetupError::InvalidEndpoint(e.to_string()),
                HostedInitError::HttpClient(_) => SetupError::Runtime(e.to_string()),
            })?;
            Arc::new(hosted)
        };
        Self::start(backend)
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    /// Stops the controller and releases every backend subscription. Safe to call twice.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.core_tx.send(CoreMsg::Shutdown);
        let handle = match self.actor.lock() {
            Ok(mut g) => g.take(),
            Err(poison) => poison.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("core thread panicked");
            }
        }
    }
}

impl ChatApp {
    /// Runs the controller against any `Backend` (tests, offline demos).
    pub fn with_backend(
        backend: Arc<dyn Backend>,
        data_dir: &str,
    ) -> Result<Arc<Self>, SetupError> {
        load_config(data_dir);
        Self::start(backend)
    }

    fn start(backend: Arc<dyn Backend>) -> Result<Arc<Self>, SetupError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("supachat-rt")
            .enable_all()
            .build()
            .map_err(|e| SetupError::Runtime(e.to_string()))?;

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        let actor = thread::Builder::new()
            .name("supachat-core".into())
            .spawn(move || {
                let mut core = crate::core::AppCore::new(
                    update_tx,
                    core_tx_for_core,
                    shared_for_core,
                    backend,
                    runtime,
                );
                while let Ok(msg) = core_rx.recv() {
                    core.handle_message(msg);
                    if core.is_closed() {
                        break;
                    }
                }
            })
            .map_err(|e| SetupError::Runtime(e.to_string()))?;

        Ok(Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shared_state,
            actor: Mutex::new(Some(actor)),
        }))
    }
}

impl Drop for ChatApp {
    fn drop(&mut self) {
        self.close();
    }
}

fn load_config(data_dir: &str) -> AppConfig {
    let loaded = load_app_config(data_dir);
    let config = loaded.as_ref().ok().cloned().unwrap_or_default();
    init_logging(config.log_filter());
    if let Err(e) = loaded {
        tracing::warn!("ignoring config: {e:#}");
    }
    config
}
