use std::collections::BTreeSet;

use crate::backend::{AuthError, BackendError, Message, Profile, Session, Subscription};
use crate::state::AppState;
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
#[allow(clippy::large_enum_variant)] // uniffi enums cannot use Box<T> indirection
pub enum AppUpdate {
    /// Every update is a full snapshot; the UI replaces what it has.
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
    Shutdown,
}

/// Results of backend work, delivered back onto the core thread.
///
/// Feed-scoped events carry the generation they were issued under so results from a
/// previous session can be recognized and dropped.
#[derive(Debug)]
pub enum InternalEvent {
    // Auth
    SessionRestored {
        result: Result<Option<Session>, AuthError>,
    },
    AuthChanged {
        session: Option<Session>,
    },
    /// `epoch` is the sign-out count when the attempt started.
    SignInFinished {
        epoch: u64,
        result: Result<Session, AuthError>,
    },
    SignUpFinished {
        result: Result<(), AuthError>,
    },

    // Feed
    FeedSubscribed {
        generation: u64,
        result: Result<Subscription, BackendError>,
    },
    FeedLoaded {
        generation: u64,
        result: Result<Vec<Message>, BackendError>,
    },
    MessageInserted {
        generation: u64,
        message: Message,
    },
    MessageSendFinished {
        generation: u64,
        result: Result<Message, BackendError>,
    },

    // Enrichment
    ProfilesResolved {
        generation: u64,
        ids: BTreeSet<String>,
        result: Result<Vec<Profile>, BackendError>,
    },
}
