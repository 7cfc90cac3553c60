use crate::backend::{Message, Profile};

/// Full snapshot handed to the UI on every update.
#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub view: ViewState,
    pub busy: BusyState,
    pub notice: Option<Notice>,
    pub draft: String,
    pub account_menu_open: bool,
    pub feed: Vec<MessageRow>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::Loading,
            view: ViewState::Loading,
            busy: BusyState::idle(),
            notice: None,
            draft: String::new(),
            account_menu_open: false,
            feed: vec![],
        }
    }
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// Start-up: waiting for the backend to report any stored session.
    Loading,
    LoggedOut,
    LoggedIn { user_id: String, email: String },
}

/// Which auth form the user asked for while signed out.
#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AuthView {
    #[default]
    Login,
    SignUp,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    Loading,
    Login,
    SignUp,
    Chat,
}

/// The view to show for a given auth state and requested form.
///
/// Pure; computed once per handled event, never while rendering.
pub fn derive_view(auth: &AuthState, requested: AuthView) -> ViewState {
    match auth {
        AuthState::Loading => ViewState::Loading,
        AuthState::LoggedIn { .. } => ViewState::Chat,
        AuthState::LoggedOut => match requested {
            AuthView::Login => ViewState::Login,
            AuthView::SignUp => ViewState::SignUp,
        },
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq, Default)]
pub struct BusyState {
    pub signing_in: bool,
    pub signing_up: bool,
    pub loading_feed: bool,
}

impl BusyState {
    pub fn idle() -> Self {
        Self::default()
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeKind {
    Error,
    Info,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            message: message.into(),
        }
    }
}

/// A feed entry ready for display.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct MessageRow {
    pub id: i64,
    pub created_at: i64,
    pub content: String,
    pub user_id: String,
    pub user_email: String,
    pub is_mine: bool,
    pub display_name: String,
    /// Avatar placeholder text; always available.
    pub initials: String,
    /// `None` until the sender's profile resolves (or when it has no avatar).
    pub avatar_url: Option<String>,
}

impl MessageRow {
    pub fn build(message: &Message, profile: Option<&Profile>, my_user_id: Option<&str>) -> Self {
        let username = profile
            .and_then(|p| p.username.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let avatar_url = profile
            .and_then(|p| p.avatar_url.clone())
            .filter(|url| !url.trim().is_empty());
        Self {
            id: message.id,
            created_at: message.created_at,
            content: message.content.clone(),
            user_id: message.user_id.clone(),
            user_email: message.user_email.clone(),
            is_mine: my_user_id == Some(message.user_id.as_str()),
            display_name: username
                .map(ToString::to_string)
                .unwrap_or_else(|| message.user_email.clone()),
            initials: fallback_initials(&message.user_email),
            avatar_url,
        }
    }
}

/// First two characters of the email, uppercased.
pub fn fallback_initials(email: &str) -> String {
    let initials: String = email.trim().chars().take(2).collect();
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials.to_uppercase()
    }
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
