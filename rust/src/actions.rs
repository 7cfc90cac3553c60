use crate::state::AuthView;

#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Auth
    SignIn { email: String, password: String },
    SignUp { email: String, password: String },
    SignOut,
    ShowAuthView { view: AuthView },

    // Chat
    SetDraft { text: String },
    SendMessage { content: String },

    // UI
    SetAccountMenuOpen { open: bool },
    ClearNotice,
}

impl AppAction {
    /// Log-safe action tag (never includes credentials or message text).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::SignIn { .. } => "SignIn",
            AppAction::SignUp { .. } => "SignUp",
            AppAction::SignOut => "SignOut",
            AppAction::ShowAuthView { .. } => "ShowAuthView",

            // Chat
            AppAction::SetDraft { .. } => "SetDraft",
            AppAction::SendMessage { .. } => "SendMessage",

            // UI
            AppAction::SetAccountMenuOpen { .. } => "SetAccountMenuOpen",
            AppAction::ClearNotice => "ClearNotice",
        }
    }
}
