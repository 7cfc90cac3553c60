// Session lifecycle: sign-in/up/out and externally pushed auth changes.

use super::*;

pub(super) const CREDENTIALS_REQUIRED: &str = "Email and password are required.";
pub(super) const PASSWORD_TOO_SHORT: &str = "Password must be at least 6 characters.";
pub(super) const SIGN_UP_CONFIRM: &str = "Check your email for the confirmation link.";
const MIN_PASSWORD_CHARS: usize = 6;

pub(super) struct ActiveSession {
    pub session: Session,
    pub generation: u64,
    /// Live insert subscription; `None` until the backend hands it over.
    pub feed_sub: Option<Subscription>,
}

/// Trimmed email, or the notice to show instead of calling the backend.
fn validate_credentials(email: &str, password: &str) -> Result<String, &'static str> {
    let email = email.trim();
    if email.is_empty() || password.trim().is_empty() {
        return Err(CREDENTIALS_REQUIRED);
    }
    Ok(email.to_string())
}

impl AppCore {
    /// Single entry point for every source of session changes (start-up restore, sign-in
    /// result, auth listener). Same user: token update only. Different user: restart.
    pub(super) fn apply_session(&mut self, session: Option<Session>) {
        match (session, self.session.as_mut()) {
            (Some(next), Some(active)) if active.session.user_id == next.user_id => {
                tracing::debug!(user_id = %next.user_id, "session refreshed");
                active.session = next;
            }
            (Some(next), Some(_)) => {
                tracing::info!(user_id = %next.user_id, "session switched to another user");
                self.reset_ui();
                self.start_session(next);
            }
            (Some(next), None) => {
                self.start_session(next);
            }
            (None, Some(_)) => {
                tracing::info!("session ended by backend");
                self.end_session();
                self.emit_state();
            }
            (None, None) => {
                if self.state.auth != AuthState::LoggedOut {
                    self.state.auth = AuthState::LoggedOut;
                    self.emit_state();
                }
            }
        }
    }

    pub(super) fn start_session(&mut self, session: Session) {
        // Tear down any existing session first.
        self.stop_session();

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        tracing::info!(user_id = %session.user_id, generation, "start_session");

        self.state.auth = AuthState::LoggedIn {
            user_id: session.user_id.clone(),
            email: session.email.clone(),
        };
        self.session = Some(ActiveSession {
            session,
            generation,
            feed_sub: None,
        });
        self.start_feed(generation);
        self.emit_state();
    }

    /// Releases the live subscription and forgets per-session data.
    pub(super) fn stop_session(&mut self) {
        if let Some(active) = self.session.take() {
            tracing::info!(generation = active.generation, "stop_session");
            if let Some(sub) = active.feed_sub {
                sub.close();
            }
        }
        // Results still in flight for the old generation become stale.
        self.generation = self.generation.wrapping_add(1);
        self.feed.clear();
        self.profiles.clear();
        self.state.busy.loading_feed = false;
    }

    /// Local half of a sign-out; shared with backend-initiated expiry.
    fn end_session(&mut self) {
        self.stop_session();
        self.state.auth = AuthState::LoggedOut;
        self.state.busy.signing_in = false;
        self.state.busy.signing_up = false;
        self.reset_ui();
        self.requested_view = AuthView::Login;
    }

    /// Per-user UI state that must not survive into another identity.
    fn reset_ui(&mut self) {
        self.state.account_menu_open = false;
        self.state.draft.clear();
        self.state.notice = None;
    }

    /// Auth listener events. While a sign-in abandoned by sign-out is still running, the
    /// session it produces is not adopted.
    pub(super) fn handle_auth_changed(&mut self, session: Option<Session>) {
        if session.is_some() && self.session.is_none() && self.abandoned_sign_ins > 0 {
            tracing::debug!("ignoring session from an abandoned sign-in");
            return;
        }
        self.apply_session(session);
    }

    pub(super) fn handle_session_restored(&mut self, result: Result<Option<Session>, AuthError>) {
        if self.state.auth != AuthState::Loading {
            tracing::debug!("session restore finished after auth already settled");
            return;
        }
        match result {
            Ok(session) => {
                tracing::info!(restored = session.is_some(), "session restore");
                self.apply_session(session);
            }
            Err(e) => {
                tracing::warn!(%e, "session restore failed");
                self.apply_session(None);
            }
        }
    }

    pub(super) fn sign_in(&mut self, email: &str, password: &str) {
        if self.state.busy.signing_in {
            return;
        }
        if self.session.is_some() {
            tracing::debug!("sign-in ignored: already signed in");
            return;
        }
        let email = match validate_credentials(email, password) {
            Ok(email) => email,
            Err(notice) => {
                self.show_error(notice);
                return;
            }
        };

        self.state.notice = None;
        self.state.busy.signing_in = true;
        self.emit_state();

        let backend = self.backend.clone();
        let password = password.to_string();
        let tx = self.core_sender.clone();
        let epoch = self.sign_out_epoch;
        self.runtime.spawn(async move {
            let result = backend.authenticate(&email, &password).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SignInFinished {
                epoch,
                result,
            })));
        });
    }

    pub(super) fn handle_sign_in_finished(
        &mut self,
        epoch: u64,
        result: Result<Session, AuthError>,
    ) {
        if epoch != self.sign_out_epoch {
            self.abandoned_sign_ins = self.abandoned_sign_ins.saturating_sub(1);
            tracing::info!(ok = result.is_ok(), "sign-in finished after sign-out; discarded");
            // Undo the backend session unless a newer sign-in owns it by now.
            if result.is_ok() && self.session.is_none() && !self.state.busy.signing_in {
                let backend = self.backend.clone();
                self.runtime.spawn(async move {
                    if let Err(e) = backend.deauthenticate().await {
                        tracing::warn!(%e, "deauthenticate failed");
                    }
                });
            }
            return;
        }
        self.state.busy.signing_in = false;
        match result {
            Ok(session) => {
                tracing::info!(user_id = %session.user_id, "sign-in ok");
                self.state.notice = None;
                // The auth listener may already have started this session.
                self.apply_session(Some(session));
                self.emit_state();
            }
            Err(e) => {
                tracing::info!(%e, "sign-in failed");
                self.show_error(e.to_string());
            }
        }
    }

    pub(super) fn sign_up(&mut self, email: &str, password: &str) {
        if self.state.busy.signing_up {
            return;
        }
        if self.session.is_some() {
            tracing::debug!("sign-up ignored: already signed in");
            return;
        }
        let email = match validate_credentials(email, password) {
            Ok(email) => email,
            Err(notice) => {
                self.show_error(notice);
                return;
            }
        };
        if password.chars().count() < MIN_PASSWORD_CHARS {
            self.show_error(PASSWORD_TOO_SHORT);
            return;
        }

        self.state.notice = None;
        self.state.busy.signing_up = true;
        self.emit_state();

        let backend = self.backend.clone();
        let password = password.to_string();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = backend.register(&email, &password).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SignUpFinished {
                result,
            })));
        });
    }

    pub(super) fn handle_sign_up_finished(&mut self, result: Result<(), AuthError>) {
        self.state.busy.signing_up = false;
        match result {
            Ok(()) => {
                tracing::info!("sign-up accepted; awaiting email confirmation");
                self.state.notice = Some(Notice::info(SIGN_UP_CONFIRM));
                self.emit_state();
            }
            Err(e) => {
                tracing::info!(%e, "sign-up failed");
                self.show_error(e.to_string());
            }
        }
    }

    pub(super) fn sign_out(&mut self) {
        let had_session = self.session.is_some();
        if self.state.busy.signing_in {
            self.abandoned_sign_ins += 1;
        }
        self.sign_out_epoch = self.sign_out_epoch.wrapping_add(1);
        self.end_session();
        self.emit_state();

        if !had_session {
            return;
        }
        let backend = self.backend.clone();
        self.runtime.spawn(async move {
            if let Err(e) = backend.deauthenticate().await {
                tracing::warn!(%e, "deauthenticate failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_need_both_fields() {
        assert_eq!(validate_credentials("", "secret1"), Err(CREDENTIALS_REQUIRED));
        assert_eq!(
            validate_credentials("a@x.com", "   "),
            Err(CREDENTIALS_REQUIRED)
        );
        assert_eq!(
            validate_credentials("  a@x.com ", "secret1"),
            Ok("a@x.com".to_string())
        );
    }
}
