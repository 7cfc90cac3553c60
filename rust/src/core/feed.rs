// Message feed: initial history load, live appends, send.

use std::collections::{BTreeSet, HashSet};

use super::*;
use crate::backend::{Message, NewMessage, MESSAGES_TABLE};

/// Outcome of offering a live insert to the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Appended {
    Added,
    Duplicate,
    /// History not loaded yet; held until it is.
    Buffered,
}

/// Ordered, id-unique message sequence for the active session.
#[derive(Debug, Default)]
pub(super) struct Feed {
    messages: Vec<Message>,
    ids: HashSet<i64>,
    live: bool,
    pending: Vec<Message>,
}

impl Feed {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Full replace with loaded history, then flush anything delivered while loading.
    pub fn replace_all(&mut self, mut history: Vec<Message>) {
        history.sort_by_key(Message::order_key);
        self.ids.clear();
        self.messages.clear();
        for message in history {
            if self.ids.insert(message.id) {
                self.messages.push(message);
            }
        }
        self.mark_live();
    }

    /// Start accepting appends without history (load failed).
    pub fn mark_live(&mut self) {
        self.live = true;
        for message in std::mem::take(&mut self.pending) {
            self.append(message);
        }
    }

    /// Appends at the end in delivery order; an already-present id is dropped.
    pub fn append(&mut self, message: Message) -> Appended {
        if !self.live {
            if self.pending.iter().any(|m| m.id == message.id) {
                return Appended::Duplicate;
            }
            self.pending.push(message);
            return Appended::Buffered;
        }
        if !self.ids.insert(message.id) {
            return Appended::Duplicate;
        }
        self.messages.push(message);
        Appended::Added
    }

    pub fn distinct_user_ids(&self) -> BTreeSet<String> {
        self.messages.iter().map(|m| m.user_id.clone()).collect()
    }
}

impl AppCore {
    /// Subscribes first and loads second so nothing inserted in between is missed.
    pub(super) fn start_feed(&mut self, generation: u64) {
        self.feed.clear();
        self.state.busy.loading_feed = true;

        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let insert_tx = tx.clone();
            let subscribed = backend
                .subscribe_to_inserts(
                    MESSAGES_TABLE,
                    Box::new(move |message| {
                        let _ = insert_tx.send(CoreMsg::Internal(Box::new(
                            InternalEvent::MessageInserted {
                                generation,
                                message,
                            },
                        )));
                    }),
                )
                .await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::FeedSubscribed {
                generation,
                result: subscribed,
            })));

            let loaded = backend.query_messages().await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::FeedLoaded {
                generation,
                result: loaded,
            })));
        });
    }

    pub(super) fn handle_feed_subscribed(
        &mut self,
        generation: u64,
        result: Result<Subscription, BackendError>,
    ) {
        let subscription = match result {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%e, generation, "live feed subscription failed");
                return;
            }
        };
        match self.session.as_mut() {
            Some(active) if active.generation == generation => {
                tracing::info!(label = subscription.label(), generation, "live feed subscribed");
                if let Some(previous) = active.feed_sub.replace(subscription) {
                    previous.close();
                }
            }
            _ => {
                tracing::debug!(generation, "closing live feed subscription from ended session");
                subscription.close();
            }
        }
    }

    pub(super) fn handle_feed_loaded(
        &mut self,
        generation: u64,
        result: Result<Vec<Message>, BackendError>,
    ) {
        if !self.is_current(generation) {
            tracing::debug!(generation, "dropping stale feed load");
            return;
        }
        self.state.busy.loading_feed = false;
        match result {
            Ok(history) => {
                tracing::info!(count = history.len(), generation, "feed loaded");
                self.feed.replace_all(history);
            }
            Err(e) => {
                tracing::warn!(%e, generation, "feed load failed");
                self.feed.mark_live();
            }
        }
        let senders = self.feed.distinct_user_ids();
        self.request_enrichment(senders);
        self.emit_state();
    }

    pub(super) fn handle_message_inserted(&mut self, generation: u64, message: Message) {
        if !self.is_current(generation) {
            return;
        }
        let id = message.id;
        let user_id = message.user_id.clone();
        match self.feed.append(message) {
            Appended::Added => {
                tracing::debug!(id, "live message appended");
                self.request_enrichment(BTreeSet::from([user_id]));
                self.emit_state();
            }
            Appended::Duplicate => tracing::debug!(id, "dropping redelivered message"),
            Appended::Buffered => tracing::debug!(id, "holding live message until history loads"),
        }
    }

    pub(super) fn send_message(&mut self, content: &str) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        let Some(active) = self.session.as_ref() else {
            tracing::debug!("send ignored: no session");
            return;
        };
        let generation = active.generation;
        let outgoing = NewMessage {
            content: content.to_string(),
            user_id: active.session.user_id.clone(),
            user_email: active.session.email.clone(),
        };

        // Cleared on submission; the message itself shows up through the live feed.
        self.state.draft.clear();
        self.emit_state();

        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = backend.insert_message(outgoing).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::MessageSendFinished { generation, result },
            )));
        });
    }

    pub(super) fn handle_send_finished(
        &mut self,
        generation: u64,
        result: Result<Message, BackendError>,
    ) {
        match result {
            Ok(message) => tracing::debug!(id = message.id, generation, "message sent"),
            Err(e) => tracing::warn!(%e, generation, "send message failed"),
        }
    }
}
