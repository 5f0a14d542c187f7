//! Chat session lifecycle.
//!
//! DESIGN
//! ======
//! A session moves through `Idle -> Initializing -> Subscribed`, dropping
//! to `Failed` when the backend rejects `open` or the subscription errors
//! or ends.
//! `close` returns to `Idle` from anywhere.
//!
//! Every `open` and `close` bumps a generation counter. Work started under
//! one generation (the backend round trip in `open`, the pump task that
//! drains the subscription, an outstanding `send`) re-checks the counter
//! before touching state and becomes a no-op once it no longer matches.
//! Only one subscription is ever live: it is torn down before the
//! generation moves on.
//!
//! The read model is published through a `tokio::sync::watch` channel so
//! a renderer can await changes instead of polling.
//!
//! TRADE-OFFS
//! ==========
//! State sits behind a std `Mutex` that is never held across an await.
//! Lock scopes stay short and the pump task can share the same state
//! without an async mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::message::{Message, decode_snapshot, validate_outgoing};
use super::{ChatBackend, ChatError, ChatHandle, Identity, Topic};
use crate::realtime::{LogEvent, RealtimeLog, Subscription, TransportError};

// =============================================================================
// READ MODEL
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Initializing,
    Subscribed(ChatHandle),
    Failed(ChatError),
}

impl SessionState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Subscribed(_) => "subscribed",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub message: Message,
    /// Written by the current user.
    pub own: bool,
}

/// What a renderer needs to draw the chat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatView {
    pub state: SessionState,
    pub topic: Option<Topic>,
    /// Sorted by timestamp, then key.
    pub messages: Vec<MessageView>,
    pub error_message: Option<String>,
    /// A send is outstanding; the compose control should be disabled.
    pub sending: bool,
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct ActiveSubscription {
    address: String,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    topic: Option<Topic>,
    state: SessionState,
    active: Option<ActiveSubscription>,
    messages: Vec<Message>,
    error_message: Option<String>,
    sending: bool,
}

struct Shared {
    log: Arc<dyn RealtimeLog>,
    identity: Arc<dyn Identity>,
    inner: Mutex<Inner>,
    view: watch::Sender<ChatView>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        let me = self.identity.current();
        let messages = inner
            .messages
            .iter()
            .map(|message| MessageView {
                own: me.as_ref().is_some_and(|user| user.id == message.author_id),
                message: message.clone(),
            })
            .collect();
        self.view.send_replace(ChatView {
            state: inner.state.clone(),
            topic: inner.topic.clone(),
            messages,
            error_message: inner.error_message.clone(),
            sending: inner.sending,
        });
    }

    /// Stop the live subscription, if any.
    fn release(&self, inner: &mut Inner) {
        if let Some(active) = inner.active.take() {
            self.log.unsubscribe(&active.address);
            active.pump.abort();
            tracing::debug!(address = %active.address, "chat subscription released");
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One discussion chat bound to at most one topic at a time.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    shared: Arc<Shared>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, log: Arc<dyn RealtimeLog>, identity: Arc<dyn Identity>) -> Self {
        let (view, _) = watch::channel(ChatView::default());
        Self {
            backend,
            shared: Arc::new(Shared { log, identity, inner: Mutex::new(Inner::default()), view }),
        }
    }

    /// Current read model.
    #[must_use]
    pub fn view(&self) -> ChatView {
        self.shared.view.borrow().clone()
    }

    /// Receiver that observes every read-model change.
    #[must_use]
    pub fn subscribe_view(&self) -> watch::Receiver<ChatView> {
        self.shared.view.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.lock().state.clone()
    }

    /// Bind the session to `topic`, replacing whatever it was bound to.
    ///
    /// Returns once the subscription is in place; the session reaches
    /// `Subscribed` when the first snapshot arrives. If the session is
    /// closed or reopened while the chat handle is being fetched, the
    /// result is discarded and `Ok(())` is returned.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidTopic`] for an empty topic id, or
    /// [`ChatError::Backend`] when the chat handle can't be obtained. The
    /// latter also leaves the session in `Failed`.
    pub async fn open(&self, topic: Topic) -> Result<(), ChatError> {
        if topic.id.trim().is_empty() {
            return Err(ChatError::InvalidTopic);
        }

        let generation = {
            let mut inner = self.shared.lock();
            self.shared.release(&mut inner);
            inner.generation += 1;
            inner.topic = Some(topic.clone());
            inner.state = SessionState::Initializing;
            inner.messages.clear();
            inner.error_message = None;
            inner.sending = false;
            self.shared.publish(&inner);
            inner.generation
        };
        tracing::info!(topic = %topic.id, generation, "opening chat");

        let result = self.backend.get_or_create_chat(&topic.id).await;

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            tracing::debug!(topic = %topic.id, generation, "discarding stale chat open");
            return Ok(());
        }

        match result {
            Ok(handle) => {
                let address = handle.log_address();
                let subscription = self.shared.log.subscribe(&address);
                let pump = tokio::spawn(pump(Arc::clone(&self.shared), generation, handle, subscription));
                tracing::debug!(%address, generation, "chat subscription started");
                inner.active = Some(ActiveSubscription { address, pump });
                Ok(())
            }
            Err(error) => {
                tracing::warn!(topic = %topic.id, %error, "chat open failed");
                let error = ChatError::from(error);
                inner.error_message = Some(error.to_string());
                inner.state = SessionState::Failed(error.clone());
                self.shared.publish(&inner);
                Err(error)
            }
        }
    }

    /// Tear down any subscription and return to `Idle`. Safe to call in
    /// any state, any number of times.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        self.shared.release(&mut inner);
        inner.generation += 1;
        if inner.state != SessionState::Idle {
            tracing::info!(from = inner.state.name(), "closing chat");
        }
        inner.topic = None;
        inner.state = SessionState::Idle;
        inner.messages.clear();
        inner.error_message = None;
        inner.sending = false;
        self.shared.publish(&inner);
    }

    /// Post `text` to the current topic.
    ///
    /// The message is not shown locally; it appears when the log delivers
    /// a snapshot containing it.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] for blank or oversized text.
    /// - [`ChatError::NotSubscribed`] outside `Subscribed`.
    /// - [`ChatError::SendInFlight`] while another send is outstanding.
    /// - [`ChatError::Backend`] when the backend rejects the message. The
    ///   session stays subscribed and the failure is shown inline.
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        let text = validate_outgoing(text)?;

        let (generation, topic_id) = {
            let mut inner = self.shared.lock();
            let topic_id = match (&inner.state, &inner.topic) {
                (SessionState::Subscribed(_), Some(topic)) => topic.id.clone(),
                _ => return Err(ChatError::NotSubscribed),
            };
            if inner.sending {
                return Err(ChatError::SendInFlight);
            }
            inner.sending = true;
            inner.error_message = None;
            self.shared.publish(&inner);
            (inner.generation, topic_id)
        };
        let guard = SendingGuard { shared: &self.shared, generation };

        let result = self.backend.append_message(&topic_id, text).await;

        if let Err(error) = &result {
            tracing::warn!(topic = %topic_id, %error, "chat send failed");
            let mut inner = self.shared.lock();
            // A transport failure that landed mid-send keeps its own message.
            if inner.generation == generation && matches!(inner.state, SessionState::Subscribed(_)) {
                inner.error_message = Some(format!("Failed to send message: {error}"));
            }
        }
        drop(guard);
        result.map_err(ChatError::from)
    }

    /// Re-run `open` for the last topic after a failure.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidState`] unless the session is `Failed`, otherwise
    /// whatever [`ChatSession::open`] returns.
    pub async fn retry(&self) -> Result<(), ChatError> {
        let topic = {
            let inner = self.shared.lock();
            match (&inner.state, &inner.topic) {
                (SessionState::Failed(_), Some(topic)) => topic.clone(),
                (state, _) => return Err(ChatError::InvalidState { op: "retry", state: state.name() }),
            }
        };
        tracing::info!(topic = %topic.id, "retrying chat");
        self.open(topic).await
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clears the in-flight flag when a send finishes or its future is dropped.
struct SendingGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.generation == self.generation {
            inner.sending = false;
            self.shared.publish(&inner);
        }
    }
}

// =============================================================================
// PUMP
// =============================================================================

/// Drain one subscription into the session until it fails or goes stale.
///
/// A channel that closes under a live generation means the log dropped
/// the listener; that is reported as [`TransportError::Closed`].
async fn pump(shared: Arc<Shared>, generation: u64, handle: ChatHandle, mut subscription: Subscription) {
    while let Some(event) = subscription.next_event().await {
        let mut inner = shared.lock();
        if inner.generation != generation {
            tracing::debug!(address = subscription.address(), generation, "dropping stale chat event");
            return;
        }
        match event {
            LogEvent::Snapshot(raw) => {
                inner.messages = decode_snapshot(raw.as_ref());
                if !matches!(inner.state, SessionState::Subscribed(_)) {
                    tracing::info!(%handle, "chat subscribed");
                    inner.state = SessionState::Subscribed(handle.clone());
                }
                tracing::trace!(%handle, count = inner.messages.len(), "chat snapshot applied");
                shared.publish(&inner);
            }
            LogEvent::Error(error) => {
                tracing::warn!(%handle, %error, "chat subscription failed");
                if let Some(active) = inner.active.take() {
                    shared.log.unsubscribe(&active.address);
                }
                let error = ChatError::from(error);
                inner.error_message = Some(error.to_string());
                inner.state = SessionState::Failed(error);
                shared.publish(&inner);
                return;
            }
        }
    }

    let mut inner = shared.lock();
    if inner.generation != generation {
        tracing::debug!(address = subscription.address(), "chat subscription ended");
        return;
    }
    tracing::warn!(%handle, "chat subscription closed by the log");
    // The log already dropped every sender at this address; only forget ours.
    inner.active = None;
    let error = ChatError::Transport(TransportError::Closed);
    inner.error_message = Some(error.to_string());
    inner.state = SessionState::Failed(error);
    shared.publish(&inner);
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
