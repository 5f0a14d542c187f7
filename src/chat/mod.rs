//! Discussion chat for suggestions that reached the discussion threshold.
//!
//! DESIGN
//! ======
//! A [`ChatSession`] binds one topic (a suggestion) to a live message feed.
//! It talks to three collaborators, each behind a trait so tests can swap
//! them out:
//!
//! - [`ChatBackend`]: the REST server; hands out the chat handle for a topic
//!   and accepts new messages.
//! - [`RealtimeLog`](crate::realtime::RealtimeLog): the append-only log the
//!   handle points into; pushes the full message set on every change.
//! - [`Identity`]: who is logged in, to mark own messages.
//!
//! Messages are never echoed locally. A sent message shows up when the log
//! pushes the next snapshot containing it.

pub mod message;
pub mod offline;
pub mod session;

use std::fmt;

pub use message::{MAX_MESSAGE_LEN, Message, ValidationError};
pub use offline::OfflineBackend;
pub use session::{ChatSession, ChatView, MessageView, SessionState};

use crate::api::types::ApiError;
use crate::error::ErrorCode;
use crate::realtime::TransportError;

// =============================================================================
// TOPIC & HANDLE
// =============================================================================

/// The suggestion a chat is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub id: String,
    pub title: Option<String>,
}

impl Topic {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), title: None }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Backend-issued address of a topic's message log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatHandle(String);

impl ChatHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log address holding this chat's messages.
    #[must_use]
    pub fn log_address(&self) -> String {
        format!("chats/{}/messages", self.0)
    }
}

impl fmt::Display for ChatHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Server side of the chat feature.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Return the chat handle for `topic_id`, creating the chat on first use.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on network failure or backend rejection.
    async fn get_or_create_chat(&self, topic_id: &str) -> Result<ChatHandle, ApiError>;

    /// Append `text` to the topic's chat as the current user.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on network failure or backend rejection.
    async fn append_message(&self, topic_id: &str, text: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
}

/// Source of the logged-in user.
pub trait Identity: Send + Sync {
    fn current(&self) -> Option<UserIdentity>;
}

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// `open` was called with an empty topic id.
    #[error("topic id must not be empty")]
    InvalidTopic,

    /// Fetching the chat handle or sending a message failed.
    #[error("{0}")]
    Backend(#[from] ApiError),

    /// The realtime subscription failed or dropped.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// The message was rejected before reaching the network.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("chat is not connected")]
    NotSubscribed,

    #[error("a message is already being sent")]
    SendInFlight,

    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },
}

impl ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTopic => "E_CHAT_TOPIC",
            Self::Backend(_) => "E_CHAT_BACKEND",
            Self::Transport(_) => "E_CHAT_TRANSPORT",
            Self::Validation(_) => "E_CHAT_VALIDATION",
            Self::NotSubscribed => "E_CHAT_NOT_SUBSCRIBED",
            Self::SendInFlight => "E_CHAT_SEND_IN_FLIGHT",
            Self::InvalidState { .. } => "E_CHAT_STATE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.retryable(),
            Self::Transport(e) => e.retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
