//! Realtime log: a subscribable, append-only JSON store keyed by address.
//!
//! DESIGN
//! ======
//! Every change at a subscribed address is delivered as the *entire*
//! current value, never as a delta. `FirebaseLog` folds the vendor's
//! streaming `put`/`patch` events into a local mirror to uphold that;
//! `MemoryLog` stores values directly and backs tests and offline runs.
//!
//! Subscriptions hand back a channel receiver rather than taking
//! callbacks. The consumer owns the receiver and drains it from its own
//! task, so tearing down a subscription is just aborting that task and
//! telling the log to stop producing.

pub mod firebase;
pub mod memory;
pub mod mirror;

use serde_json::Value;
use tokio::sync::mpsc;

pub use firebase::FirebaseLog;
pub use memory::MemoryLog;

use crate::error::ErrorCode;

// =============================================================================
// ERROR
// =============================================================================

/// Failures of the realtime subscription itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The streaming request could not be sent.
    #[error("realtime request failed: {0}")]
    Request(String),

    /// The endpoint answered with a non-success status.
    #[error("realtime endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Reading the response body failed mid-stream.
    #[error("realtime stream read failed: {0}")]
    Stream(String),

    /// An event payload was not valid JSON of the expected shape.
    #[error("realtime event decode failed: {0}")]
    Decode(String),

    /// The server cancelled the listener (usually a rules change).
    #[error("realtime listener cancelled by server")]
    Cancelled,

    /// The auth credential used for the stream expired or was revoked.
    #[error("realtime credentials revoked")]
    AuthRevoked,

    /// The stream ended without an error event.
    #[error("realtime stream closed")]
    Closed,
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_RT_REQUEST",
            Self::Status { .. } => "E_RT_STATUS",
            Self::Stream(_) => "E_RT_STREAM",
            Self::Decode(_) => "E_RT_DECODE",
            Self::Cancelled => "E_RT_CANCELLED",
            Self::AuthRevoked => "E_RT_AUTH_REVOKED",
            Self::Closed => "E_RT_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::AuthRevoked)
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// One delivery from a subscribed address.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// Full current value; `None` when the address is empty.
    Snapshot(Option<Value>),
    /// The subscription failed. No further events follow.
    Error(TransportError),
}

/// Live subscription handle returned by [`RealtimeLog::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    address: String,
    events: mpsc::UnboundedReceiver<LogEvent>,
}

impl Subscription {
    #[must_use]
    pub fn new(address: impl Into<String>, events: mpsc::UnboundedReceiver<LogEvent>) -> Self {
        Self { address: address.into(), events }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the next event. `None` once the producer is gone.
    pub async fn next_event(&mut self) -> Option<LogEvent> {
        self.events.recv().await
    }
}

// =============================================================================
// LOG TRAIT
// =============================================================================

/// A subscribable log. Implementations must deliver the current value
/// promptly after `subscribe` and again on every change.
pub trait RealtimeLog: Send + Sync {
    /// Start listening at `address`.
    fn subscribe(&self, address: &str) -> Subscription;

    /// Stop every listener at `address`. Safe when none is active.
    fn unsubscribe(&self, address: &str);
}
