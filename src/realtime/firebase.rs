//! Firebase Realtime Database over its REST streaming API.
//!
//! ARCHITECTURE
//! ============
//! `GET {database}/{address}.json` with `Accept: text/event-stream` keeps a
//! long-lived response open. The server first sends `put {path:"/", data}`
//! with the current value, then `put`/`patch` events for each change,
//! `keep-alive` pings, and `cancel`/`auth_revoked` on failure.
//!
//! `eventsource-stream` frames the body into events. One tokio task per
//! subscribed address owns the HTTP stream and a [`SnapshotMirror`];
//! after every data event it sends the whole mirrored value down the
//! subscription channel. Unsubscribing aborts the task,
//! which drops the response and closes the connection.
//!
//! TRADE-OFFS
//! ==========
//! The client has a connect timeout but no overall request timeout,
//! since the response body is expected to stay open indefinitely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use eventsource_stream::{Event, Eventsource};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::mirror::SnapshotMirror;
use super::{LogEvent, RealtimeLog, Subscription, TransportError};

// =============================================================================
// CLIENT
// =============================================================================

pub struct FirebaseLog {
    http: reqwest::Client,
    database_url: String,
    auth: Option<String>,
    streams: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FirebaseLog {
    /// Build a log client for `database_url`.
    ///
    /// `auth` is appended as the `auth` query parameter when present
    /// (a database secret or ID token).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Request`] if the HTTP client fails to build.
    pub fn new(database_url: &str, auth: Option<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            http,
            database_url: database_url.trim_end_matches('/').to_owned(),
            auth,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// REST URL for `address`.
    #[must_use]
    pub fn stream_url(&self, address: &str) -> String {
        format!("{}/{}.json", self.database_url, address.trim_matches('/'))
    }

    /// Number of addresses with a running stream task.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.lock()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl RealtimeLog for FirebaseLog {
    fn subscribe(&self, address: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut request = self
            .http
            .get(self.stream_url(address))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(auth) = &self.auth {
            request = request.query(&[("auth", auth)]);
        }

        let task = tokio::spawn(run_stream(request, address.to_owned(), tx));
        if let Some(previous) = self.lock().insert(address.to_owned(), task) {
            tracing::warn!(%address, "replacing existing realtime stream");
            previous.abort();
        }
        tracing::debug!(%address, "realtime stream started");

        Subscription::new(address, rx)
    }

    fn unsubscribe(&self, address: &str) {
        if let Some(task) = self.lock().remove(address) {
            task.abort();
            tracing::debug!(%address, "realtime stream stopped");
        }
    }
}

impl Drop for FirebaseLog {
    fn drop(&mut self) {
        for (_, task) in self.lock().drain() {
            task.abort();
        }
    }
}

// =============================================================================
// STREAM TASK
// =============================================================================

async fn run_stream(request: reqwest::RequestBuilder, address: String, tx: mpsc::UnboundedSender<LogEvent>) {
    let Err(error) = stream_events(request, &tx).await else {
        tracing::debug!(%address, "realtime consumer went away");
        return;
    };

    tracing::warn!(%address, %error, "realtime stream failed");
    if tx.send(LogEvent::Error(error)).is_err() {
        tracing::debug!(%address, "realtime error dropped; consumer went away");
    }
}

/// Pump the HTTP stream into `tx`.
///
/// Returns `Ok(())` only when the receiver is dropped; every other exit
/// is an error the subscriber needs to hear about.
async fn stream_events(
    request: reqwest::RequestBuilder,
    tx: &mpsc::UnboundedSender<LogEvent>,
) -> Result<(), TransportError> {
    let response = request
        .send()
        .await
        .map_err(|e| TransportError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status { status: status.as_u16(), body });
    }

    let mut mirror = SnapshotMirror::new();
    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| TransportError::Stream(e.to_string()))?;
        let Some(delivery) = apply_event(&mut mirror, &event)? else {
            continue;
        };
        if tx.send(delivery).is_err() {
            return Ok(());
        }
    }

    Err(TransportError::Closed)
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

#[derive(Debug, Deserialize)]
struct DataEvent {
    path: String,
    #[serde(default)]
    data: Value,
}

/// Fold one server event into `mirror`.
///
/// Returns the snapshot to deliver for data events, `None` for events that
/// don't change the value, and an error for terminal events.
pub(crate) fn apply_event(mirror: &mut SnapshotMirror, event: &Event) -> Result<Option<LogEvent>, TransportError> {
    match event.event.as_str() {
        "put" | "patch" => {
            let payload: DataEvent =
                serde_json::from_str(&event.data).map_err(|e| TransportError::Decode(e.to_string()))?;
            if event.event == "put" {
                mirror.put(&payload.path, payload.data);
            } else {
                mirror.patch(&payload.path, payload.data);
            }
            Ok(Some(LogEvent::Snapshot(mirror.snapshot().cloned())))
        }
        "keep-alive" => Ok(None),
        "cancel" => Err(TransportError::Cancelled),
        "auth_revoked" => Err(TransportError::AuthRevoked),
        other => {
            tracing::debug!(event = other, "ignoring unknown realtime event");
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "firebase_test.rs"]
mod tests;
