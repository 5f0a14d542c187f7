//! In-process realtime log.
//!
//! Keeps one [`SnapshotMirror`] per address and fans every change out to
//! that address's subscribers as a full snapshot. Used by the test suite
//! and by `locality chat --offline`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::mirror::SnapshotMirror;
use super::{LogEvent, RealtimeLog, Subscription, TransportError};

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, SnapshotMirror>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<LogEvent>>>,
}

#[derive(Default)]
pub struct MemoryLog {
    inner: Mutex<MemoryInner>,
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` under a fresh key and return the key.
    pub fn push(&self, address: &str, value: Value) -> String {
        let key = Uuid::new_v4().simple().to_string();
        self.set(address, &key, value);
        key
    }

    /// Write `value` under an explicit child key (null deletes it).
    pub fn set(&self, address: &str, key: &str, value: Value) {
        let mut inner = self.lock();
        inner
            .values
            .entry(address.to_owned())
            .or_default()
            .put(&format!("/{key}"), value);
        notify(&mut inner, address);
    }

    /// Fail every subscriber at `address`. They receive no further events.
    pub fn fail(&self, address: &str, error: TransportError) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.remove(address) {
            tracing::debug!(%address, count = subscribers.len(), %error, "failing memory subscribers");
            for tx in subscribers {
                if tx.send(LogEvent::Error(error.clone())).is_err() {
                    tracing::trace!(%address, "subscriber already gone");
                }
            }
        }
    }

    /// Current value at `address`.
    #[must_use]
    pub fn snapshot(&self, address: &str) -> Option<Value> {
        self.lock()
            .values
            .get(address)
            .and_then(|mirror| mirror.snapshot().cloned())
    }

    /// Number of live subscribers at `address`.
    #[must_use]
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.lock()
            .subscribers
            .get(address)
            .map_or(0, |subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn notify(inner: &mut MemoryInner, address: &str) {
    let snapshot = inner
        .values
        .get(address)
        .and_then(|mirror| mirror.snapshot().cloned());
    if let Some(subscribers) = inner.subscribers.get_mut(address) {
        subscribers.retain(|tx| tx.send(LogEvent::Snapshot(snapshot.clone())).is_ok());
    }
}

impl RealtimeLog for MemoryLog {
    fn subscribe(&self, address: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let snapshot = inner
            .values
            .get(address)
            .and_then(|mirror| mirror.snapshot().cloned());
        if tx.send(LogEvent::Snapshot(snapshot)).is_ok() {
            inner.subscribers.entry(address.to_owned()).or_default().push(tx);
        }
        tracing::debug!(%address, "memory subscription opened");
        Subscription::new(address, rx)
    }

    fn unsubscribe(&self, address: &str) {
        if self.lock().subscribers.remove(address).is_some() {
            tracing::debug!(%address, "memory subscription closed");
        }
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
