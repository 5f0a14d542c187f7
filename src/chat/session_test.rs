use std::collections::VecDeque;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use super::*;
use crate::api::types::ApiError;
use crate::chat::UserIdentity;
use crate::chat::message::now_ms;
use crate::realtime::{MemoryLog, TransportError};

// =============================================================================
// MOCKS
// =============================================================================

#[derive(Default)]
struct MockBackend {
    chat_calls: Mutex<Vec<String>>,
    send_calls: Mutex<Vec<(String, String)>>,
    open_failures: Mutex<VecDeque<ApiError>>,
    send_failures: Mutex<VecDeque<ApiError>>,
    open_gate: Option<Arc<Notify>>,
    send_gate: Option<Arc<Notify>>,
    /// When set, accepted messages are written here like the server would.
    log: Option<Arc<MemoryLog>>,
}

impl MockBackend {
    fn chat_calls(&self) -> Vec<String> {
        self.chat_calls.lock().unwrap().clone()
    }

    fn send_count(&self) -> usize {
        self.send_calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ChatBackend for MockBackend {
    async fn get_or_create_chat(&self, topic_id: &str) -> Result<ChatHandle, ApiError> {
        self.chat_calls.lock().unwrap().push(topic_id.to_owned());
        if let Some(gate) = &self.open_gate {
            gate.notified().await;
        }
        if let Some(error) = self.open_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(ChatHandle::new(format!("h-{topic_id}")))
    }

    async fn append_message(&self, topic_id: &str, text: &str) -> Result<(), ApiError> {
        self.send_calls.lock().unwrap().push((topic_id.to_owned(), text.to_owned()));
        if let Some(gate) = &self.send_gate {
            gate.notified().await;
        }
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(log) = &self.log {
            log.push(
                &format!("chats/h-{topic_id}/messages"),
                json!({"userId": "me", "username": "Me", "text": text, "timestamp": now_ms()}),
            );
        }
        Ok(())
    }
}

struct FixedIdentity(Option<UserIdentity>);

impl Identity for FixedIdentity {
    fn current(&self) -> Option<UserIdentity> {
        self.0.clone()
    }
}

fn me() -> Arc<FixedIdentity> {
    Arc::new(FixedIdentity(Some(UserIdentity { id: "me".into(), display_name: "Me".into() })))
}

fn session_with(backend: &Arc<MockBackend>, log: &Arc<MemoryLog>) -> ChatSession {
    ChatSession::new(backend.clone(), log.clone(), me())
}

fn entry(author: &str, text: &str, timestamp: i64) -> serde_json::Value {
    json!({"userId": author, "username": author, "text": text, "timestamp": timestamp})
}

async fn wait_for(rx: &mut watch::Receiver<ChatView>, ready: impl FnMut(&ChatView) -> bool) -> ChatView {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(ready))
        .await
        .expect("timed out waiting for view")
        .expect("view channel closed")
        .clone()
}

fn texts(view: &ChatView) -> Vec<&str> {
    view.messages.iter().map(|m| m.message.text.as_str()).collect()
}

const T1_ADDRESS: &str = "chats/h-t1/messages";
const T2_ADDRESS: &str = "chats/h-t2/messages";

// =============================================================================
// OPEN
// =============================================================================

#[tokio::test]
async fn snapshots_replace_and_reorder_the_visible_list() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    log.set(T1_ADDRESS, "a", entry("u1", "hi", 100));

    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();

    let view = wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert_eq!(texts(&view), vec!["hi"]);
    assert_eq!(view.state, SessionState::Subscribed(ChatHandle::new("h-t1")));

    log.set(T1_ADDRESS, "b", entry("u2", "yo", 50));
    let view = wait_for(&mut rx, |v| v.messages.len() == 2).await;
    assert_eq!(texts(&view), vec!["yo", "hi"]);
}

#[tokio::test]
async fn empty_log_subscribes_with_no_messages() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();

    session.open(Topic::new("t1")).await.unwrap();
    let view = wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert!(view.messages.is_empty());
    assert_eq!(log.subscriber_count(T1_ADDRESS), 1);
}

#[tokio::test]
async fn own_messages_are_flagged() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    log.set(T1_ADDRESS, "a", entry("me", "mine", 1));
    log.set(T1_ADDRESS, "b", entry("u2", "theirs", 2));

    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();

    let view = wait_for(&mut rx, |v| v.messages.len() == 2).await;
    let own: Vec<bool> = view.messages.iter().map(|m| m.own).collect();
    assert_eq!(own, vec![true, false]);
}

#[tokio::test]
async fn blank_topic_is_rejected_without_backend_call() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);

    assert_eq!(session.open(Topic::new("  ")).await, Err(ChatError::InvalidTopic));
    assert!(backend.chat_calls().is_empty());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn open_failure_then_retry_uses_same_topic() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    backend
        .open_failures
        .lock()
        .unwrap()
        .push_back(ApiError::Status { status: 500, message: "boom".into() });

    let session = session_with(&backend, &log);
    let err = session.open(Topic::new("t1")).await.unwrap_err();
    assert!(matches!(err, ChatError::Backend(_)));

    let view = session.view();
    assert!(matches!(view.state, SessionState::Failed(ChatError::Backend(_))));
    assert_eq!(view.error_message.as_deref(), Some("boom (HTTP 500)"));
    assert_eq!(log.subscriber_count(T1_ADDRESS), 0);

    let mut rx = session.subscribe_view();
    session.retry().await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert_eq!(backend.chat_calls(), vec!["t1", "t1"]);
    assert!(session.view().error_message.is_none());
}

#[tokio::test]
async fn retry_outside_failed_is_rejected() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);

    assert_eq!(
        session.retry().await,
        Err(ChatError::InvalidState { op: "retry", state: "idle" })
    );
    assert!(backend.chat_calls().is_empty());
}

#[tokio::test]
async fn reopening_tears_down_previous_topic() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    log.set(T1_ADDRESS, "a", entry("u1", "old topic", 1));

    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| v.messages.len() == 1).await;

    session.open(Topic::new("t2")).await.unwrap();
    assert_eq!(log.subscriber_count(T1_ADDRESS), 0);
    assert_eq!(log.subscriber_count(T2_ADDRESS), 1);

    let view = wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert!(view.messages.is_empty());

    log.set(T1_ADDRESS, "late", entry("u1", "late", 2));
    log.set(T2_ADDRESS, "x", entry("u1", "new topic", 3));
    let view = wait_for(&mut rx, |v| !v.messages.is_empty()).await;
    assert_eq!(texts(&view), vec!["new topic"]);
}

// =============================================================================
// CLOSE
// =============================================================================

#[tokio::test]
async fn close_is_idempotent_and_safe_when_never_opened() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);

    session.close();
    session.close();
    assert_eq!(session.state(), SessionState::Idle);

    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    session.close();
    session.close();
    assert_eq!(session.view(), ChatView::default());
    assert_eq!(log.subscriber_count(T1_ADDRESS), 0);
}

#[tokio::test]
async fn close_during_open_discards_the_late_result() {
    let log = Arc::new(MemoryLog::new());
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(MockBackend { open_gate: Some(gate.clone()), ..MockBackend::default() });
    let session = Arc::new(session_with(&backend, &log));
    let mut rx = session.subscribe_view();

    let opener = {
        let session = session.clone();
        tokio::spawn(async move { session.open(Topic::new("t1")).await })
    };
    wait_for(&mut rx, |v| v.state == SessionState::Initializing).await;

    session.close();
    gate.notify_one();
    opener.await.unwrap().unwrap();

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(log.subscriber_count(T1_ADDRESS), 0);
}

#[tokio::test]
async fn dropping_the_session_releases_the_subscription() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    drop(session);
    assert_eq!(log.subscriber_count(T1_ADDRESS), 0);
}

// =============================================================================
// SEND
// =============================================================================

#[tokio::test]
async fn blank_send_never_reaches_backend() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    assert_eq!(
        session.send(" \n\t ").await,
        Err(ChatError::Validation(crate::chat::ValidationError::Empty))
    );
    assert_eq!(backend.send_count(), 0);
}

#[tokio::test]
async fn send_requires_subscription() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);

    assert_eq!(session.send("hello").await, Err(ChatError::NotSubscribed));
    assert_eq!(backend.send_count(), 0);
}

#[tokio::test]
async fn sent_message_appears_only_through_the_log() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend { log: Some(log.clone()), ..MockBackend::default() });
    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    session.send("  hello there  ").await.unwrap();
    let view = wait_for(&mut rx, |v| !v.messages.is_empty()).await;
    assert_eq!(texts(&view), vec!["hello there"]);
    assert!(view.messages[0].own);
    assert_eq!(
        backend.send_calls.lock().unwrap().as_slice(),
        &[("t1".to_owned(), "hello there".to_owned())]
    );
}

#[tokio::test]
async fn concurrent_send_is_rejected_single_flight() {
    let log = Arc::new(MemoryLog::new());
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(MockBackend { send_gate: Some(gate.clone()), ..MockBackend::default() });
    let session = Arc::new(session_with(&backend, &log));
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.send("one").await })
    };
    wait_for(&mut rx, |v| v.sending).await;

    assert_eq!(session.send("two").await, Err(ChatError::SendInFlight));
    assert_eq!(backend.send_count(), 1);

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert!(!session.view().sending);
}

#[tokio::test]
async fn send_failure_is_inline_and_keeps_subscription() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    backend
        .send_failures
        .lock()
        .unwrap()
        .push_back(ApiError::Request("connection reset".into()));
    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    let err = session.send("hi").await.unwrap_err();
    assert_eq!(err, ChatError::Backend(ApiError::Request("connection reset".into())));

    let view = session.view();
    assert!(matches!(view.state, SessionState::Subscribed(_)));
    assert!(!view.sending);
    assert_eq!(
        view.error_message,
        Some(format!("Failed to send message: {}", ApiError::Request("connection reset".into())))
    );

    session.send("again").await.unwrap();
    assert!(session.view().error_message.is_none());
}

#[tokio::test]
async fn send_failure_does_not_mask_transport_failure() {
    let log = Arc::new(MemoryLog::new());
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(MockBackend { send_gate: Some(gate.clone()), ..MockBackend::default() });
    backend
        .send_failures
        .lock()
        .unwrap()
        .push_back(ApiError::Request("connection reset".into()));
    let session = Arc::new(session_with(&backend, &log));
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    let sender = {
        let session = session.clone();
        tokio::spawn(async move { session.send("hi").await })
    };
    wait_for(&mut rx, |v| v.sending).await;

    log.fail(T1_ADDRESS, TransportError::Cancelled);
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Failed(_))).await;

    gate.notify_one();
    let err = sender.await.unwrap().unwrap_err();
    assert!(matches!(err, ChatError::Backend(_)));

    let view = session.view();
    assert_eq!(view.state, SessionState::Failed(ChatError::Transport(TransportError::Cancelled)));
    assert_eq!(view.error_message, Some(TransportError::Cancelled.to_string()));
    assert!(!view.sending);
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[tokio::test]
async fn transport_error_fails_session_until_retry() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let session = session_with(&backend, &log);
    let mut rx = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;

    log.fail(T1_ADDRESS, TransportError::Cancelled);
    let view = wait_for(&mut rx, |v| matches!(v.state, SessionState::Failed(_))).await;
    assert_eq!(view.state, SessionState::Failed(ChatError::Transport(TransportError::Cancelled)));
    assert_eq!(view.error_message, Some(TransportError::Cancelled.to_string()));

    log.set(T1_ADDRESS, "a", entry("u1", "missed", 1));
    assert!(session.view().messages.is_empty());

    session.retry().await.unwrap();
    let view = wait_for(&mut rx, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert_eq!(texts(&view), vec!["missed"]);
}

#[tokio::test]
async fn log_dropping_the_listener_fails_the_session() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(MockBackend::default());
    let first = session_with(&backend, &log);
    let second = session_with(&backend, &log);
    let mut rx_first = first.subscribe_view();
    let mut rx_second = second.subscribe_view();

    first.open(Topic::new("t1")).await.unwrap();
    second.open(Topic::new("t1")).await.unwrap();
    wait_for(&mut rx_first, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    wait_for(&mut rx_second, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert_eq!(log.subscriber_count(T1_ADDRESS), 2);

    // unsubscribe is per address, so closing one session cuts off the other
    first.close();
    let view = wait_for(&mut rx_second, |v| matches!(v.state, SessionState::Failed(_))).await;
    assert_eq!(view.state, SessionState::Failed(ChatError::Transport(TransportError::Closed)));
    assert_eq!(view.error_message, Some(TransportError::Closed.to_string()));

    second.retry().await.unwrap();
    wait_for(&mut rx_second, |v| matches!(v.state, SessionState::Subscribed(_))).await;
    assert_eq!(log.subscriber_count(T1_ADDRESS), 1);
}
