use std::cell::RefCell;
use std::sync::Mutex;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use super::*;
use locality_connect::chat::{ChatHandle, Message};

const NOW: i64 = 1_000;

fn item(id: &str, author: &str, text: &str, timestamp: i64) -> MessageView {
    MessageView {
        message: Message {
            id: id.into(),
            author_id: author.into(),
            author_name: author.into(),
            text: text.into(),
            timestamp,
        },
        own: false,
    }
}

fn subscribed(messages: Vec<MessageView>) -> ChatView {
    ChatView {
        state: SessionState::Subscribed(ChatHandle::new("h1")),
        messages,
        ..ChatView::default()
    }
}

fn messages(lines: &[Line]) -> Vec<&str> {
    lines
        .iter()
        .filter_map(|line| match line {
            Line::Message(text) => Some(text.as_str()),
            Line::Status(_) => None,
        })
        .collect()
}

#[test]
fn later_messages_are_appended() {
    let mut transcript = Transcript::default();
    let first = transcript.update(&subscribed(vec![item("a", "ana", "hi", 100)]), NOW);
    assert_eq!(first[0], Line::Status("-- connected (h1)".into()));
    assert_eq!(messages(&first), vec!["[00:00] ana: hi"]);

    let next = transcript.update(
        &subscribed(vec![item("a", "ana", "hi", 100), item("c", "bo", "later", 200)]),
        NOW,
    );
    assert_eq!(next, vec![Line::Message("[00:00] bo: later".into())]);
}

#[test]
fn earlier_message_redraws_sorted_history() {
    let mut transcript = Transcript::default();
    transcript.update(&subscribed(vec![item("a", "ana", "hi", 100)]), NOW);

    let lines = transcript.update(
        &subscribed(vec![item("b", "bo", "yo", 50), item("a", "ana", "hi", 100)]),
        NOW,
    );
    assert_eq!(
        lines,
        vec![
            Line::Status("-- earlier messages arrived; history so far:".into()),
            Line::Message("[00:00] bo: yo".into()),
            Line::Message("[00:00] ana: hi".into()),
        ]
    );

    // nothing new: nothing printed
    let again = transcript.update(
        &subscribed(vec![item("b", "bo", "yo", 50), item("a", "ana", "hi", 100)]),
        NOW,
    );
    assert!(again.is_empty());
}

#[test]
fn state_and_error_changes_are_reported_once() {
    let mut transcript = Transcript::default();
    let failed = ChatView {
        state: SessionState::Failed(ChatError::Transport(TransportError::Closed)),
        error_message: Some("stream closed".into()),
        ..ChatView::default()
    };

    let lines = transcript.update(&failed, NOW);
    assert_eq!(
        lines,
        vec![
            Line::Status("-- disconnected; /retry to reconnect".into()),
            Line::Status("!! stream closed".into()),
        ]
    );
    assert!(transcript.update(&failed, NOW).is_empty());
}

#[test]
fn own_messages_are_attributed_to_you() {
    let mut transcript = Transcript::default();
    let mut mine = item("a", "ana", "hello", 100);
    mine.own = true;
    let lines = transcript.update(&subscribed(vec![mine]), NOW);
    assert_eq!(messages(&lines), vec!["[00:00] you: hello"]);
}

// =============================================================================
// REPL
// =============================================================================

/// Accepts the chat handle at once and holds every send until released.
#[derive(Default)]
struct GatedBackend {
    gate: Notify,
    sends: Mutex<Vec<String>>,
}

impl GatedBackend {
    fn sends(&self) -> Vec<String> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChatBackend for GatedBackend {
    async fn get_or_create_chat(&self, topic_id: &str) -> Result<ChatHandle, ApiError> {
        Ok(ChatHandle::new(format!("h-{topic_id}")))
    }

    async fn append_message(&self, _topic_id: &str, text: &str) -> Result<(), ApiError> {
        self.sends.lock().unwrap().push(text.to_owned());
        self.gate.notified().await;
        Ok(())
    }
}

async fn until(mut ready: impl FnMut() -> bool) {
    while !ready() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn outstanding_send_keeps_rendering_and_input_live() {
    let log = Arc::new(MemoryLog::new());
    let backend = Arc::new(GatedBackend::default());
    let session = ChatSession::new(backend.clone(), log.clone(), Arc::new(AuthSession::in_memory()));
    let mut views = session.subscribe_view();
    session.open(Topic::new("t1")).await.unwrap();
    views
        .wait_for(|v| matches!(v.state, SessionState::Subscribed(_)))
        .await
        .unwrap();

    let (mut input, reader) = tokio::io::duplex(256);
    let out = RefCell::new(Vec::new());
    let repl = chat_repl(&session, BufReader::new(reader), |line| out.borrow_mut().push(line));
    let printed = |wanted: &dyn Fn(&Line) -> bool| out.borrow().iter().any(wanted);

    let driver = async {
        input.write_all(b"hello\n").await.unwrap();
        until(|| backend.sends() == ["hello"]).await;

        // the send is still held; a new message must still be drawn
        log.set(
            "chats/h-t1/messages",
            "a",
            json!({"userId": "u2", "username": "bo", "text": "while sending", "timestamp": 1}),
        );
        until(|| printed(&|line| matches!(line, Line::Message(text) if text.ends_with("bo: while sending")))).await;

        input.write_all(b"again\n").await.unwrap();
        until(|| printed(&|line| *line == Line::Status(BUSY.into()))).await;

        input.write_all(b"/quit\n").await.unwrap();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(repl, driver) })
        .await
        .expect("repl stalled behind the outstanding send");
    result.unwrap();
    assert_eq!(backend.sends(), vec!["hello"]);
    assert!(!session.view().sending);
}
