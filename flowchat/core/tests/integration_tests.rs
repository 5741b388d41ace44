//! End-to-end behaviour of the chat engine
//!
//! Every test drives a real [`ChatEngine`] (or its parts) against in-process
//! transports with tokio's clock paused, so timings are exact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::time::{sleep, Instant};

use flowchat_core::backend::{ChannelTransport, ScriptedTransport};
use flowchat_core::streaming::StreamField;
use flowchat_core::{
    ChatEngine, ConversationFetcher, ConversationKey, ConversationStore, EngineOptions,
    FinalResponse, FrameDecoder, Message, MessageRole, MessageType, ProtocolEvent, Reconciler,
    SessionOptions, SessionOutcome, TransportError, TurnRequest, UpdateThrottler,
};

// =============================================================================
// Helpers
// =============================================================================

struct FixedFetcher(Vec<Message>);

#[async_trait]
impl ConversationFetcher for FixedFetcher {
    async fn fetch_messages(&self, _key: &ConversationKey) -> Result<Vec<Message>, TransportError> {
        Ok(self.0.clone())
    }
}

fn engine_with(transport: Arc<ChannelTransport>) -> ChatEngine {
    ChatEngine::new("u1", EngineOptions::default(), transport, None)
}

fn wire(events: &[ProtocolEvent]) -> Vec<u8> {
    events
        .iter()
        .map(ProtocolEvent::to_record)
        .collect::<String>()
        .into_bytes()
}

// =============================================================================
// Decoder
// =============================================================================

#[test]
fn test_fragmentation_preserves_event_order() {
    let events = vec![
        ProtocolEvent::Progress {
            label: "Planning…".to_string(),
        },
        ProtocolEvent::thinking("étape un"),
        ProtocolEvent::ThinkingComplete,
        ProtocolEvent::ToolStarted {
            name: "search".to_string(),
        },
        ProtocolEvent::message("Héllo 👋"),
        ProtocolEvent::WorkflowProduced {
            workflow_data: serde_json::json!({"nodes": [{"id": 1}], "edges": []}),
        },
        ProtocolEvent::final_text("Done!"),
    ];
    let bytes = wire(&events);

    let whole = FrameDecoder::new().decode(&bytes);
    assert_eq!(whole, events);

    for size in 1..bytes.len() {
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(size) {
            decoded.extend(decoder.decode(chunk));
        }
        assert_eq!(decoded, whole, "chunk size {size}");
        assert_eq!(decoder.dropped(), 0);
    }
}

#[test]
fn test_split_record_yields_one_delta() {
    let mut decoder = FrameDecoder::new();
    assert!(decoder
        .decode(br#"data: {"type":"message","content":"Hel"#)
        .is_empty());
    assert_eq!(
        decoder.decode(b"lo\"}\n"),
        vec![ProtocolEvent::message("Hello")]
    );
}

// =============================================================================
// Throttling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_within_interval_is_one_flush() {
    let start = Instant::now();
    let mut throttler = UpdateThrottler::new(Duration::from_millis(50), start);

    for _ in 0..10 {
        assert!(throttler.push(StreamField::Message, "a", Instant::now()).is_none());
        sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(throttler.next_deadline(), Some(start + Duration::from_millis(50)));

    sleep(Duration::from_millis(40)).await;
    let flushes = throttler.flush_due(Instant::now());
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].text, "a".repeat(10));
    assert_eq!(throttler.flush_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_flush_keeps_every_delta() {
    let transport = ScriptedTransport::new()
        .event(&ProtocolEvent::thinking("th"))
        .event(&ProtocolEvent::thinking("ink"))
        .event(&ProtocolEvent::message("a"))
        .delay(Duration::from_millis(60))
        .event(&ProtocolEvent::message("b"))
        .event(&ProtocolEvent::message("c"))
        .event(&ProtocolEvent::Done);
    let engine = ChatEngine::new("u1", EngineOptions::default(), Arc::new(transport), None);
    let key = ConversationKey::conversation("c");
    let streaming = engine.streaming_state(&key);

    engine
        .start_turn(engine.request("hi").conversation("c").build())
        .unwrap();
    assert_eq!(engine.wait_turn(&key).await, Some(SessionOutcome::Completed));

    let state = streaming.borrow().clone();
    assert!(!state.is_streaming);
    assert_eq!(state.thinking_text, "think");
    assert_eq!(state.message_text, "abc");

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert_eq!(conversation.last().unwrap().content, "abc");
}

// =============================================================================
// Supersession
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_superseded_bytes_never_observed() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = engine_with(transport.clone());
    let key = ConversationKey::conversation("c");
    let streaming = engine.streaming_state(&key);

    engine
        .start_turn(engine.request("first").conversation("c").build())
        .unwrap();
    let a = transport.accept().await.unwrap();
    a.send_event(&ProtocolEvent::message("from A"));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(streaming.borrow().message_text, "from A");

    engine
        .start_turn(engine.request("second").conversation("c").build())
        .unwrap();
    let b = transport.accept().await.unwrap();
    assert!(streaming.borrow().message_text.is_empty());

    sleep(Duration::from_millis(50)).await;
    a.send_event(&ProtocolEvent::message(" late"));
    a.send_event(&ProtocolEvent::final_text("from A late"));
    b.send_event(&ProtocolEvent::message("from B"));
    sleep(Duration::from_millis(100)).await;

    let state = streaming.borrow().clone();
    assert!(state.is_streaming);
    assert_eq!(state.message_text, "from B");
    assert!(a.is_closed());

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert!(conversation
        .messages
        .iter()
        .all(|m| !m.content.contains("from A")));
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_scoped_to_its_conversation() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = engine_with(transport.clone());
    let a_key = ConversationKey::conversation("a");
    let b_key = ConversationKey::conversation("b");

    engine
        .start_turn(engine.request("one").conversation("a").build())
        .unwrap();
    let a = transport.accept().await.unwrap();
    engine
        .start_turn(engine.request("two").conversation("b").build())
        .unwrap();
    let b = transport.accept().await.unwrap();

    a.fail("reset by peer");
    b.send_event(&ProtocolEvent::final_text("fine"));

    assert!(matches!(
        engine.wait_turn(&a_key).await,
        Some(SessionOutcome::Failed(_))
    ));
    assert_eq!(engine.wait_turn(&b_key).await, Some(SessionOutcome::Completed));

    let b_conv = engine.conversation_snapshot(&b_key).unwrap();
    assert_eq!(b_conv.len(), 2);
    assert_eq!(b_conv.messages[1].content, "fine");
    assert!(b_conv.messages.iter().all(|m| m.message_type != MessageType::Error));
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_refetch_after_final_response_has_no_duplicate() {
    let store = Arc::new(ConversationStore::new());
    let reconciler = Reconciler::new(store);
    let key = ConversationKey::conversation("c");
    let request = TurnRequest::builder("u1", "hi").conversation("c").build();

    let token = reconciler.begin_turn(&key);
    assert!(reconciler.on_session_start(&token, &request));
    assert!(reconciler.on_final_response(&token, &request, FinalResponse::text("Done!")));

    let server = vec![Message::user("hi"), Message::assistant("Done!")];
    reconciler.apply_refetch(&key, server);

    let conversation = reconciler.store().snapshot(&key).unwrap();
    let done = conversation
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant && m.content == "Done!")
        .count();
    assert_eq!(done, 1);
    assert!(conversation.optimistic().next().is_none());
}

#[tokio::test]
async fn test_final_response_after_refetch_has_no_duplicate() {
    let reconciler = Reconciler::new(Arc::new(ConversationStore::new()));
    let key = ConversationKey::conversation("c");
    let request = TurnRequest::builder("u1", "hi").conversation("c").build();

    let token = reconciler.begin_turn(&key);
    reconciler.on_session_start(&token, &request);
    reconciler.apply_refetch(&key, vec![Message::user("hi"), Message::assistant("Done!")]);
    assert!(!reconciler.on_final_response(&token, &request, FinalResponse::text("Done!")));

    let conversation = reconciler.store().snapshot(&key).unwrap();
    assert_eq!(conversation.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_refresh_after_turn() {
    let transport = ScriptedTransport::new().event(&ProtocolEvent::final_text("Done!"));
    let fetcher = Arc::new(FixedFetcher(vec![
        Message::user("hi"),
        Message::assistant("Done!"),
    ]));
    let engine = ChatEngine::new(
        "u1",
        EngineOptions::default(),
        Arc::new(transport),
        Some(fetcher),
    );
    let key = ConversationKey::conversation("c");

    engine
        .start_turn(engine.request("hi").conversation("c").build())
        .unwrap();
    engine.wait_turn(&key).await;
    assert_eq!(engine.refresh(&key).await.unwrap(), 2);

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert_eq!(conversation.len(), 2);
    assert!(conversation.synced_at.is_some());
}

// =============================================================================
// Stopping and timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_turn_while_awaited() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = Arc::new(engine_with(transport.clone()));
    let key = ConversationKey::conversation("c");

    engine
        .start_turn(engine.request("hi").conversation("c").build())
        .unwrap();
    let stream = transport.accept().await.unwrap();

    let waiter = tokio::spawn({
        let engine = engine.clone();
        let key = key.clone();
        async move { engine.wait_turn(&key).await }
    });
    sleep(Duration::from_millis(10)).await;
    assert!(engine.is_active(&key));

    assert!(engine.stop_turn(&key));
    stream.send_event(&ProtocolEvent::message("late"));
    stream.send_event(&ProtocolEvent::Done);

    assert_eq!(waiter.await.unwrap(), Some(SessionOutcome::Cancelled));
    sleep(Duration::from_millis(100)).await;

    assert!(stream.is_closed());
    assert!(!engine.is_active(&key));
    let state = engine.streaming_state(&key).borrow().clone();
    assert!(!state.is_streaming);
    assert_eq!(state.message_text, "");

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert!(conversation.messages.iter().all(|m| m.content != "late"));
    assert!(conversation
        .messages
        .iter()
        .all(|m| m.role != MessageRole::Assistant));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_open_hits_idle_timeout() {
    let transport = ScriptedTransport::new()
        .with_open_delay(Duration::from_secs(3600))
        .event(&ProtocolEvent::Done);
    let options = EngineOptions {
        session: SessionOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            ..SessionOptions::default()
        },
        ..EngineOptions::default()
    };
    let engine = ChatEngine::new("u1", options, Arc::new(transport), None);
    let key = ConversationKey::conversation("c");

    engine
        .start_turn(engine.request("hi").conversation("c").build())
        .unwrap();
    let started = Instant::now();

    assert_eq!(
        engine.wait_turn(&key).await,
        Some(SessionOutcome::Failed("no data received for 5s".to_string()))
    );
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(!engine.is_active(&key));
    assert!(!engine.streaming_state(&key).borrow().is_streaming);

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation.messages[0].message_type, MessageType::Error);
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_error_rolls_back_optimistic_message() {
    let reconciler = Reconciler::new(Arc::new(ConversationStore::new()));
    let key = ConversationKey::conversation("c");
    let request = TurnRequest::builder("u1", "hi").conversation("c").build();

    let token = reconciler.begin_turn(&key);
    reconciler.on_session_start(&token, &request);
    assert!(reconciler.on_error(&token, &request, "network down"));

    let conversation = reconciler.store().snapshot(&key).unwrap();
    assert_eq!(conversation.len(), 1);
    let only = &conversation.messages[0];
    assert_eq!(only.role, MessageRole::Assistant);
    assert_eq!(only.message_type, MessageType::Error);
    assert!(conversation
        .messages
        .iter()
        .all(|m| !(m.role == MessageRole::User && m.content == "hi")));
}

#[tokio::test(start_paused = true)]
async fn test_transport_refusal_rolls_back_through_engine() {
    let transport = ScriptedTransport::refusing("connection refused");
    let engine = ChatEngine::new("u1", EngineOptions::default(), Arc::new(transport), None);
    let key = ConversationKey::conversation("c");

    engine
        .start_turn(engine.request("hi").conversation("c").build())
        .unwrap();
    assert!(matches!(
        engine.wait_turn(&key).await,
        Some(SessionOutcome::Failed(_))
    ));

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation.messages[0].message_type, MessageType::Error);
    assert!(!engine.streaming_state(&key).borrow().is_streaming);
}

#[tokio::test(start_paused = true)]
async fn test_orphan_conversation_streams_like_any_other() {
    let transport = ScriptedTransport::new()
        .event(&ProtocolEvent::message("Hi "))
        .event(&ProtocolEvent::message("there"))
        .event(&ProtocolEvent::Done);
    let engine = ChatEngine::new("u1", EngineOptions::default(), Arc::new(transport), None);
    let key = ConversationKey::orphan("u1");

    engine.start_turn(engine.request("hello").build()).unwrap();
    assert_eq!(engine.wait_turn(&key).await, Some(SessionOutcome::Completed));

    let conversation = engine.conversation_snapshot(&key).unwrap();
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.messages[1].content, "Hi there");
}
