//! Realtime change feed
//!
//! Drives `RealtimeFeed` against a scripted websocket server speaking the
//! realtime channel protocol (join/reply, postgres_changes, heartbeat, leave).

use chat_sync::error::ChatError;
use chat_sync::feed::{ ChangeFeed, FeedCallback, FeedEvent, RealtimeConfig, RealtimeFeed, ReconnectPolicy };
use futures_util::{ SinkExt, StreamExt };
use serde_json::{ json, Value };
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

#[derive(Clone, Copy, PartialEq)]
enum JoinMode {
    Accept,
    Reject,
    Ignore,
}

enum Script {
    Push(Value),
    Hangup,
}

struct MockRealtime {
    url: String,
    script: mpsc::UnboundedSender<Script>,
    seen: mpsc::UnboundedReceiver<Value>,
    joins: Arc<AtomicUsize>,
}

impl MockRealtime {
    fn push(&self, frame: Value) {
        self.script.send(Script::Push(frame)).unwrap();
    }

    fn hangup(&self) {
        self.script.send(Script::Hangup).unwrap();
    }

    /// Next frame from the client whose event is `event`.
    async fn expect_frame(&mut self, event: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.seen.recv()).await
                .unwrap_or_else(|_| panic!("no {} frame from client", event))
                .expect("mock server stopped");
            if frame["event"] == event {
                return frame;
            }
        }
    }
}

async fn spawn_realtime(mode: JoinMode) -> MockRealtime {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (script_tx, mut script_rx) = mpsc::unbounded_channel::<Script>();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel::<Value>();
    let joins = Arc::new(AtomicUsize::new(0));
    let server_joins = joins.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(stream).await else {
                continue;
            };
            loop {
                tokio::select! {
                    command = script_rx.recv() => {
                        match command {
                            Some(Script::Push(frame)) => {
                                let _ = ws.send(WsMessage::Text(frame.to_string())).await;
                            }
                            Some(Script::Hangup) => {
                                let _ = ws.close(None).await;
                                break;
                            }
                            None => return,
                        }
                    }
                    incoming = ws.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                let frame: Value = serde_json::from_str(&text).unwrap();
                                if frame["event"] == "phx_join" && mode != JoinMode::Ignore {
                                    server_joins.fetch_add(1, Ordering::SeqCst);
                                    let status = if mode == JoinMode::Accept { "ok" } else { "error" };
                                    let reply = json!({
                                        "topic": frame["topic"],
                                        "event": "phx_reply",
                                        "payload": { "status": status, "response": { "postgres_changes": [] } },
                                        "ref": frame["ref"],
                                    });
                                    let _ = ws.send(WsMessage::Text(reply.to_string())).await;
                                }
                                let _ = seen_tx.send(frame);
                            }
                            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
        }
    });

    MockRealtime {
        url: format!("ws://{}/realtime/v1/websocket", addr),
        script: script_tx,
        seen: seen_rx,
        joins,
    }
}

fn config(url: &str, reconnect: ReconnectPolicy) -> RealtimeConfig {
    RealtimeConfig {
        url: url.to_string(),
        api_key: "anon".to_string(),
        table: "messages".to_string(),
        heartbeat: Duration::from_secs(30),
        join_timeout: Duration::from_millis(500),
        reconnect,
    }
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

fn collector() -> (FeedCallback, mpsc::UnboundedReceiver<FeedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: FeedCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<FeedEvent>) -> FeedEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv()).await
        .expect("no feed event in time")
        .expect("feed callback dropped")
}

fn insert_frame(conversation_id: &str, table: &str, id: u64, content: &str) -> Value {
    json!({
        "topic": format!("realtime:chat-{}", conversation_id),
        "event": "postgres_changes",
        "payload": {
            "data": {
                "type": "INSERT",
                "schema": "public",
                "table": table,
                "commit_timestamp": "2024-10-01T12:00:00Z",
                "record": {
                    "id": id,
                    "chat_id": conversation_id,
                    "sender": "bot",
                    "content": content,
                    "created_at": "2024-10-01T12:00:00.250"
                }
            },
            "ids": [1]
        },
        "ref": null
    })
}

#[tokio::test]
async fn test_join_carries_conversation_filter() {
    let mut server = spawn_realtime(JoinMode::Accept).await;
    let feed = RealtimeFeed::new(config(&server.url, ReconnectPolicy::disabled()));
    let (callback, _events) = collector();

    let subscription = feed.subscribe("c1", callback).await.unwrap();
    let join = server.expect_frame("phx_join").await;

    assert_eq!(join["topic"], "realtime:chat-c1");
    assert_eq!(join["payload"]["access_token"], "anon");
    let change = &join["payload"]["config"]["postgres_changes"][0];
    assert_eq!(change["event"], "INSERT");
    assert_eq!(change["table"], "messages");
    assert_eq!(change["filter"], "chat_id=eq.c1");
    subscription.close().await;
}

#[tokio::test]
async fn test_inserts_are_delivered_and_foreign_rows_dropped() {
    let server = spawn_realtime(JoinMode::Accept).await;
    let feed = RealtimeFeed::new(config(&server.url, ReconnectPolicy::disabled()));
    let (callback, mut events) = collector();
    let subscription = feed.subscribe("c1", callback).await.unwrap();

    server.push(insert_frame("c2", "messages", 1, "not ours"));
    server.push(insert_frame("c1", "other_table", 2, "wrong table"));
    server.push(json!({ "topic": "realtime:chat-c1", "event": "postgres_changes", "payload": { "nope": 1 } }));
    server.push(insert_frame("c1", "messages", 3, "hello"));

    match next_event(&mut events).await {
        FeedEvent::Inserted(message) => {
            assert_eq!(message.id, "3");
            assert_eq!(message.conversation_id, "c1");
            assert_eq!(message.content, "hello");
            assert_eq!(message.created_at.timestamp_subsec_millis(), 250);
        }
        other => panic!("unexpected event {:?}", other),
    }
    subscription.close().await;
}

#[tokio::test]
async fn test_rejected_join_fails_subscribe() {
    let server = spawn_realtime(JoinMode::Reject).await;
    let feed = RealtimeFeed::new(config(&server.url, ReconnectPolicy::disabled()));
    let (callback, _events) = collector();

    let err = feed.subscribe("c1", callback).await.err().unwrap();
    assert!(matches!(err, ChatError::Transport(_)));
}

#[tokio::test]
async fn test_unacknowledged_join_times_out() {
    let server = spawn_realtime(JoinMode::Ignore).await;
    let feed = RealtimeFeed::new(config(&server.url, ReconnectPolicy::disabled()));
    let (callback, _events) = collector();

    let err = feed.subscribe("c1", callback).await.err().unwrap();
    assert!(err.to_string().contains("not acknowledged"));
}

#[tokio::test]
async fn test_heartbeats_are_sent_on_phoenix_topic() {
    let mut server = spawn_realtime(JoinMode::Accept).await;
    let mut cfg = config(&server.url, ReconnectPolicy::disabled());
    cfg.heartbeat = Duration::from_millis(50);
    let feed = RealtimeFeed::new(cfg);
    let (callback, _events) = collector();
    let subscription = feed.subscribe("c1", callback).await.unwrap();

    let heartbeat = server.expect_frame("heartbeat").await;
    assert_eq!(heartbeat["topic"], "phoenix");
    subscription.close().await;
}

#[tokio::test]
async fn test_close_leaves_channel_and_stops_callbacks() {
    let mut server = spawn_realtime(JoinMode::Accept).await;
    let feed = RealtimeFeed::new(config(&server.url, ReconnectPolicy::disabled()));
    let (callback, mut events) = collector();
    let subscription = feed.subscribe("c1", callback).await.unwrap();

    subscription.close().await;
    subscription.close().await;
    assert!(subscription.is_closed());
    let leave = server.expect_frame("phx_leave").await;
    assert_eq!(leave["topic"], "realtime:chat-c1");

    server.push(insert_frame("c1", "messages", 5, "after close"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_dropped_connection_without_reconnect_is_lost() {
    let server = spawn_realtime(JoinMode::Accept).await;
    let feed = RealtimeFeed::new(config(&server.url, ReconnectPolicy::disabled()));
    let (callback, mut events) = collector();
    let subscription = feed.subscribe("c1", callback).await.unwrap();

    server.hangup();
    assert!(matches!(next_event(&mut events).await, FeedEvent::Lost(_)));
    assert_eq!(server.joins.load(Ordering::SeqCst), 1);
    subscription.close().await;
}

#[tokio::test]
async fn test_dropped_connection_with_reconnect_rejoins_and_resumes() {
    let server = spawn_realtime(JoinMode::Accept).await;
    let feed = RealtimeFeed::new(config(&server.url, fast_reconnect()));
    let (callback, mut events) = collector();
    let subscription = feed.subscribe("c1", callback).await.unwrap();

    server.hangup();
    assert_eq!(next_event(&mut events).await, FeedEvent::Resumed);
    assert_eq!(server.joins.load(Ordering::SeqCst), 2);

    server.push(insert_frame("c1", "messages", 8, "after resume"));
    match next_event(&mut events).await {
        FeedEvent::Inserted(message) => assert_eq!(message.content, "after resume"),
        other => panic!("unexpected event {:?}", other),
    }
    subscription.close().await;
}

#[tokio::test]
async fn test_unreachable_server_fails_subscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let feed = RealtimeFeed::new(
        config(&format!("ws://{}/realtime/v1/websocket", addr), ReconnectPolicy::disabled())
    );
    let (callback, _events) = collector();
    let err = feed.subscribe("c1", callback).await.err().unwrap();
    assert!(err.is_transport());
}
