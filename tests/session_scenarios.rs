//! End-to-end session scenarios against an in-process signaling server and
//! a scripted media factory. No real network negotiation takes place; the
//! factory emits the lifecycle events a live peer connection would.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use morphstream::{
    ClientConfig, ConnectionState, Error, IceServerEntry, LocalMediaSource, MediaSession,
    MediaSessionConfig, MediaSessionEvent, MediaSessionFactory, MediaSessionState, RealtimeSession,
    Result, RetryPolicy, SessionEvent, SessionEvents, SessionUpdate, SetImageOptions,
};

// ---------------------------------------------------------------------------
// Scripted media factory

struct MockSession {
    events: mpsc::UnboundedSender<MediaSessionEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaSession for MockSession {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n".to_string())
    }

    async fn accept_offer(&self, _sdp: &str) -> Result<String> {
        let _ = self
            .events
            .send(MediaSessionEvent::StateChanged(MediaSessionState::Connected));
        Ok("v=0\r\n".to_string())
    }

    async fn accept_answer(&self, _sdp: &str) -> Result<()> {
        let _ = self
            .events
            .send(MediaSessionEvent::StateChanged(MediaSessionState::Connected));
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _candidate: morphstream::signaling::IceCandidatePayload,
    ) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    ice_configs: Mutex<Vec<Vec<IceServerEntry>>>,
}

impl MockFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSessionFactory for MockFactory {
    async fn create(
        &self,
        config: MediaSessionConfig,
        _local: Option<&LocalMediaSource>,
        events: mpsc::UnboundedSender<MediaSessionEvent>,
    ) -> Result<Arc<dyn MediaSession>> {
        let session = Arc::new(MockSession {
            events,
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().unwrap().push(session.clone());
        self.ice_configs.lock().unwrap().push(config.ice_servers);
        Ok(session as Arc<dyn MediaSession>)
    }
}

// ---------------------------------------------------------------------------
// In-process signaling server

type Ws = WebSocketStream<TcpStream>;
type Script =
    Arc<dyn Fn(Ws, u32) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static>;

async fn spawn_server(script: Script) -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let accepted_counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let n = accepted_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let script = script.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                script(ws, n).await;
            });
        }
    });
    (format!("ws://{}", addr), accepted)
}

async fn send_json(ws: &mut Ws, value: Value) {
    let _ = ws.send(Message::Text(value.to_string())).await;
}

async fn next_frame(ws: &mut Ws) -> Option<Value> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).ok();
        }
    }
    None
}

/// Drive ready/offer/answer until media is up, recording message types
async fn drive_handshake(ws: &mut Ws, seen: &Arc<Mutex<Vec<String>>>) {
    while let Some(frame) = next_frame(ws).await {
        let kind = frame["type"].as_str().unwrap_or("").to_string();
        seen.lock().unwrap().push(kind.clone());
        match kind.as_str() {
            "ready" => send_json(ws, json!({"type": "ready"})).await,
            "offer" => {
                send_json(ws, json!({"type": "answer", "sdp": "v=0"})).await;
                return;
            }
            "set-prompt" => {
                let prompt = frame["prompt"].as_str().unwrap_or("").to_string();
                send_json(
                    ws,
                    json!({"type": "prompt-ack", "prompt": prompt, "success": true}),
                )
                .await;
            }
            "set-image" => {
                send_json(ws, json!({"type": "image-ack", "success": true})).await;
            }
            _ => {}
        }
    }
}

/// Serve control traffic after the handshake; prompts containing "bad" are
/// rejected
async fn serve_control(ws: &mut Ws, seen: &Arc<Mutex<Vec<String>>>) {
    while let Some(frame) = next_frame(ws).await {
        let kind = frame["type"].as_str().unwrap_or("").to_string();
        seen.lock().unwrap().push(kind.clone());
        match kind.as_str() {
            "set-prompt" => {
                let prompt = frame["prompt"].as_str().unwrap_or("").to_string();
                if prompt.contains("bad") {
                    send_json(
                        ws,
                        json!({
                            "type": "prompt-ack",
                            "prompt": prompt,
                            "success": false,
                            "error": "invalid prompt"
                        }),
                    )
                    .await;
                } else {
                    send_json(
                        ws,
                        json!({"type": "prompt-ack", "prompt": prompt, "success": true}),
                    )
                    .await;
                }
            }
            "set-image" => {
                send_json(ws, json!({"type": "image-ack", "success": true})).await;
            }
            _ => {}
        }
    }
}

fn test_config(url: &str) -> ClientConfig {
    ClientConfig {
        base_url: url.to_string(),
        api_key: "sk-test".to_string(),
        model: "restyle-512".to_string(),
        connect_timeout: Duration::from_secs(5),
        prompt_timeout: Duration::from_secs(2),
        image_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 4,
            backoff_initial_ms: 10,
            backoff_max_ms: 50,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..Default::default()
    }
}

async fn wait_for_state(events: &mut SessionEvents, wanted: ConnectionState) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::State(state) = event {
                if state == wanted {
                    return;
                }
            }
        }
        panic!("event stream ended before reaching {}", wanted);
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {}", wanted));
}

// ---------------------------------------------------------------------------
// Scenario: clean connect

#[tokio::test]
async fn clean_connect_reaches_connected() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let factory = MockFactory::new();
    let session = RealtimeSession::with_factory(test_config(&url), factory.clone(), None).unwrap();

    let mut events = session.connect(None).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    // Buffered transitions replay in order.
    wait_for_state(&mut events, ConnectionState::Connecting).await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(factory.sessions().len(), 1);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(factory.sessions()[0].closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyConnected));

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: initial prompt delivered before media negotiation

#[tokio::test]
async fn initial_prompt_precedes_media_negotiation() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let mut config = test_config(&url);
    config.initial_prompt = Some(morphstream::InitialPrompt {
        text: "underwater garden".to_string(),
        enhance: false,
    });

    let session = RealtimeSession::with_factory(config, MockFactory::new(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    let order = seen.lock().unwrap().clone();
    let prompt_pos = order.iter().position(|k| k == "set-prompt").unwrap();
    let ready_pos = order.iter().position(|k| k == "ready").unwrap();
    assert!(
        prompt_pos < ready_pos,
        "prompt must be delivered before media negotiation, got {:?}",
        order
    );

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: unexpected drop and reconnect

#[tokio::test]
async fn drop_triggers_reconnect_with_stable_external_state() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            if n == 1 {
                // Give the client time to settle into connected, then
                // simulate infrastructure dropping the session.
                tokio::time::sleep(Duration::from_millis(250)).await;
                let _ = ws.send(Message::Close(None)).await;
                return;
            }
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let factory = MockFactory::new();
    let session = RealtimeSession::with_factory(test_config(&url), factory.clone(), None).unwrap();

    let mut events = session.connect(None).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    // The drop must surface as reconnecting, never as disconnected.
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), ConnectionState::Connected);

    // The first connection's media session was fully discarded.
    assert!(factory.sessions()[0].closed.load(Ordering::SeqCst));

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: transient failures consume the retry budget, then succeed

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            if n <= 3 {
                let _ = ws.send(Message::Close(None)).await;
                return;
            }
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    assert_eq!(session.state(), ConnectionState::Connected);

    session.disconnect().await;
}

#[tokio::test]
async fn exhausted_retry_budget_surfaces_the_error() {
    let script: Script = Arc::new(move |mut ws, _n| {
        Box::pin(async move {
            let _ = ws.send(Message::Close(None)).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let err = session.connect(None).await.unwrap_err();

    assert!(err.is_retryable(), "closure is transient: {}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Scenario: permanent failure aborts without retry

#[tokio::test]
async fn authorization_failure_never_retries() {
    let script: Script = Arc::new(move |mut ws, _n| {
        Box::pin(async move {
            send_json(
                &mut ws,
                json!({"type": "error", "message": "unauthorized: bad api key"}),
            )
            .await;
            // Keep the socket open; the client must abort on the error frame.
            let _ = next_frame(&mut ws).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let err = session.connect(None).await.unwrap_err();

    assert!(err.is_permanent(), "expected permanent error, got {}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Scenario: control protocol

#[tokio::test]
async fn rejected_prompt_carries_server_reason() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    let err = session.set_prompt("bad words", true).await.unwrap_err();
    assert!(err.to_string().contains("invalid prompt"));

    // The session survives the rejection and later requests succeed.
    assert_eq!(session.state(), ConnectionState::Connected);
    session.set_prompt("a kinder prompt", true).await.unwrap();
    session
        .set_image(Some("aGVsbG8=".to_string()), SetImageOptions::default())
        .await
        .unwrap();
    session
        .set(SessionUpdate {
            prompt: Some("combined".to_string()),
            image: None,
            enhance: Some(false),
        })
        .await
        .unwrap();

    session.disconnect().await;
}

#[tokio::test]
async fn control_requests_reject_when_not_connected() {
    let session = RealtimeSession::with_factory(
        test_config("ws://127.0.0.1:9"),
        MockFactory::new(),
        None,
    )
    .unwrap();

    let err = session.set_prompt("anything", false).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));

    let err = session
        .set_image(None, SetImageOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));
}

#[tokio::test]
async fn empty_partial_update_is_invalid() {
    let session = RealtimeSession::with_factory(
        test_config("ws://127.0.0.1:9"),
        MockFactory::new(),
        None,
    )
    .unwrap();

    let err = session.set(SessionUpdate::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

// ---------------------------------------------------------------------------
// Scenario: generation ticks and session id flow through the event stream

#[tokio::test]
async fn generation_ticks_and_session_id_reach_the_caller() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            send_json(&mut ws, json!({"type": "session-id", "session_id": "sess-42"})).await;
            send_json(&mut ws, json!({"type": "generation-started"})).await;
            send_json(&mut ws, json!({"type": "generation-ended"})).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let mut events = session.connect(None).await.unwrap();

    let mut saw_id = false;
    let mut saw_started = false;
    let mut saw_ended = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::SessionId(id) => {
                    assert_eq!(id, "sess-42");
                    saw_id = true;
                }
                SessionEvent::GenerationStarted => saw_started = true,
                SessionEvent::GenerationEnded => saw_ended = true,
                _ => {}
            }
            if saw_id && saw_started && saw_ended {
                return;
            }
        }
        panic!("event stream ended early");
    })
    .await
    .unwrap();

    assert_eq!(session.session_id().await.as_deref(), Some("sess-42"));
    // Generation ended returns the session to plain connected.
    assert_eq!(session.state(), ConnectionState::Connected);

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: disconnect is idempotent and strands in-flight work

#[tokio::test]
async fn disconnect_is_idempotent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let factory = MockFactory::new();
    let session = RealtimeSession::with_factory(test_config(&url), factory.clone(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // No reconnect cycle fires after an intentional disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(factory
        .sessions()
        .iter()
        .all(|s| s.closed.load(Ordering::SeqCst)));
}

// ---------------------------------------------------------------------------
// Scenario: explicit disconnect outranks an in-flight connect

#[tokio::test]
async fn disconnect_during_connect_supersedes_the_attempt() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            // Stall before negotiating so the disconnect lands mid-attempt.
            tokio::time::sleep(Duration::from_millis(400)).await;
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let factory = MockFactory::new();
    let session = Arc::new(
        RealtimeSession::with_factory(test_config(&url), factory.clone(), None).unwrap(),
    );

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.disconnect().await;

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(Error::Superseded)));

    // The stranded attempt never resurfaces as connected and its media
    // session is gone.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(factory
        .sessions()
        .iter()
        .all(|s| s.closed.load(Ordering::SeqCst)));
}

// ---------------------------------------------------------------------------
// Scenario: per-call image timeout override

#[tokio::test]
async fn image_ack_timeout_honors_per_call_override() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            // Swallow control traffic without acknowledging it.
            while next_frame(&mut ws).await.is_some() {}
        })
    });
    let (url, _) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    let started = std::time::Instant::now();
    let err = session
        .set_image(
            Some("aGVsbG8=".to_string()),
            SetImageOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {}", err);
    // Settles on the override, well before the configured default.
    assert!(started.elapsed() < Duration::from_secs(1));

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: post-handshake media failure reaches the error channel

#[tokio::test]
async fn media_failure_reaches_the_error_channel_and_reconnects() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, accepted) = spawn_server(script).await;

    let factory = MockFactory::new();
    let session = RealtimeSession::with_factory(test_config(&url), factory.clone(), None).unwrap();
    let mut events = session.connect(None).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    // A terminal media failure on the established session.
    let _ = factory.sessions()[0]
        .events
        .send(MediaSessionEvent::StateChanged(MediaSessionState::Failed));

    let mut saw_error = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Error(_) => saw_error = true,
                SessionEvent::State(ConnectionState::Reconnecting) => {
                    assert!(saw_error, "failure must surface on the error channel first");
                    return;
                }
                _ => {}
            }
        }
        panic!("event stream ended before reconnect");
    })
    .await
    .unwrap();

    wait_for_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: control requests reject while reconnecting

#[tokio::test]
async fn control_requests_reject_while_reconnecting() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            if n == 1 {
                drive_handshake(&mut ws, &seen).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = ws.send(Message::Close(None)).await;
                return;
            }
            // Hold the reconnect attempt open while control traffic is
            // issued against the session.
            tokio::time::sleep(Duration::from_millis(400)).await;
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let session =
        RealtimeSession::with_factory(test_config(&url), MockFactory::new(), None).unwrap();
    let mut events = session.connect(None).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;

    assert_eq!(session.state(), ConnectionState::Reconnecting);
    let err = session.set_prompt("mid-cycle", false).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));

    wait_for_state(&mut events, ConnectionState::Connected).await;
    // The rejected request never went on the wire.
    assert!(!seen.lock().unwrap().iter().any(|k| k == "set-prompt"));

    session.disconnect().await;
}

// ---------------------------------------------------------------------------
// Scenario: ICE restart rebuilds the media session with scoped credentials

#[tokio::test]
async fn ice_restart_rebuilds_with_attempt_scoped_credentials() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let script: Script = Arc::new(move |mut ws, _n| {
        let seen = seen_server.clone();
        Box::pin(async move {
            drive_handshake(&mut ws, &seen).await;
            send_json(
                &mut ws,
                json!({
                    "type": "ice-restart",
                    "url": "turn:relay.test:3478",
                    "username": "scoped-user",
                    "credential": "scoped-pass"
                }),
            )
            .await;
            // The client rebuilds and announces readiness again.
            drive_handshake(&mut ws, &seen).await;
            serve_control(&mut ws, &seen).await;
        })
    });
    let (url, _) = spawn_server(script).await;

    let factory = MockFactory::new();
    let session = RealtimeSession::with_factory(test_config(&url), factory.clone(), None).unwrap();
    let _events = session.connect(None).await.unwrap();

    // Wait for the rebuilt session to appear.
    tokio::time::timeout(Duration::from_secs(5), async {
        while factory.sessions().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let configs = factory.ice_configs.lock().unwrap().clone();
    assert_eq!(configs.len(), 2);
    // First build: no relay credentials.
    assert!(configs[0].iter().all(|e| e.username.is_empty()));
    // Rebuild: the pushed TURN triple is present, scoped to this build.
    assert!(configs[1]
        .iter()
        .any(|e| e.username == "scoped-user" && e.credential == "scoped-pass"));

    // The original session was closed by the rebuild.
    assert!(factory.sessions()[0].closed.load(Ordering::SeqCst));
    assert_eq!(session.state(), ConnectionState::Connected);

    session.disconnect().await;
}
