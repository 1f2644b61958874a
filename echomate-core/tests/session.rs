//! Session manager tests against a fake in-process backend: identity
//! announcement, command dispatch with clamping, the first-connection
//! chime gate and its quiet-period reset.

use async_trait::async_trait;
use echomate_core::config::SessionSection;
use echomate_core::events::{self, EventBus};
use echomate_core::session::SessionManager;
use echomate_core::state::StateHandle;
use echomate_core::traits::{DeviceCollaborator, CLIP_SESSION_READY};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;

struct FakeCollaborator {
    chimes: AtomicU32,
    recorded: Mutex<Vec<u32>>,
    played: Mutex<Vec<u32>>,
}

impl FakeCollaborator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chimes: AtomicU32::new(0),
            recorded: Mutex::new(Vec::new()),
            played: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeviceCollaborator for FakeCollaborator {
    async fn play_clip(&self, id: u32) -> echomate_core::Result<()> {
        if id == CLIP_SESSION_READY {
            self.chimes.fetch_add(1, Ordering::SeqCst);
        }
        self.played.lock().unwrap().push(id);
        Ok(())
    }

    async fn record(&self, duration_secs: u32) -> echomate_core::Result<usize> {
        self.recorded.lock().unwrap().push(duration_secs);
        Ok(32_000)
    }

    async fn restart_device(&self) {}

    async fn factory_reset(&self) {}
}

fn session_cfg(addr: &str) -> SessionSection {
    SessionSection {
        server_addr: addr.to_string(),
        reconnect_interval_ms: 50,
        network_timeout_ms: 5_000,
        quiet_period_ms: 300,
        supervisor_poll_ms: 50,
    }
}

struct Backend {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Backend {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("session never connected")
            .unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn next_json(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("no message from session")
            .unwrap()
            .expect("session closed the connection");
        serde_json::from_str(&line).expect("session sent invalid JSON")
    }

    async fn send(&mut self, value: Value) {
        let mut framed = value.to_string();
        framed.push('\n');
        self.writer.write_all(framed.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer
            .write_all(format!("{raw}\n").as_bytes())
            .await
            .unwrap();
    }
}

fn manager(
    addr: &str,
    collaborator: Arc<FakeCollaborator>,
    events: EventBus,
) -> Arc<SessionManager> {
    SessionManager::new(
        session_cfg(addr),
        "echomate-test".to_string(),
        "echomate-s3".to_string(),
        collaborator,
        events,
        StateHandle::new(),
    )
}

#[tokio::test]
async fn announces_identity_and_chimes_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let collaborator = FakeCollaborator::new();
    let events = EventBus::new();

    let session = manager(&addr, collaborator.clone(), events.clone());
    session.start().await;

    let mut backend = Backend::accept(&listener).await;
    let hello = backend.next_json().await;
    assert_eq!(hello["event"], "device_connected");
    assert_eq!(hello["data"]["clientId"], "echomate-test");
    assert_eq!(hello["data"]["type"], "echomate-s3");

    let up = events
        .wait_any(events::SESSION_UP, Some(Duration::from_secs(2)))
        .await;
    assert_ne!(up, 0);
    assert_eq!(collaborator.chimes.load(Ordering::SeqCst), 1);

    session.stop().await;
}

#[tokio::test]
async fn recording_command_is_clamped_before_the_collaborator_sees_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let collaborator = FakeCollaborator::new();

    let session = manager(&addr, collaborator.clone(), EventBus::new());
    session.start().await;

    let mut backend = Backend::accept(&listener).await;
    assert_eq!(backend.next_json().await["event"], "device_connected");

    backend
        .send(serde_json::json!({
            "event": "start_recording",
            "data": { "duration": 120 },
        }))
        .await;

    let started = backend.next_json().await;
    assert_eq!(started["event"], "recording_started");
    assert_eq!(started["data"]["duration"], 60);

    let complete = backend.next_json().await;
    assert_eq!(complete["event"], "record_complete");
    assert_eq!(complete["data"]["duration"], 60);
    assert_eq!(complete["data"]["size"], 32_000);

    assert_eq!(*collaborator.recorded.lock().unwrap(), vec![60]);

    session.stop().await;
}

#[tokio::test]
async fn malformed_and_unknown_messages_are_dropped_without_killing_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let collaborator = FakeCollaborator::new();

    let session = manager(&addr, collaborator.clone(), EventBus::new());
    session.start().await;

    let mut backend = Backend::accept(&listener).await;
    assert_eq!(backend.next_json().await["event"], "device_connected");

    backend.send_raw("this is not json {{").await;
    backend.send(serde_json::json!({ "no_event": true })).await;
    backend
        .send(serde_json::json!({ "event": "firmware_dance" }))
        .await;

    // still alive: a real command round-trips
    backend
        .send(serde_json::json!({ "event": "play_pcm", "data": { "id": 2 } }))
        .await;
    let result = backend.next_json().await;
    assert_eq!(result["event"], "play_pcm_result");
    assert_eq!(result["data"]["id"], 2);
    assert_eq!(result["data"]["status"], "ok");
    assert_eq!(*collaborator.played.lock().unwrap(), vec![2]);

    session.stop().await;
}

#[tokio::test]
async fn quiet_period_gates_the_onboarding_chime() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let collaborator = FakeCollaborator::new();

    let session = manager(&addr.to_string(), collaborator.clone(), EventBus::new());
    session.start().await;

    // first connection: the hello means the chime decision was made
    let mut backend = Backend::accept(&listener).await;
    assert_eq!(backend.next_json().await["event"], "device_connected");
    assert_eq!(collaborator.chimes.load(Ordering::SeqCst), 1);

    // drop the link; the reconnect arrives well inside the quiet period
    drop(backend);
    let mut backend = Backend::accept(&listener).await;
    assert_eq!(backend.next_json().await["event"], "device_connected");
    assert_eq!(
        collaborator.chimes.load(Ordering::SeqCst),
        1,
        "reconnect inside the quiet period must not chime again"
    );

    // now stay down past the quiet period
    drop(backend);
    drop(listener);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let listener = TcpListener::bind(addr).await.unwrap();
    let mut backend = Backend::accept(&listener).await;
    assert_eq!(backend.next_json().await["event"], "device_connected");
    assert_eq!(
        collaborator.chimes.load(Ordering::SeqCst),
        2,
        "a long outage re-arms the announcement"
    );

    session.stop().await;
}
