//! End-to-end session scenarios over real sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tether_core::{Config, Session, SessionHandler};
use tether_net::SessionController;
use tether_proto::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use zerocopy::IntoBytes;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Opened { session_id: u32, identifier: u64 },
    Closed { session_id: u32 },
    Stream { payload: Vec<u8> },
    Standalone { outgoing_id: u64, payload: Vec<u8> },
    Error { kind: ErrorKind, message: String },
}

/// Captures callbacks; optionally answers every standalone message so
/// request/response tests have a live responder.
struct TestHandler {
    events: Mutex<Vec<Event>>,
    notify: Notify,
    auto_respond: bool,
}

impl TestHandler {
    fn new(auto_respond: bool) -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()), notify: Notify::new(), auto_respond })
    }

    fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, event: Event) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        self.notify.notify_waiters();
    }

    async fn wait_for<F>(&self, what: &str, predicate: F)
    where
        F: Fn(&[Event]) -> bool,
    {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                if predicate(&self.events()) {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {what}");
    }
}

#[async_trait]
impl SessionHandler for TestHandler {
    async fn session_opened(&self, session: &Arc<Session>, identifier: u64) {
        self.push(Event::Opened { session_id: session.session_id(), identifier });
    }

    async fn session_closed(&self, session: &Arc<Session>, _identifier: u64) {
        self.push(Event::Closed { session_id: session.session_id() });
    }

    async fn stream_data(&self, _session: &Arc<Session>, payload: &[u8]) {
        self.push(Event::Stream { payload: payload.to_vec() });
    }

    async fn standalone_data(&self, session: &Arc<Session>, outgoing_id: u64, payload: Bytes) {
        self.push(Event::Standalone { outgoing_id, payload: payload.to_vec() });

        if self.auto_respond {
            let mut answer = b"re: ".to_vec();
            answer.extend_from_slice(&payload);
            if let Err(error) = session.send_response(answer.into(), outgoing_id).await {
                panic!("auto-respond failed: {error}");
            }
        }
    }

    async fn error(&self, _session: &Arc<Session>, kind: ErrorKind, message: &str) {
        self.push(Event::Error { kind, message: message.to_string() });
    }
}

/// Route engine logs to the test output; `RUST_LOG=debug` shows the frame
/// flow when a scenario misbehaves.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn identifier(tag: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..tag.len()].copy_from_slice(tag);
    u64::from_le_bytes(bytes)
}

fn quiet_config() -> Config {
    Config { reply_timeout: Duration::from_secs(2), heartbeat_interval: Duration::from_secs(3600) }
}

#[tokio::test]
async fn tcp_handshake_and_stream_round_trip() {
    init_tracing();
    let server_handler = TestHandler::new(false);
    let server = SessionController::new(quiet_config(), server_handler.clone());
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client_handler = TestHandler::new(false);
    let client = SessionController::new(quiet_config(), client_handler.clone());

    let ident = identifier(b"test");
    let session = client.start_tcp_session(&addr.to_string(), ident).await.unwrap();

    // both id halves are assigned and nonzero
    let session_id = session.session_id();
    assert_ne!(session_id & 0xFFFF, 0);
    assert_ne!(session_id >> 16, 0);
    assert!(session.is_active());
    assert!(session.is_client_side());

    server_handler
        .wait_for("server opened callback", |events| {
            events.contains(&Event::Opened { session_id, identifier: ident })
        })
        .await;
    client_handler
        .wait_for("client opened callback", |events| {
            events.contains(&Event::Opened { session_id, identifier: 0 })
        })
        .await;

    let payload = b"hello!!! (static)";
    session.send_stream(payload, true).await.unwrap();

    server_handler
        .wait_for("stream delivery", |events| {
            events.contains(&Event::Stream { payload: payload.to_vec() })
        })
        .await;

    // the stream reply clears the tracked entry
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while !client.protocol().reply().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(deadline.is_ok(), "reply entry was never cleared");
}

#[tokio::test]
async fn tcp_standalone_single_and_multi_block() {
    init_tracing();
    let server_handler = TestHandler::new(false);
    let server = SessionController::new(quiet_config(), server_handler.clone());
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client = SessionController::new(quiet_config(), TestHandler::new(false));
    let session = client.start_tcp_session(&addr.to_string(), 0).await.unwrap();

    let small: Vec<u8> = (0..577u32).map(|i| (i * 3) as u8).collect();
    let small_id = session.send_standalone(Bytes::from(small.clone())).await.unwrap();

    let large: Vec<u8> = (0..2313u32).map(|i| (i * 7) as u8).collect();
    let large_id = session.send_standalone(Bytes::from(large.clone())).await.unwrap();

    server_handler
        .wait_for("single-block delivery", |events| {
            events.contains(&Event::Standalone { outgoing_id: small_id, payload: small.clone() })
        })
        .await;
    server_handler
        .wait_for("multi-block delivery", |events| {
            events.contains(&Event::Standalone { outgoing_id: large_id, payload: large.clone() })
        })
        .await;

    // each delivery fired exactly once
    let standalone_count = server_handler
        .events()
        .iter()
        .filter(|event| matches!(event, Event::Standalone { .. }))
        .count();
    assert_eq!(standalone_count, 2);
}

#[tokio::test]
async fn tcp_request_response() {
    init_tracing();
    let server = SessionController::new(quiet_config(), TestHandler::new(true));
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client = SessionController::new(quiet_config(), TestHandler::new(false));
    let session = client.start_tcp_session(&addr.to_string(), 0).await.unwrap();

    let response = session
        .send_request(Bytes::from_static(b"ping"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some(&b"re: ping"[..]));

    // concurrent requests with distinct correlation ids must not cross-talk
    let first_session = session.clone();
    let first = tokio::spawn(async move {
        first_session.send_request(Bytes::from_static(b"alpha"), Duration::from_secs(10)).await
    });
    let second_session = session.clone();
    let second = tokio::spawn(async move {
        second_session.send_request(Bytes::from_static(b"beta"), Duration::from_secs(10)).await
    });

    assert_eq!(first.await.unwrap().unwrap().as_deref(), Some(&b"re: alpha"[..]));
    assert_eq!(second.await.unwrap().unwrap().as_deref(), Some(&b"re: beta"[..]));
}

#[tokio::test]
async fn tcp_large_request_and_response() {
    init_tracing();
    let server = SessionController::new(quiet_config(), TestHandler::new(true));
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client = SessionController::new(quiet_config(), TestHandler::new(false));
    let session = client.start_tcp_session(&addr.to_string(), 0).await.unwrap();

    // request and response both exceed the single-frame budget
    let question: Vec<u8> = (0..4096u32).map(|i| (i % 253) as u8).collect();
    let response = session
        .send_request(Bytes::from(question.clone()), Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    let mut expected = b"re: ".to_vec();
    expected.extend_from_slice(&question);
    assert_eq!(&response[..], &expected[..]);
}

#[tokio::test]
async fn tcp_close_handshake() {
    init_tracing();
    let server_handler = TestHandler::new(false);
    let server = SessionController::new(quiet_config(), server_handler.clone());
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client_handler = TestHandler::new(false);
    let client = SessionController::new(quiet_config(), client_handler.clone());
    let session = client.start_tcp_session(&addr.to_string(), 0).await.unwrap();
    let session_id = session.session_id();

    session.close(true).await.unwrap();

    client_handler
        .wait_for("client closed callback", |events| {
            events.iter().any(|event| matches!(event, Event::Closed { .. }))
        })
        .await;
    server_handler
        .wait_for("server closed callback", |events| {
            events.iter().any(|event| matches!(event, Event::Closed { .. }))
        })
        .await;

    // one closed callback per side, session deregistered, second close fails
    let closed = |events: Vec<Event>| {
        events.iter().filter(|event| matches!(event, Event::Closed { .. })).count()
    };
    assert_eq!(closed(client_handler.events()), 1);
    assert_eq!(closed(server_handler.events()), 1);
    assert!(client.get_session(session_id).is_none());
    assert!(session.close(true).await.is_err());
    assert_eq!(closed(client_handler.events()), 1);
}

#[tokio::test]
async fn abrupt_disconnect_fires_closed_callback() {
    init_tracing();
    let server_handler = TestHandler::new(false);
    let server = SessionController::new(quiet_config(), server_handler.clone());
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client = SessionController::new(quiet_config(), TestHandler::new(false));
    let session = client.start_tcp_session(&addr.to_string(), 0).await.unwrap();

    // drop the connection without a close handshake
    session.handle_disconnect().await;

    server_handler
        .wait_for("server closed callback", |events| {
            events.iter().any(|event| matches!(event, Event::Closed { .. }))
        })
        .await;
}

/// A hand-rolled peer that completes the handshake with the well-known id
/// composition and then goes silent, to exercise the reply timeout over a
/// real socket.
#[tokio::test]
async fn reply_timeout_against_silent_peer() {
    init_tracing();
    use tether_proto::messages::{SessionInitReply, SessionInitStart};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ident = identifier(b"test");
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; SessionInitStart::SIZE];
        stream.read_exact(&mut buf).await.unwrap();
        let init = SessionInitStart::parse(&buf).unwrap();
        assert_eq!(init.client_session_id(), 1);
        assert_eq!(init.session_identifier(), identifier(b"test"));

        // complete id: client nonce 1, server half 2
        let reply =
            SessionInitReply::new(init.header.message_id(), init.client_session_id(), 0x0002_0001);
        stream.write_all(reply.as_bytes()).await.unwrap();

        // stay connected, answer nothing
        let mut sink = [0u8; 4096];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let client_handler = TestHandler::new(false);
    let client = SessionController::new(quiet_config(), client_handler.clone());
    let session = client.start_tcp_session(&addr.to_string(), ident).await.unwrap();

    assert_eq!(session.session_id(), 131_073);

    session.send_stream(b"anyone there?", true).await.unwrap();

    client_handler
        .wait_for("timeout error", |events| {
            events.iter().any(|event| {
                matches!(
                    event,
                    Event::Error { kind: ErrorKind::MessageTimeout, message }
                        if message.contains("timeout of message")
                )
            })
        })
        .await;

    drop(session);
    server.abort();
}

#[tokio::test]
async fn unix_socket_round_trip() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("tether-test-{}.sock", std::process::id()));

    let server = SessionController::new(quiet_config(), TestHandler::new(true));
    server.add_unix_server(&path).await.unwrap();

    let client = SessionController::new(quiet_config(), TestHandler::new(false));
    let session = client.start_unix_session(&path, identifier(b"uds")).await.unwrap();
    assert!(session.is_active());

    let response = session
        .send_request(Bytes::from_static(b"over unix"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some(&b"re: over unix"[..]));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn tls_round_trip_with_self_signed_cert() {
    init_tracing();
    let server_handler = TestHandler::new(false);
    let server = SessionController::new(quiet_config(), server_handler.clone());
    let (_, addr) = server.add_tls_tcp_server("127.0.0.1:0", None, None).await.unwrap();

    let client = SessionController::new(quiet_config(), TestHandler::new(false));
    let session = client.start_tls_tcp_session(&addr.to_string(), identifier(b"tls")).await.unwrap();
    assert!(session.is_active());

    let payload: Vec<u8> = (0..1500u32).map(|i| (i % 127) as u8).collect();
    let outgoing_id = session.send_standalone(Bytes::from(payload.clone())).await.unwrap();

    server_handler
        .wait_for("standalone delivery over TLS", |events| {
            events.contains(&Event::Standalone { outgoing_id, payload: payload.clone() })
        })
        .await;
}

#[tokio::test]
async fn heartbeats_keep_flowing_without_errors() {
    init_tracing();
    let fast_heartbeat = Config {
        reply_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(200),
    };

    let server_handler = TestHandler::new(false);
    let server = SessionController::new(fast_heartbeat.clone(), server_handler.clone());
    let (_, addr) = server.add_tcp_server("127.0.0.1:0").await.unwrap();

    let client_handler = TestHandler::new(false);
    let client = SessionController::new(fast_heartbeat, client_handler.clone());
    let session = client.start_tcp_session(&addr.to_string(), 0).await.unwrap();

    // several heartbeat rounds in both directions
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(session.is_active());
    let errors = |events: Vec<Event>| {
        events.iter().filter(|event| matches!(event, Event::Error { .. })).count()
    };
    assert_eq!(errors(client_handler.events()), 0);
    assert_eq!(errors(server_handler.events()), 0);
}
