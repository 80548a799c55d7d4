//! Shared mock-server plumbing for the integration tests.
//!
//! Each test binds a real listener on a loopback port and scripts the
//! server side of the wire protocol by hand, asserting on what the client
//! does in response.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

use beeline::{ClientError, Config, Message};

pub const INFO_LINE: &[u8] =
    b"INFO {\"server_id\":\"mock\",\"version\":\"0.1.0\",\"max_payload\":1048576}\r\n";

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("nats://{addr}"))
}

/// Completes the server side of the handshake: INFO out, wait for the
/// client's CONNECT + PING, answer PONG. Returns any bytes received after
/// the handshake PING.
pub async fn handshake(stream: &mut TcpStream) -> Vec<u8> {
    stream.write_all(INFO_LINE).await.expect("write INFO");
    let mut buf = Vec::new();
    let pos = loop {
        if let Some(pos) = find(&buf, b"PING\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.expect("read during handshake");
        assert!(n > 0, "client closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
    };
    stream.write_all(b"PONG\r\n").await.expect("write PONG");
    buf.drain(..pos + b"PING\r\n".len());
    buf
}

/// Reads from the stream until `buf` contains `needle`.
pub async fn read_until(stream: &mut TcpStream, buf: &mut Vec<u8>, needle: &[u8]) {
    while find(buf, needle).is_none() {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(
            n > 0,
            "peer closed while waiting for {:?}",
            String::from_utf8_lossy(needle)
        );
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// First complete line in `buf` starting with `prefix`.
pub fn line_with_prefix(buf: &[u8], prefix: &str) -> Option<String> {
    let text = String::from_utf8_lossy(buf);
    text.lines()
        .find(|l| l.starts_with(prefix))
        .map(|l| l.to_string())
}

/// Serves PING -> PONG forever, discarding everything else.
pub async fn serve_pong(mut stream: TcpStream) {
    let mut buf = Vec::new();
    loop {
        let mut chunk = [0u8; 1024];
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Some(pos) = find(&buf, b"PING\r\n") {
            buf.drain(..pos + b"PING\r\n".len());
            if stream.write_all(b"PONG\r\n").await.is_err() {
                return;
            }
        }
    }
}

/// What a subscription/request callback reported.
#[derive(Debug, PartialEq)]
pub enum Observed {
    Message(Vec<u8>),
    SubscriptionTimeout,
    RequestTimeout,
    Other(String),
}

/// Builds a callback that funnels observations into a channel the test
/// can assert on.
pub fn observer() -> (
    impl FnMut(Result<Message, ClientError>) + Send + 'static,
    UnboundedReceiver<Observed>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let callback = move |result: Result<Message, ClientError>| {
        let observed = match result {
            Ok(msg) => Observed::Message(msg.payload.to_vec()),
            Err(ClientError::SubscriptionTimeout) => Observed::SubscriptionTimeout,
            Err(ClientError::RequestTimeout) => Observed::RequestTimeout,
            Err(e) => Observed::Other(e.to_string()),
        };
        let _ = tx.send(observed);
    };
    (callback, rx)
}

pub async fn expect_next(rx: &mut UnboundedReceiver<Observed>, within: Duration) -> Observed {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("observer channel closed")
}

/// Asserts no callback fires within the window. A closed channel counts
/// as silence: the callback was dropped with its registry entry.
pub async fn expect_silence(rx: &mut UnboundedReceiver<Observed>, window: Duration) {
    if let Ok(Some(observed)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected callback: {observed:?}");
    }
}

static TRACING: Once = Once::new();

/// Wires client tracing into the test harness, honoring `RUST_LOG`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Test config: short deadlines so failures surface quickly.
pub fn config_for(urls: Vec<String>) -> Config {
    init_tracing();
    Config {
        servers: urls,
        connect_timeout_ms: 1_000,
        reconnect_delay_ms: 50,
        ..Config::default()
    }
}
