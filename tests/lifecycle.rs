//! Flush barriers and close() semantics.

mod common;

use std::time::Duration;

use tokio::net::TcpStream;

use beeline::{Client, ClientError, ClientEvent, ConnectionState, SubscribeOptions};

async fn quiet_server(mut stream: TcpStream) {
    common::handshake(&mut stream).await;
    common::serve_pong(stream).await;
}

#[tokio::test]
async fn test_flush_round_trips_a_ping() {
    let (listener, url) = common::bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        quiet_server(stream).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");
    tokio::time::timeout(Duration::from_secs(2), client.flush())
        .await
        .expect("flush never resolved")
        .expect("flush failed");
    client.close().await.expect("close");
}

#[tokio::test]
async fn test_close_is_terminal_and_idempotent() {
    let (listener, url) = common::bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        quiet_server(stream).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");
    let mut events = client.events();

    // A pending deadline that close() must silence.
    let (callback, mut observed) = common::observer();
    let _sub = client
        .subscribe(
            "events.alpha",
            SubscribeOptions {
                timeout: Some(Duration::from_millis(300)),
                ..SubscribeOptions::default()
            },
            callback,
        )
        .await
        .expect("subscribe");

    client.close().await.expect("close");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.subscription_count(), 0);
    assert!(format!("{client:?}").contains("Closed"));

    // Every operation on a closed client reports it as such.
    assert!(matches!(
        client.publish("events.alpha", b"late".to_vec()).await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(client.flush().await, Err(ClientError::Closed)));
    let err = client
        .subscribe("events.beta", SubscribeOptions::default(), |_| {})
        .await
        .expect_err("subscribe after close");
    assert!(matches!(err, ClientError::Closed));

    // Idempotent.
    client.close().await.expect("second close");

    // The armed deadline must never fire.
    common::expect_silence(&mut observed, Duration::from_millis(800)).await;

    let mut closed = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if matches!(event, ClientEvent::Closed) {
            closed = true;
            break;
        }
    }
    assert!(closed, "expected a closed event");
}

#[tokio::test]
async fn test_server_error_frames_surface_on_the_event_channel() {
    let (listener, url) = common::bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = common::handshake(&mut stream).await;
        // Report an error for the flush's PING, then acknowledge it, so
        // the error frame is ordered before the flush resolution.
        common::read_until(&mut stream, &mut buf, b"PING\r\n").await;
        tokio::io::AsyncWriteExt::write_all(
            &mut stream,
            b"-ERR 'Unknown Protocol Operation'\r\nPONG\r\n",
        )
        .await
        .expect("write -ERR");
        common::serve_pong(stream).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");
    let mut events = client.events();
    tokio::time::timeout(Duration::from_secs(2), client.flush())
        .await
        .expect("flush never resolved")
        .expect("flush failed");

    let mut reported = None;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if let ClientEvent::ServerError { reason } = event {
            reported = Some(reason);
            break;
        }
    }
    assert_eq!(reported.as_deref(), Some("Unknown Protocol Operation"));
    client.close().await.expect("close");
}

#[tokio::test]
async fn test_publish_over_the_advertised_payload_limit_is_rejected() {
    let (listener, url) = common::bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        quiet_server(stream).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");

    // The mock advertises a 1 MiB limit.
    let oversized = vec![0u8; 2 * 1024 * 1024];
    let err = client
        .publish("events.alpha", oversized)
        .await
        .expect_err("oversized publish");
    assert!(matches!(err, ClientError::Protocol(_)), "got {err:?}");

    // In-bounds publishes are unaffected.
    client
        .publish("events.alpha", b"fits".to_vec())
        .await
        .expect("publish");
    client.close().await.expect("close");
}
