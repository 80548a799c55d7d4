//! Reconnection: subscription replay, offline buffering, and flush
//! barriers that span a stream loss.

mod common;

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use beeline::{Client, ClientEvent, ConnectionState, SubscribeOptions};

/// Waits until the client has noticed the stream loss. The watch channel
/// retains the current state, so this cannot miss a transition that
/// happened before the caller started looking.
async fn await_stream_loss(client: &Client) {
    let mut state = client.state_receiver();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| {
            matches!(
                s,
                ConnectionState::Reconnecting(_) | ConnectionState::Disconnected(_)
            )
        }),
    )
    .await
    .expect("timed out waiting for the stream loss")
    .expect("state channel closed");
}

#[tokio::test]
async fn test_subscription_survives_reconnect() {
    let (listener, url) = common::bind().await;
    tokio::spawn(async move {
        // First session: wait for the SUB, then fail the stream.
        let (mut first, _) = listener.accept().await.expect("accept");
        common::handshake(&mut first).await;
        let mut buf = Vec::new();
        common::read_until(&mut first, &mut buf, b"SUB events.alpha 1\r\n").await;
        drop(first);

        // Second session: the client must replay the SUB unprompted.
        let (mut second, _) = listener.accept().await.expect("accept");
        let mut buf = common::handshake(&mut second).await;
        common::read_until(&mut second, &mut buf, b"SUB events.alpha 1\r\n").await;
        second
            .write_all(b"MSG events.alpha 1 5\r\nhello\r\n")
            .await
            .expect("write MSG");
        common::serve_pong(second).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");
    let mut events = client.events();
    let (callback, mut observed) = common::observer();
    let _sub = client
        .subscribe("events.alpha", SubscribeOptions::default(), callback)
        .await
        .expect("subscribe");

    assert_eq!(
        common::expect_next(&mut observed, Duration::from_secs(5)).await,
        common::Observed::Message(b"hello".to_vec())
    );

    // The loss and recovery were surfaced on the event channel.
    let mut reconnected = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if matches!(event, ClientEvent::Reconnected { .. }) {
            reconnected = true;
            break;
        }
    }
    assert!(reconnected, "expected a reconnected event");
    client.close().await.expect("close");
}

#[tokio::test]
async fn test_publishes_while_offline_are_replayed() {
    let (listener, url) = common::bind().await;
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.expect("accept");
        common::handshake(&mut first).await;
        drop(first);

        let (mut second, _) = listener.accept().await.expect("accept");
        let mut buf = common::handshake(&mut second).await;
        common::read_until(&mut second, &mut buf, b"PUB jobs.queue 4\r\nwork\r\n").await;
        let _ = seen_tx.send(());
        common::serve_pong(second).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");

    // Publish only once the stream loss has been noticed.
    await_stream_loss(&client).await;
    client
        .publish("jobs.queue", b"work".to_vec())
        .await
        .expect("publish while offline");

    tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("buffered publish never reached the next connection")
        .expect("server task dropped");
    client.close().await.expect("close");
}

#[tokio::test]
async fn test_flush_issued_while_offline_resolves_after_reconnect() {
    let (listener, url) = common::bind().await;
    tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.expect("accept");
        common::handshake(&mut first).await;
        drop(first);

        let (mut second, _) = listener.accept().await.expect("accept");
        common::handshake(&mut second).await;
        common::serve_pong(second).await;
    });

    let client = Client::connect(common::config_for(vec![url]))
        .await
        .expect("connect");
    await_stream_loss(&client).await;

    // The barrier is queued offline and its PING re-armed on reconnect.
    tokio::time::timeout(Duration::from_secs(5), client.flush())
        .await
        .expect("flush never resolved")
        .expect("flush failed");
    client.close().await.expect("close");
}
