#![cfg(feature = "test-db")]

mod common;

use std::time::{Duration, Instant};

use common::*;
use futures::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use trunk::notify::NotificationClient;

async fn client(options: &PgConnectOptions) -> NotificationClient {
    NotificationClient::connect(options.clone(), fast_settings(), trunk::audit::default_sink())
        .await
        .expect("notification client should connect")
}

#[sqlx::test]
async fn test_notify_reaches_listener(_pool: PgPoolOptions, options: PgConnectOptions) {
    let channel = unique_name("alerts");
    let mut listener = client(&options).await;
    let mut sender = client(&options).await;

    listener.listen(&channel).await;
    sender.notify(&channel, Some("disk full")).await;

    let notification = listener
        .wait(Some(&channel), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(notification.channel, channel);
    assert_eq!(notification.payload, "disk full");
}

#[sqlx::test]
async fn test_wait_times_out_without_traffic(_pool: PgPoolOptions, options: PgConnectOptions) {
    let channel = unique_name("silent");
    let mut listener = client(&options).await;
    listener.listen(&channel).await;

    let started = Instant::now();
    let err = listener
        .wait(Some(&channel), Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(err.is_empty(), "unexpected error: {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[sqlx::test]
async fn test_zero_timeout_polls_once(_pool: PgPoolOptions, options: PgConnectOptions) {
    let channel = unique_name("poll");
    let mut listener = client(&options).await;
    listener.listen(&channel).await;

    let started = Instant::now();
    let err = listener.get(Some(&channel), false, None).await.unwrap_err();
    assert!(err.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[sqlx::test]
async fn test_filtered_wait_keeps_other_channels(_pool: PgPoolOptions, options: PgConnectOptions) {
    let wanted = unique_name("wanted");
    let other = unique_name("other");
    let mut listener = client(&options).await;
    let mut sender = client(&options).await;

    listener.listen(&wanted).await;
    listener.listen(&other).await;
    sender.notify(&other, Some("first")).await;
    sender.notify(&wanted, Some("second")).await;

    let received = listener
        .wait(Some(&wanted), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(received.payload, "second");
    assert_eq!(listener.pending(), 1);

    let buffered = listener
        .wait(Some(&other), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(buffered.payload, "first");
    assert_eq!(listener.pending(), 0);
}

#[sqlx::test]
async fn test_stream_yields_in_order(_pool: PgPoolOptions, options: PgConnectOptions) {
    let channel = unique_name("feed");
    let mut listener = client(&options).await;
    let mut sender = client(&options).await;

    listener.listen(&channel).await;
    for i in 0..3 {
        sender.notify(&channel, Some(&i.to_string())).await;
    }

    let payloads: Vec<String> = tokio::time::timeout(
        Duration::from_secs(5),
        listener
            .stream(Some(&channel))
            .take(3)
            .map(|n| n.unwrap().payload)
            .collect(),
    )
    .await
    .expect("three notifications within the deadline");
    assert_eq!(payloads, vec!["0", "1", "2"]);
}

#[sqlx::test]
async fn test_channels_track_listen_and_unlisten(_pool: PgPoolOptions, options: PgConnectOptions) {
    let first = unique_name("first");
    let second = unique_name("second");
    let mut listener = client(&options).await;

    assert!(listener.channels().await.unwrap().is_empty());

    listener.listen(&first).await;
    listener.listen(&second).await;
    let mut channels = listener.channels().await.unwrap();
    channels.sort();
    let mut expected = vec![first.clone(), second.clone()];
    expected.sort();
    assert_eq!(channels, expected);

    listener.unlisten(&first).await;
    assert_eq!(listener.channels().await.unwrap(), vec![second]);
}

#[sqlx::test]
async fn test_notify_failures_are_swallowed(_pool: PgPoolOptions, options: PgConnectOptions) {
    let sink = RecordingSink::shared();
    let mut sender =
        NotificationClient::connect(options.clone(), fast_settings(), sink.clone())
            .await
            .unwrap();

    // payloads over 8000 bytes are rejected by the server
    let oversized = "x".repeat(9000);
    sender.notify("anything", Some(&oversized)).await;

    assert!(
        sink.lines().iter().any(|l| l.starts_with("swallowed notify")),
        "{:?}",
        sink.lines()
    );
}
