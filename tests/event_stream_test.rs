//! Event stream: persist-then-fanout, historical catch-up, live dedup.

use std::time::Duration;

use fieldhand::{EventLevel, EventStream, Store};
use tokio::time::timeout;

#[tokio::test]
async fn subscriber_catches_up_then_goes_live() {
    let store = Store::open_in_memory().await.expect("store");
    let stream = EventStream::new(store.clone());

    for i in 0..3 {
        stream
            .emit(
                "run-1",
                EventLevel::Info,
                &format!("historical {i}"),
                serde_json::json!({}),
            )
            .await
            .expect("emit historical");
    }

    let mut subscription = stream.subscribe_run("run-1").await.expect("subscribe");

    // Live events after subscription, including noise from another run
    stream
        .emit("run-2", EventLevel::Info, "noise", serde_json::json!({}))
        .await
        .expect("emit noise");
    stream
        .emit("run-1", EventLevel::Warn, "live 0", serde_json::json!({}))
        .await
        .expect("emit live");

    let mut seen = Vec::new();
    for _ in 0..4 {
        let event = timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("no timeout")
            .expect("event");
        seen.push((event.seq, event.message));
    }

    assert_eq!(
        seen,
        vec![
            (1, "historical 0".to_string()),
            (2, "historical 1".to_string()),
            (3, "historical 2".to_string()),
            (4, "live 0".to_string()),
        ]
    );
}

#[tokio::test]
async fn events_persist_before_fanout() {
    let store = Store::open_in_memory().await.expect("store");
    let stream = EventStream::new(store.clone());
    let mut all = stream.subscribe_all();

    let emitted = stream
        .emit(
            "run-1",
            EventLevel::Error,
            "something broke",
            serde_json::json!({"code": "network"}),
        )
        .await
        .expect("emit");

    // The broadcast copy matches the committed row
    let live = timeout(Duration::from_secs(1), all.recv())
        .await
        .expect("no timeout")
        .expect("event");
    assert_eq!(live.seq, emitted.seq);

    let persisted = store.events_for_run("run-1").await.expect("events");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].message, "something broke");
    assert_eq!(persisted[0].level, EventLevel::Error);
    assert_eq!(persisted[0].metadata, serde_json::json!({"code": "network"}));
}

#[tokio::test]
async fn emitting_with_no_subscribers_still_persists() {
    let store = Store::open_in_memory().await.expect("store");
    let stream = EventStream::new(store.clone());
    assert_eq!(stream.subscriber_count(), 0);

    stream
        .emit("run-1", EventLevel::Info, "quiet", serde_json::json!({}))
        .await
        .expect("emit without subscribers");

    assert_eq!(store.events_for_run("run-1").await.expect("events").len(), 1);
}
