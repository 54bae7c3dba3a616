//! Store-level contracts: the run lease CAS, transactional records, and
//! the monotonic per-run event log.

use fieldhand::extract::schema::{FieldMap, FieldMapping, SelectorSpec};
use fieldhand::{EngineMode, EventLevel, Job, RunStatus, Store};

fn sample_job(id: &str) -> Job {
    Job {
        id: id.to_string(),
        name: "sample".to_string(),
        target_url: "https://example.com".to_string(),
        fields: vec!["title".to_string()],
        requires_auth: false,
        crawl_mode: fieldhand::CrawlMode::Single,
        list_config: None,
        engine_mode: EngineMode::Auto,
        browser_profile: None,
    }
}

#[tokio::test]
async fn run_lease_is_compare_and_set() {
    let store = Store::open_in_memory().await.expect("store");
    store.insert_job(&sample_job("j1")).await.expect("job");

    let run = store
        .create_run("j1", EngineMode::Auto, 1, 3, 0)
        .await
        .expect("run");
    assert_eq!(run.status, RunStatus::Queued);

    assert!(store.claim_run(&run.id).await.expect("first claim"));
    // A duplicate enqueue loses the race cleanly
    assert!(!store.claim_run(&run.id).await.expect("second claim"));

    let claimed = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(claimed.status, RunStatus::Running);
    assert!(claimed.started_at.is_some());
}

#[tokio::test]
async fn requeue_only_moves_waiting_runs() {
    let store = Store::open_in_memory().await.expect("store");
    store.insert_job(&sample_job("j1")).await.expect("job");
    let run = store
        .create_run("j1", EngineMode::Auto, 1, 3, 0)
        .await
        .expect("run");

    // queued → queued via requeue is illegal
    assert!(!store.requeue_run(&run.id, 0).await.expect("requeue queued"));

    store.claim_run(&run.id).await.expect("claim");
    assert!(store.pause_run_row(&run.id).await.expect("pause"));
    assert!(store.requeue_run(&run.id, 0).await.expect("requeue waiting"));

    let back = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(back.status, RunStatus::Queued);
}

#[tokio::test]
async fn records_commit_in_one_transaction() {
    let store = Store::open_in_memory().await.expect("store");
    store.insert_job(&sample_job("j1")).await.expect("job");
    let run = store
        .create_run("j1", EngineMode::Auto, 1, 3, 0)
        .await
        .expect("run");

    let mut record = serde_json::Map::new();
    record.insert("title".to_string(), serde_json::json!("Example Domain"));
    let records = vec![record.clone(), record];

    let persisted = store
        .insert_records(&run.id, &records)
        .await
        .expect("insert records");
    assert_eq!(persisted, 2);
    assert_eq!(store.count_records(&run.id).await.expect("count"), 2);

    let fetched = store.fetch_records(&run.id).await.expect("fetch records");
    assert_eq!(fetched.len(), 2);
    assert_eq!(
        fetched[0].get("title"),
        Some(&serde_json::json!("Example Domain"))
    );
}

#[tokio::test]
async fn event_sequence_is_strictly_monotonic() {
    let store = Store::open_in_memory().await.expect("store");

    for i in 0..5 {
        store
            .append_event(
                "run-1",
                EventLevel::Info,
                &format!("event {i}"),
                &serde_json::json!({}),
            )
            .await
            .expect("append");
    }
    // Another run's log is independent
    store
        .append_event("run-2", EventLevel::Warn, "other", &serde_json::json!({}))
        .await
        .expect("append other run");

    let events = store.events_for_run("run-1").await.expect("events");
    assert_eq!(events.len(), 5);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as i64 + 1);
        assert_eq!(event.run_id, "run-1");
    }

    let other = store.events_for_run("run-2").await.expect("events");
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].seq, 1);
}

#[tokio::test]
async fn field_map_round_trips_in_order() {
    let store = Store::open_in_memory().await.expect("store");
    store.insert_job(&sample_job("j1")).await.expect("job");

    let map = FieldMap::new(vec![
        FieldMapping {
            field: "title".to_string(),
            spec: SelectorSpec::css("h1"),
        },
        FieldMapping {
            field: "price".to_string(),
            spec: SelectorSpec::css(".price_color"),
        },
    ]);
    store.save_field_map("j1", &map).await.expect("save");

    let loaded = store.fetch_field_map("j1").await.expect("load");
    let names: Vec<&str> = loaded.field_names().collect();
    assert_eq!(names, vec!["title", "price"]);
    assert_eq!(loaded.get("title").expect("title spec").css, "h1");
}

#[tokio::test]
async fn engine_attempts_audit_round_trips() {
    let store = Store::open_in_memory().await.expect("store");
    store.insert_job(&sample_job("j1")).await.expect("job");
    let run = store
        .create_run("j1", EngineMode::Auto, 1, 3, 0)
        .await
        .expect("run");

    let attempts = vec![fieldhand::EngineAttempt {
        engine: fieldhand::EngineTier::Http,
        bias_reason: "no adverse history; starting at http".to_string(),
        response_code: Some(403),
        signals: vec!["status:403".to_string()],
        decision: "escalate_to_browser".to_string(),
        timestamp: chrono::Utc::now(),
        success: false,
    }];
    store
        .update_engine_attempts(&run.id, &attempts)
        .await
        .expect("update attempts");

    let reloaded = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(reloaded.engine_attempts.len(), 1);
    assert_eq!(
        reloaded.engine_attempts[0].engine,
        fieldhand::EngineTier::Http
    );
    assert_eq!(reloaded.engine_attempts[0].decision, "escalate_to_browser");
}
