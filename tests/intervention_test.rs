//! Intervention lifecycle: pause idempotency, resolve/cancel/expire, and
//! the pending-task throttle with evidence dedup.

use fieldhand::intervention::{InterventionEngine, InterventionType};
use fieldhand::session_pool::{PoolLimits, SessionPool};
use fieldhand::{
    EngineMode, EventStream, InterventionTtls, Resolution, Run, RunStatus, Store,
};

struct Setup {
    store: Store,
    engine: InterventionEngine,
    pool: SessionPool,
    _dir: tempfile::TempDir,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open_in_memory().await.expect("store");
    let events = EventStream::new(store.clone());
    let engine = InterventionEngine::new(
        store.clone(),
        events,
        InterventionTtls::default(),
        "default".to_string(),
    );
    let pool = SessionPool::open(&dir.path().join("sessions"), PoolLimits::default())
        .await
        .expect("pool");
    Setup {
        store,
        engine,
        pool,
        _dir: dir,
    }
}

async fn running_run(store: &Store, job_id: &str) -> Run {
    let job = fieldhand::Job {
        id: job_id.to_string(),
        name: String::new(),
        target_url: "https://blocked.example/data".to_string(),
        fields: vec!["title".to_string()],
        requires_auth: false,
        crawl_mode: fieldhand::CrawlMode::Single,
        list_config: None,
        engine_mode: EngineMode::Auto,
        browser_profile: None,
    };
    store.insert_job(&job).await.expect("job");
    let run = store
        .create_run(job_id, EngineMode::Auto, 1, 3, 0)
        .await
        .expect("run");
    assert!(store.claim_run(&run.id).await.expect("claim"));
    store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists")
}

#[tokio::test]
async fn pause_is_idempotent_on_run_id() {
    let s = setup().await;
    let run = running_run(&s.store, "j1").await;

    let first = s
        .engine
        .pause_run(
            &run,
            "blocked.example",
            InterventionType::LoginRefresh,
            "401 with session present",
            serde_json::json!({}),
        )
        .await
        .expect("first pause");

    let second = s
        .engine
        .pause_run(
            &run,
            "blocked.example",
            InterventionType::LoginRefresh,
            "401 with session present",
            serde_json::json!({}),
        )
        .await
        .expect("second pause");

    assert_eq!(first.id, second.id, "pause must not mint a second task");

    let paused = s
        .store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(paused.status, RunStatus::WaitingForHuman);
    assert!(first.expires_at.is_some());
}

#[tokio::test]
async fn resolve_requeues_once_and_only_once() {
    let s = setup().await;
    let run = running_run(&s.store, "j1").await;

    let task = s
        .engine
        .pause_run(
            &run,
            "blocked.example",
            InterventionType::SelectorFix,
            "selectors extracted nothing",
            serde_json::json!({}),
        )
        .await
        .expect("pause");

    let resolved = s
        .engine
        .resolve(&task.id, &Resolution::default(), "operator", None, &s.pool)
        .await
        .expect("resolve");
    assert!(resolved);

    let requeued = s
        .store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(requeued.status, RunStatus::Queued);

    // Second resolve: no flip, no double re-enqueue
    assert!(s.store.claim_run(&run.id).await.expect("claim again"));
    let again = s
        .engine
        .resolve(&task.id, &Resolution::default(), "operator", None, &s.pool)
        .await
        .expect("second resolve");
    assert!(!again);
    let still_running = s
        .store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(still_running.status, RunStatus::Running);
}

#[tokio::test]
async fn cancel_leaves_the_run_paused() {
    let s = setup().await;
    let run = running_run(&s.store, "j1").await;

    let task = s
        .engine
        .pause_run(
            &run,
            "blocked.example",
            InterventionType::CaptchaSolve,
            "captcha with no tier left",
            serde_json::json!({}),
        )
        .await
        .expect("pause");

    assert!(s.engine.cancel(&task.id).await.expect("cancel"));

    let row = s
        .store
        .fetch_intervention_task(&task.id)
        .await
        .expect("task fetch")
        .expect("task exists");
    assert_eq!(row.status, "cancelled");

    let paused = s
        .store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(paused.status, RunStatus::WaitingForHuman);

    // A cancelled task cannot be resolved afterwards
    let resolved = s
        .engine
        .resolve(&task.id, &Resolution::default(), "operator", None, &s.pool)
        .await
        .expect("resolve cancelled");
    assert!(!resolved);
}

#[tokio::test]
async fn expiry_flips_pending_tasks_and_keeps_runs_paused() {
    let s = setup().await;
    let run = running_run(&s.store, "j1").await;

    // A task already past its TTL
    s.store
        .insert_intervention_task(
            "t-old",
            "j1",
            Some(&run.id),
            "blocked.example",
            "login_refresh",
            "stale session",
            &serde_json::json!({}),
            10,
            Some(chrono::Utc::now().timestamp() - 60),
        )
        .await
        .expect("insert");
    assert!(s.store.pause_run_row(&run.id).await.expect("pause row"));

    let expired = s.engine.expire_overdue().await.expect("expire");
    assert_eq!(expired, 1);

    let row = s
        .store
        .fetch_intervention_task("t-old")
        .await
        .expect("task fetch")
        .expect("task exists");
    assert_eq!(row.status, "expired");

    // No silent failure: the run stays waiting for a human
    let still_paused = s
        .store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(still_paused.status, RunStatus::WaitingForHuman);

    // Sweep is idempotent
    assert_eq!(s.engine.expire_overdue().await.expect("expire again"), 0);
}

#[tokio::test]
async fn throttle_dedups_by_appending_evidence() {
    let s = setup().await;

    // Five distinct pending tasks exhaust the per-job budget
    let mut first_task_id = None;
    for i in 0..5 {
        let run = running_run(&s.store, "j1").await;
        let task = s
            .engine
            .pause_run(
                &run,
                "blocked.example",
                InterventionType::SelectorFix,
                &format!("selector miss variant {i}"),
                serde_json::json!({"variant": i}),
            )
            .await
            .expect("pause");
        if i == 0 {
            first_task_id = Some(task.id);
        }
    }
    let first_task_id = first_task_id.expect("first task id");

    // A sixth trigger matching task 0's (type, reason) appends evidence
    let run6 = running_run(&s.store, "j1").await;
    let merged = s
        .engine
        .pause_run(
            &run6,
            "blocked.example",
            InterventionType::SelectorFix,
            "selector miss variant 0",
            serde_json::json!({"variant": "six"}),
        )
        .await
        .expect("pause six");

    assert_eq!(merged.id, first_task_id);

    let row = s
        .store
        .fetch_intervention_task(&first_task_id)
        .await
        .expect("task fetch")
        .expect("task exists");
    let evidence = row
        .payload
        .get("evidence")
        .and_then(|v| v.as_array())
        .expect("evidence array");
    assert_eq!(evidence.len(), 1);
    assert_eq!(
        evidence[0].get("run_id"),
        Some(&serde_json::json!(run6.id))
    );

    // And the sixth run is paused all the same
    let paused = s
        .store
        .fetch_run(&run6.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(paused.status, RunStatus::WaitingForHuman);
}
