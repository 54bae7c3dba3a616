//! End-to-end executor cycles against a mock HTTP server.
//!
//! Browser-tier behavior is exercised through its shared parsing path in
//! unit tests; everything here stays on the HTTP tier so the suite runs
//! without a Chromium install.

use fieldhand::extract::schema::{FieldMap, FieldMapping, SelectorSpec};
use fieldhand::{
    CapturedSession, CrawlMode, EngineMode, EngineTier, ExecutionOutcome, FailureCode, Job,
    ListConfig, Orchestrator, OrchestratorConfig, Resolution, RunStatus,
};

struct Harness {
    orchestrator: Orchestrator,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = OrchestratorConfig::builder()
        .store_path(dir.path().join("store.sqlite"))
        .vault_dir(dir.path().join("sessions"))
        .politeness_rate_rps(0.0)
        .build();
    let orchestrator = Orchestrator::init(config).await.expect("orchestrator");
    Harness {
        orchestrator,
        _dir: dir,
    }
}

fn job(id: &str, url: &str, mode: EngineMode) -> Job {
    Job {
        id: id.to_string(),
        name: String::new(),
        target_url: url.to_string(),
        fields: vec!["title".to_string()],
        requires_auth: false,
        crawl_mode: CrawlMode::Single,
        list_config: None,
        engine_mode: mode,
        browser_profile: None,
    }
}

fn title_map() -> FieldMap {
    FieldMap::new(vec![FieldMapping {
        field: "title".to_string(),
        spec: SelectorSpec::css("h1"),
    }])
}

#[tokio::test]
async fn static_single_page_completes_and_learns() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body><h1>Example Domain</h1></body></html>")
        .create_async()
        .await;

    let h = harness().await;
    h.orchestrator
        .register_job(&job("j1", &server.url(), EngineMode::Auto), &title_map())
        .await
        .expect("register");
    let run = h.orchestrator.enqueue_run("j1").await.expect("enqueue");

    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    assert_eq!(outcome, ExecutionOutcome::Completed { records: 1 });
    mock.assert_async().await;

    let store = h.orchestrator.store();
    let finished = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(finished.failure_code.is_none());
    assert_eq!(finished.resolved_strategy, Some(EngineTier::Http));
    assert_eq!(finished.engine_attempts.len(), 1);
    assert!(finished.engine_attempts[0].success);

    let records = store.fetch_records(&run.id).await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), Some(&serde_json::json!("Example Domain")));

    // Learned statistics: (domain, http) attempts 1, successes 1
    let stats = store
        .engine_stats("127.0.0.1", EngineTier::Http)
        .await
        .expect("stats")
        .expect("stats row");
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.successes, 1);

    // Event trail is ordered and complete
    let events = store.events_for_run(&run.id).await.expect("events");
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"run.started"));
    assert!(messages.contains(&"engine.attempt"));
    assert!(messages.contains(&"records.persisted"));
    assert!(messages.contains(&"run.completed"));
    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }
}

#[tokio::test]
async fn valid_page_with_selector_miss_pauses_for_selector_fix() {
    let mut server = mockito::Server::new_async().await;
    let filler = "lorem ipsum dolor sit amet ".repeat(128);
    server
        .mock("GET", "/")
        .with_status(200)
        .with_body(format!(
            "<html><body><main><p>{filler}</p></main></body></html>"
        ))
        .create_async()
        .await;

    let h = harness().await;
    h.orchestrator
        .register_job(&job("j1", &server.url(), EngineMode::Http), &title_map())
        .await
        .expect("register");
    let run = h.orchestrator.enqueue_run("j1").await.expect("enqueue");

    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    let ExecutionOutcome::Paused { task_id } = outcome else {
        panic!("expected pause, got {outcome:?}");
    };

    let store = h.orchestrator.store();
    let paused = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(paused.status, RunStatus::WaitingForHuman);

    let task = store
        .fetch_intervention_task(&task_id)
        .await
        .expect("task fetch")
        .expect("task exists");
    assert_eq!(task.task_type, "selector_fix");
    assert_eq!(task.status, "pending");
    assert_eq!(task.run_id.as_deref(), Some(run.id.as_str()));
}

#[tokio::test]
async fn required_session_domain_pauses_before_any_fetch() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/")
        .with_status(200)
        .with_body("<h1>should never be fetched</h1>")
        .expect(0)
        .create_async()
        .await;

    let h = harness().await;
    let store = h.orchestrator.store();

    // The domain has learned it needs a captured session
    store
        .upsert_domain_config("127.0.0.1", "human", "required", false)
        .await
        .expect("config");

    h.orchestrator
        .register_job(&job("j1", &server.url(), EngineMode::Auto), &title_map())
        .await
        .expect("register");
    let run = h.orchestrator.enqueue_run("j1").await.expect("enqueue");

    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    let ExecutionOutcome::Paused { task_id } = outcome else {
        panic!("expected manual-access pause, got {outcome:?}");
    };
    mock.assert_async().await;

    let task = store
        .fetch_intervention_task(&task_id)
        .await
        .expect("task fetch")
        .expect("task exists");
    assert_eq!(task.task_type, "manual_access");

    // A human resolves it with captured session material
    let captured = CapturedSession {
        cookies: vec![serde_json::json!({"name": "auth", "value": "tok"})],
        storage_state: serde_json::json!({}),
        user_agent: "ua".to_string(),
        viewport: (1920, 1080),
    };
    let resolved = h
        .orchestrator
        .resolve_intervention(&task_id, &Resolution::default(), "operator", Some(captured))
        .await
        .expect("resolve");
    assert!(resolved);

    let requeued = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(requeued.status, RunStatus::Queued);

    // The captured session is now pooled for the domain
    assert!(
        h.orchestrator
            .session_pool()
            .has_healthy_session("127.0.0.1", "default")
            .await
    );

    // Resolving twice never re-enqueues twice
    let again = h
        .orchestrator
        .resolve_intervention(&task_id, &Resolution::default(), "operator", None)
        .await
        .expect("second resolve");
    assert!(!again);
}

#[tokio::test]
async fn rate_limit_on_pinned_http_fails_and_schedules_backoff() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/")
        .with_status(429)
        .with_body("slow down")
        .create_async()
        .await;

    let h = harness().await;
    h.orchestrator
        .register_job(&job("j1", &server.url(), EngineMode::Http), &title_map())
        .await
        .expect("register");
    let run = h.orchestrator.enqueue_run("j1").await.expect("enqueue");

    let before = chrono::Utc::now().timestamp();
    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    assert_eq!(
        outcome,
        ExecutionOutcome::Failed {
            code: FailureCode::RateLimited,
            retry_scheduled: true
        }
    );

    let store = h.orchestrator.store();
    let failed = store
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.failure_code, Some(FailureCode::RateLimited));

    // The retry run sits 10 s out (attempt 1 backoff) with the strategy
    // preserved
    let due_later = store
        .due_queued_runs(before + 600, 10)
        .await
        .expect("due runs");
    assert_eq!(due_later.len(), 1);
    let retry = store
        .fetch_run(&due_later[0])
        .await
        .expect("fetch retry")
        .expect("retry exists");
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.requested_strategy, EngineMode::Http);
    assert!(retry.scheduled_at >= before + 10);
    assert!(retry.scheduled_at <= before + 12);

    // Nothing is due right now
    let due_now = store.due_queued_runs(before, 10).await.expect("due now");
    assert!(due_now.is_empty());
}

#[tokio::test]
async fn final_attempt_does_not_schedule_another_run() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/")
        .with_status(429)
        .create_async()
        .await;

    let h = harness().await;
    h.orchestrator
        .register_job(&job("j1", &server.url(), EngineMode::Http), &title_map())
        .await
        .expect("register");

    let store = h.orchestrator.store();
    // The third (last) run in the chain
    let run = store
        .create_run("j1", EngineMode::Http, 3, 3, 0)
        .await
        .expect("run");

    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    assert_eq!(
        outcome,
        ExecutionOutcome::Failed {
            code: FailureCode::RateLimited,
            retry_scheduled: false
        }
    );

    let due = store
        .due_queued_runs(chrono::Utc::now().timestamp() + 3600, 10)
        .await
        .expect("due");
    assert!(due.is_empty(), "no retry run may exist after the last attempt");
}

#[tokio::test]
async fn list_crawl_honors_pagination_and_item_caps() {
    let mut server = mockito::Server::new_async().await;

    let item_page = |title: &str, price: &str| {
        format!("<html><body><h1>{title}</h1><p class=\"price_color\">{price}</p></body></html>")
    };

    server
        .mock("GET", "/books/index.html")
        .with_status(200)
        .with_body(concat!(
            "<html><body>",
            r#"<h3><a href="item1.html">one</a></h3>"#,
            r#"<h3><a href="item2.html">two</a></h3>"#,
            r#"<h3><a href="item3.html">three</a></h3>"#,
            r#"<ul><li class="next"><a href="page2.html">next</a></li></ul>"#,
            "</body></html>"
        ))
        .create_async()
        .await;
    server
        .mock("GET", "/books/page2.html")
        .with_status(200)
        .with_body(concat!(
            "<html><body>",
            r#"<h3><a href="item4.html">four</a></h3>"#,
            r#"<h3><a href="item5.html">five</a></h3>"#,
            r#"<ul><li class="next"><a href="page3.html">next</a></li></ul>"#,
            "</body></html>"
        ))
        .create_async()
        .await;
    // Page 3 exists but max_pages = 2 keeps the crawler away
    let page3 = server
        .mock("GET", "/books/page3.html")
        .with_status(200)
        .with_body("<h3><a href=\"item9.html\">nine</a></h3>")
        .expect(0)
        .create_async()
        .await;

    for (i, (title, price)) in [
        ("Astrophysics", "£12.00"),
        ("Biology", "£9.50"),
        ("Chemistry", "£15.25"),
        ("Dynamics", "£7.99"),
    ]
    .iter()
    .enumerate()
    {
        server
            .mock("GET", format!("/books/item{}.html", i + 1).as_str())
            .with_status(200)
            .with_body(item_page(title, price))
            .create_async()
            .await;
    }
    // item5 exists but max_items = 4 stops before it
    let item5 = server
        .mock("GET", "/books/item5.html")
        .with_status(200)
        .with_body(item_page("Ecology", "£3.00"))
        .expect(0)
        .create_async()
        .await;

    let h = harness().await;
    let list_job = Job {
        id: "list1".to_string(),
        name: String::new(),
        target_url: format!("{}/books/index.html", server.url()),
        fields: vec!["title".to_string(), "price".to_string()],
        requires_auth: false,
        crawl_mode: CrawlMode::List,
        list_config: Some(ListConfig {
            item_links: SelectorSpec::css("h3>a").with_attr("href").all_matches(),
            pagination: Some(SelectorSpec::css("li.next>a").with_attr("href")),
            max_pages: 2,
            max_items: 4,
        }),
        engine_mode: EngineMode::Http,
        browser_profile: None,
    };
    let field_map = FieldMap::new(vec![
        FieldMapping {
            field: "title".to_string(),
            spec: SelectorSpec::css("h1"),
        },
        FieldMapping {
            field: "price".to_string(),
            spec: SelectorSpec::css(".price_color"),
        },
    ]);
    h.orchestrator
        .register_job(&list_job, &field_map)
        .await
        .expect("register");

    let run = h.orchestrator.enqueue_run("list1").await.expect("enqueue");
    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    assert_eq!(outcome, ExecutionOutcome::Completed { records: 4 });

    page3.assert_async().await;
    item5.assert_async().await;

    let records = h
        .orchestrator
        .store()
        .fetch_records(&run.id)
        .await
        .expect("records");
    assert_eq!(records.len(), 4);
    assert_eq!(
        records[0].get("title"),
        Some(&serde_json::json!("Astrophysics"))
    );
    assert_eq!(
        records[3].get("price"),
        Some(&serde_json::json!("£7.99"))
    );
}

#[tokio::test]
async fn list_crawl_with_zero_items_completes_empty() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/books/index.html")
        .with_status(200)
        .with_body(r#"<h3><a href="item1.html">one</a></h3>"#)
        .create_async()
        .await;
    let item = server
        .mock("GET", "/books/item1.html")
        .with_status(200)
        .with_body("<h1>never fetched</h1>")
        .expect(0)
        .create_async()
        .await;

    let h = harness().await;
    let list_job = Job {
        id: "list0".to_string(),
        name: String::new(),
        target_url: format!("{}/books/index.html", server.url()),
        fields: vec!["title".to_string()],
        requires_auth: false,
        crawl_mode: CrawlMode::List,
        list_config: Some(ListConfig {
            item_links: SelectorSpec::css("h3>a").with_attr("href").all_matches(),
            pagination: None,
            max_pages: 1,
            max_items: 0,
        }),
        engine_mode: EngineMode::Http,
        browser_profile: None,
    };
    h.orchestrator
        .register_job(&list_job, &title_map())
        .await
        .expect("register");

    let run = h.orchestrator.enqueue_run("list0").await.expect("enqueue");
    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    assert_eq!(outcome, ExecutionOutcome::Completed { records: 0 });
    item.assert_async().await;

    let finished = h
        .orchestrator
        .store()
        .fetch_run(&run.id)
        .await
        .expect("fetch")
        .expect("run exists");
    assert_eq!(finished.status, RunStatus::Completed);
}

#[tokio::test]
async fn executing_a_claimed_run_is_a_no_op() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/")
        .with_status(200)
        .with_body("<h1>hi</h1>")
        .expect(0)
        .create_async()
        .await;

    let h = harness().await;
    h.orchestrator
        .register_job(&job("j1", &server.url(), EngineMode::Http), &title_map())
        .await
        .expect("register");
    let run = h.orchestrator.enqueue_run("j1").await.expect("enqueue");

    // Another executor already holds the lease
    assert!(h.orchestrator.store().claim_run(&run.id).await.expect("claim"));

    let outcome = h
        .orchestrator
        .executor()
        .execute(&run.id)
        .await
        .expect("execute");
    assert_eq!(outcome, ExecutionOutcome::Skipped);
}
