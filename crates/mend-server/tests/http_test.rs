use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use mend_core::config::{BreakerConfig, ModelConfig, RepoConfig, TestConfig};
use mend_harness::{ShutdownSignal, TokenBreaker};
use mend_model::{MockProvider, ModelClient};
use mend_pipeline::{Ingress, Orchestrator, RecordedGateway, ScriptedBrowser, TestHarness};
use mend_server::{api_router, ApiState};
use mend_store::{FeedbackQuery, Store};
use mend_workspace::Workspace;

const ANALYSIS: &str = r#"{"intent": "speed", "feasibility": "high", "priority": 3,
    "impact": "slow first paint", "summary": "landing page loads slowly"}"#;

const PLAN: &str = r#"{"file": "src/app.js", "action": "insert",
    "codeBlock": "prefetchAssets();", "description": "prefetch critical assets"}"#;

const CASES: &str = r#"[
    {"name": "home renders", "path": "/", "expect": "ok"},
    {"name": "nav renders", "path": "/nav", "expect": "ok"},
    {"name": "footer renders", "path": "/", "expect": "ok"}
]"#;

struct Harness {
    router: axum::Router,
    store: Arc<Store>,
    breaker: TokenBreaker,
    _dir: tempfile::TempDir,
}

fn harness_with(provider: MockProvider, breaker_config: BreakerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::in_memory());
    let breaker = TokenBreaker::new(breaker_config, store.clone());
    let model = ModelClient::new(
        Arc::new(provider),
        breaker.clone(),
        store.clone(),
        &ModelConfig::default(),
    );
    let workspace = Arc::new(Workspace::new(&RepoConfig {
        url: None,
        work_dir: dir.path().join("tree"),
        snapshot_capacity: 5,
    }));
    let harness = TestHarness::new(Arc::new(ScriptedBrowser::passing()), &TestConfig::default());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        breaker.clone(),
        model,
        workspace,
        harness,
        Arc::new(RecordedGateway::new()),
        ShutdownSignal::new(),
    ));
    let state = Arc::new(ApiState::new(
        Ingress::new(store.clone(), orchestrator),
        store.clone(),
        breaker.clone(),
    ));
    Harness {
        router: api_router(state),
        store,
        breaker,
        _dir: dir,
    }
}

fn happy_provider() -> MockProvider {
    MockProvider::new()
        .with_reply(ANALYSIS, 120, 60)
        .with_reply(PLAN, 200, 150)
        .with_reply(CASES, 90, 70)
        .with_reply("- prefetch critical assets on load", 80, 40)
}

fn generous_breaker() -> BreakerConfig {
    BreakerConfig {
        max_daily_tokens: 1_000_000,
        max_task_tokens: 1_000_000,
        ..BreakerConfig::default()
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness_with(MockProvider::new(), generous_breaker());
    let response = h
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["uptime"].is_u64());
}

#[tokio::test]
async fn empty_content_is_rejected_without_a_row() {
    let h = harness_with(MockProvider::new(), generous_breaker());
    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/agent/process",
            serde_json::json!({ "content": "   " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("empty"));

    assert_eq!(h.store.list_feedback(&FeedbackQuery::default()).await.total, 0);
}

#[tokio::test]
async fn process_runs_to_completion_and_reports_state() {
    let h = harness_with(happy_provider(), generous_breaker());
    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/agent/process",
            serde_json::json!({ "content": "page loads slowly", "userId": "u-1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "completed");
    assert!(body["feedbackId"].is_string());
    assert_eq!(body["analysis"]["intent"], "speed");
    assert_eq!(body["plan"]["file"], "src/app.js");
    assert!(body["breakerSnapshot"]["dailyTokensUsed"].is_u64());

    // The listing reflects the finished run.
    let response = h
        .router
        .oneshot(
            Request::get("/feedback?status=completed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["list"][0]["status"], "completed");
}

#[tokio::test]
async fn stream_emits_connected_through_done() {
    let h = harness_with(happy_provider(), generous_breaker());
    let response = h
        .router
        .oneshot(post_json(
            "/agent/process/stream",
            serde_json::json!({ "content": "page loads slowly" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    for name in ["connected", "stage", "intent", "suggestion", "test_result", "pr", "complete", "done"] {
        assert!(text.contains(&format!("event: {name}")), "missing event {name}");
    }
    let done_at = text.rfind("event: done").unwrap();
    let complete_at = text.rfind("event: complete").unwrap();
    assert!(complete_at < done_at);
}

#[tokio::test]
async fn circuit_endpoints_expose_breaker_state() {
    let h = harness_with(happy_provider(), generous_breaker());

    let response = h
        .router
        .clone()
        .oneshot(Request::get("/circuit/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["circuit"], "closed");

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/circuit/check",
            serde_json::json!({ "service": "llm", "action": "diagnostic", "estimatedTokens": 10 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);

    // Run a task so usage and task-log listings have content.
    h.router
        .clone()
        .oneshot(post_json(
            "/agent/process",
            serde_json::json!({ "content": "page loads slowly" }),
        ))
        .await
        .unwrap();

    let response = h
        .router
        .clone()
        .oneshot(
            Request::get("/circuit/token-usage?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["records"].as_array().unwrap().len(), 4);
    assert!(body["aggregates"]["totalTokens"].as_u64().unwrap() > 0);
    assert_eq!(body["aggregates"]["failureCount"], 0);

    let response = h
        .router
        .oneshot(
            Request::get("/agent/task-logs?status=completed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["list"].as_array().unwrap().len(), 1);
    assert_eq!(body["list"][0]["stages"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn open_circuit_turns_the_diagnostic_check_into_503() {
    let h = harness_with(
        MockProvider::new(),
        BreakerConfig {
            max_daily_tokens: 100,
            trip_threshold: 5,
            ..BreakerConfig::default()
        },
    );

    // Five denials trip the circuit.
    for _ in 0..5 {
        h.breaker.check("llm", "analyze", 1_000, None).await;
    }

    let response = h
        .router
        .oneshot(post_json(
            "/circuit/check",
            serde_json::json!({ "service": "llm", "action": "diagnostic" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "circuit_open");

    // The denial log is visible.
    let response = harness_with(MockProvider::new(), generous_breaker())
        .router
        .oneshot(
            Request::get("/circuit/events?unresolvedOnly=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
