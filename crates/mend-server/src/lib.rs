//! HTTP surface: the agent endpoints, circuit observability, and record
//! listings, plus the SSE progress stream.

pub mod api_error;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use mend_core::types::{
    Analysis, BreakerDenial, BreakerSnapshot, Feedback, FeedbackStatus, Plan, Task, TaskStatus,
    TokenUsage,
};
use mend_harness::TokenBreaker;
use mend_pipeline::{Ingress, TaskEvent};
use mend_store::{
    BreakerEventQuery, FeedbackQuery, Page, Store, TaskQuery, UsageQuery, UsageStats,
};

use api_error::ApiError;

// ---------------------------------------------------------------------------
// State & router
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub ingress: Ingress,
    pub store: Arc<Store>,
    pub breaker: TokenBreaker,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(ingress: Ingress, store: Arc<Store>, breaker: TokenBreaker) -> Self {
        Self {
            ingress,
            store,
            breaker,
            start_time: std::time::Instant::now(),
        }
    }
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/agent/process", post(process))
        .route("/agent/process/stream", post(process_stream))
        .route("/agent/task-logs", get(task_logs))
        .route("/feedback", get(feedback_list))
        .route("/circuit/status", get(circuit_status))
        .route("/circuit/check", post(circuit_check))
        .route("/circuit/token-usage", get(token_usage))
        .route("/circuit/events", get(circuit_events))
        .route("/health", get(health))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub feedback_id: Uuid,
    pub status: FeedbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub breaker_snapshot: BreakerSnapshot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub status: Option<FeedbackStatus>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub estimated_tokens: Option<u64>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BreakerDenial>,
    pub snapshot: BreakerSnapshot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub feedback_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub records: Vec<TokenUsage>,
    pub aggregates: UsageStats,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerEventParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub unresolved_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub feedback_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

// ---------------------------------------------------------------------------
// Agent handlers
// ---------------------------------------------------------------------------

/// Run the pipeline to completion and answer with the final state.
async fn process(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let mut submission = state
        .ingress
        .submit(&request.content, request.user_id, request.language)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut analysis = None;
    let mut plan = None;
    while let Some(event) = submission.events.recv().await {
        match event {
            TaskEvent::Intent { analysis: a } => analysis = Some(a),
            TaskEvent::Suggestion { plan: p } => plan = Some(p),
            _ => {}
        }
    }

    let status = state
        .store
        .get_feedback(submission.feedback_id)
        .await
        .map(|f| f.status)
        .ok_or_else(|| ApiError::Internal("feedback row vanished".into()))?;

    Ok(Json(ProcessResponse {
        feedback_id: submission.feedback_id,
        status,
        analysis,
        plan,
        breaker_snapshot: state.breaker.status().await,
    }))
}

/// Same submission, streamed as server-sent events. The stream terminates
/// after `done`.
async fn process_stream(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ProcessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state
        .ingress
        .submit(&request.content, request.user_id, request.language)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let stream = submission.events.into_stream().map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.kind())
                .json_data(&event)
                .unwrap_or_default(),
        )
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn task_logs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TaskLogParams>,
) -> Json<Page<Task>> {
    let page = state
        .store
        .list_tasks(&TaskQuery {
            limit: params.limit,
            offset: 0,
            task_id: params.task_id,
            feedback_id: params.feedback_id,
            status: params.status,
        })
        .await;
    Json(page)
}

// ---------------------------------------------------------------------------
// Feedback handlers
// ---------------------------------------------------------------------------

async fn feedback_list(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<FeedbackListParams>,
) -> Json<Page<Feedback>> {
    let page = state
        .store
        .list_feedback(&FeedbackQuery {
            limit: params.limit,
            offset: params.offset.unwrap_or(0),
            status: params.status,
            language: params.language,
        })
        .await;
    Json(page)
}

// ---------------------------------------------------------------------------
// Circuit handlers
// ---------------------------------------------------------------------------

async fn circuit_status(State(state): State<Arc<ApiState>>) -> Json<BreakerSnapshot> {
    Json(state.breaker.status().await)
}

/// Diagnostic admission probe. Answers 503 while the circuit is open so
/// external monitors can alert on the status code alone.
async fn circuit_check(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CheckRequest>,
) -> axum::response::Response {
    let decision = state
        .breaker
        .check(
            &request.service,
            &request.action,
            request.estimated_tokens.unwrap_or(0),
            request.task_id,
        )
        .await;

    let body = CheckResponse {
        allowed: decision.allowed,
        reason: decision.reason,
        snapshot: decision.snapshot,
    };
    if decision.reason == Some(BreakerDenial::CircuitOpen) {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    } else {
        Json(body).into_response()
    }
}

async fn token_usage(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<UsageParams>,
) -> Json<UsageResponse> {
    let query = UsageQuery {
        limit: params.limit,
        task_id: params.task_id,
        feedback_id: params.feedback_id,
        since: None,
    };
    let records = state.store.list_token_usage(&query).await;
    let aggregates = state.store.token_usage_stats(&query).await;
    Json(UsageResponse {
        records,
        aggregates,
    })
}

async fn circuit_events(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<BreakerEventParams>,
) -> Json<Vec<mend_core::types::BreakerEvent>> {
    let events = state
        .store
        .list_breaker_events(&BreakerEventQuery {
            limit: params.limit,
            service: params.service,
            unresolved_only: params.unresolved_only.unwrap_or(false),
        })
        .await;
    Json(events)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.start_time.elapsed().as_secs(),
    }))
}
