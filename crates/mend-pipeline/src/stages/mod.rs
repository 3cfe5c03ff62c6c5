//! The five stage services.
//!
//! Every service has the same shape — [`StageService::run`] over a shared
//! [`StageCx`] — and owns exactly the collaborators it composes: at most
//! one model call plus at most one workspace or test action. Services do
//! not know about each other; sequencing and retry policy live in the
//! orchestrator.

mod analyzer;
mod modifier;
mod planner;
mod publisher;
mod tester;

pub use analyzer::Analyzer;
pub use modifier::Modifier;
pub use planner::Planner;
pub use publisher::Publisher;
pub use tester::Tester;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use mend_core::types::{
    Analysis, ChangeSet, ErrorKind, Plan, Publication, StageName, StageRecord, StageStatus,
    TestReport,
};
use mend_model::ModelError;
use mend_store::Store;

use crate::events::{EventSender, TaskEvent};

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    /// Only the tester sets this: whether the retry budget still has room.
    pub retryable: bool,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<ModelError> for StageError {
    fn from(e: ModelError) -> Self {
        let kind = match &e {
            ModelError::BreakerBlocked { .. } => ErrorKind::BreakerBlocked,
            ModelError::Transient(_) | ModelError::Failed(_) => ErrorKind::ModelTransient,
        };
        StageError::new(kind, e.to_string())
    }
}

impl From<mend_store::StoreError> for StageError {
    fn from(e: mend_store::StoreError) -> Self {
        StageError::new(ErrorKind::WorkspaceError, format!("store: {e}"))
    }
}

/// Deserialize the structured payload a model call was asked to produce.
pub(crate) fn parse_payload<T: DeserializeOwned>(content: &str) -> Result<T, StageError> {
    let raw = mend_model::extract_json(content).ok_or_else(|| {
        StageError::new(
            ErrorKind::ModelTransient,
            "model reply contained no JSON payload",
        )
    })?;
    serde_json::from_str(raw).map_err(|e| {
        StageError::new(
            ErrorKind::ModelTransient,
            format!("model payload did not match the expected shape: {e}"),
        )
    })
}

// ---------------------------------------------------------------------------
// StageCx
// ---------------------------------------------------------------------------

/// Scratch results accumulated as the pipeline advances. Each retry round
/// overwrites the plan, change set, and report slots.
#[derive(Debug, Default, Clone)]
pub struct PipelineData {
    pub analysis: Option<Analysis>,
    pub plan: Option<Plan>,
    pub change_set: Option<ChangeSet>,
    pub report: Option<TestReport>,
    pub publication: Option<Publication>,
}

/// Everything a stage needs about the run it is part of.
pub struct StageCx {
    pub task_id: Uuid,
    pub feedback_id: Uuid,
    pub content: String,
    pub language: String,
    /// Zero on the first pass; incremented by the orchestrator for each
    /// trip around the plan → modify → test back-edge.
    pub attempt: u32,
    pub store: Arc<Store>,
    pub events: EventSender,
    pub data: PipelineData,
}

impl StageCx {
    pub fn emit(&self, event: TaskEvent) {
        self.events.emit(event);
    }

    pub async fn begin(&self, name: StageName) -> Result<(), StageError> {
        self.store
            .append_stage(self.task_id, StageRecord::started(name))
            .await?;
        Ok(())
    }

    pub async fn complete<T: Serialize>(&self, name: StageName, data: &T) -> Result<(), StageError> {
        self.store
            .finish_stage(
                self.task_id,
                name,
                StageStatus::Completed,
                serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            )
            .await?;
        Ok(())
    }

    pub async fn fail<T: Serialize>(&self, name: StageName, data: &T) -> Result<(), StageError> {
        self.store
            .finish_stage(
                self.task_id,
                name,
                StageStatus::Failed,
                serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StageService
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StageService: Send + Sync {
    fn name(&self) -> StageName;
    async fn run(&self, cx: &mut StageCx) -> Result<(), StageError>;
}
