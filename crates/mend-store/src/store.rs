use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use mend_core::config::{DbConfig, DbMode};
use mend_core::types::{
    BreakerEvent, Feedback, FeedbackStatus, StageName, StageRecord, StageStatus, Task, TaskOutcome,
    TaskStatus, TokenUsage,
};

use crate::db::{self, Document, Retention};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A bounded slice of a list plus the total matching count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub list: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub status: Option<FeedbackStatus>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub task_id: Option<Uuid>,
    pub feedback_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    pub limit: Option<usize>,
    pub task_id: Option<Uuid>,
    pub feedback_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct BreakerEventQuery {
    pub limit: Option<usize>,
    pub service: Option<String>,
    pub unresolved_only: bool,
}

/// Aggregates computed on read over the filtered usage slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub by_model: HashMap<String, u64>,
    pub by_call_type: HashMap<String, u64>,
    pub success_count: usize,
    pub failure_count: usize,
}

const DEFAULT_PAGE: usize = 50;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Shared record store. Memory mode keeps everything in the document;
/// file mode additionally rewrites `database.json` atomically on terminal
/// transitions and on the flush tick.
pub struct Store {
    doc: RwLock<Document>,
    mode: DbMode,
    data_dir: PathBuf,
    caps: Retention,
}

impl Store {
    /// RAM-only store.
    pub fn in_memory() -> Self {
        Self {
            doc: RwLock::new(Document::default()),
            mode: DbMode::Memory,
            data_dir: PathBuf::new(),
            caps: Retention::default(),
        }
    }

    /// Open a store per configuration, loading any existing document in
    /// file mode.
    pub async fn open(config: &DbConfig) -> Result<Self, StoreError> {
        let doc = match config.mode {
            DbMode::Memory => Document::default(),
            DbMode::File => db::load(&config.data_dir).await?,
        };
        Ok(Self {
            doc: RwLock::new(doc),
            mode: config.mode,
            data_dir: config.data_dir.clone(),
            caps: Retention::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_retention(mut self, caps: Retention) -> Self {
        self.caps = caps;
        self
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    pub async fn create_feedback(&self, feedback: Feedback) {
        let mut doc = self.doc.write().await;
        doc.feedback.push_back(feedback);
        doc.trim(&self.caps);
    }

    pub async fn get_feedback(&self, id: Uuid) -> Option<Feedback> {
        let doc = self.doc.read().await;
        doc.feedback.iter().find(|f| f.id == id).cloned()
    }

    pub async fn update_feedback_status(
        &self,
        id: Uuid,
        status: FeedbackStatus,
        result: Option<TaskOutcome>,
    ) -> Result<(), StoreError> {
        {
            let mut doc = self.doc.write().await;
            let feedback = doc
                .feedback
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("feedback {id}")))?;
            feedback.status = status;
            if result.is_some() {
                feedback.result = result;
            }
        }
        if status.is_terminal() {
            self.flush_if_file().await;
        }
        Ok(())
    }

    pub async fn list_feedback(&self, query: &FeedbackQuery) -> Page<Feedback> {
        let doc = self.doc.read().await;
        // Newest first, like every other listing.
        let matching: Vec<&Feedback> = doc
            .feedback
            .iter()
            .rev()
            .filter(|f| query.status.is_none_or(|s| f.status == s))
            .filter(|f| {
                query
                    .language
                    .as_deref()
                    .is_none_or(|lang| f.language == lang)
            })
            .collect();
        let total = matching.len();
        let list = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(DEFAULT_PAGE))
            .cloned()
            .collect();
        Page { list, total }
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, task: Task) {
        let mut doc = self.doc.write().await;
        doc.tasks.push_back(task);
        doc.trim(&self.caps);
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        let doc = self.doc.read().await;
        doc.tasks.iter().find(|t| t.id == id).cloned()
    }

    pub async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        {
            let mut doc = self.doc.write().await;
            let task = doc
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
            task.status = status;
            task.error = error;
            if status != TaskStatus::Running {
                task.completed_at = Some(Utc::now());
            }
        }
        if status != TaskStatus::Running {
            self.flush_if_file().await;
        }
        Ok(())
    }

    /// Append a new stage row to a task's stage log.
    pub async fn append_stage(&self, task_id: Uuid, stage: StageRecord) -> Result<(), StoreError> {
        let mut doc = self.doc.write().await;
        let task = doc
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        task.stages.push(stage);
        Ok(())
    }

    /// Close the most recent open row for `name` with a terminal status and
    /// payload. The row keeps its start time; the end time is stamped here.
    pub async fn finish_stage(
        &self,
        task_id: Uuid,
        name: StageName,
        status: StageStatus,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut doc = self.doc.write().await;
        let task = doc
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        let stage = task
            .stages
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.status == StageStatus::Started)
            .ok_or_else(|| StoreError::NotFound(format!("open stage {name} on task {task_id}")))?;
        stage.status = status;
        stage.ended_at = Some(Utc::now());
        stage.data = data;
        Ok(())
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Page<Task> {
        let doc = self.doc.read().await;
        let matching: Vec<&Task> = doc
            .tasks
            .iter()
            .rev()
            .filter(|t| query.task_id.is_none_or(|id| t.id == id))
            .filter(|t| query.feedback_id.is_none_or(|id| t.feedback_id == id))
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .collect();
        let total = matching.len();
        let list = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(DEFAULT_PAGE))
            .cloned()
            .collect();
        Page { list, total }
    }

    // -----------------------------------------------------------------------
    // Token usage
    // -----------------------------------------------------------------------

    pub async fn record_token_usage(&self, usage: TokenUsage) {
        let mut doc = self.doc.write().await;
        doc.token_usage.push_back(usage);
        doc.trim(&self.caps);
    }

    pub async fn list_token_usage(&self, query: &UsageQuery) -> Vec<TokenUsage> {
        let doc = self.doc.read().await;
        doc.token_usage
            .iter()
            .rev()
            .filter(|u| query.task_id.is_none_or(|id| u.task_id == id))
            .filter(|u| query.feedback_id.is_none_or(|id| u.feedback_id == id))
            .filter(|u| query.since.is_none_or(|t| u.timestamp >= t))
            .take(query.limit.unwrap_or(DEFAULT_PAGE))
            .cloned()
            .collect()
    }

    /// Aggregate the filtered usage slice. The limit does not apply here:
    /// stats cover every matching record still retained.
    pub async fn token_usage_stats(&self, query: &UsageQuery) -> UsageStats {
        let doc = self.doc.read().await;
        let mut stats = UsageStats::default();
        for u in doc
            .token_usage
            .iter()
            .filter(|u| query.task_id.is_none_or(|id| u.task_id == id))
            .filter(|u| query.feedback_id.is_none_or(|id| u.feedback_id == id))
            .filter(|u| query.since.is_none_or(|t| u.timestamp >= t))
        {
            stats.total_prompt_tokens += u.prompt_tokens;
            stats.total_completion_tokens += u.completion_tokens;
            stats.total_tokens += u.total_tokens();
            *stats.by_model.entry(u.model.clone()).or_default() += u.total_tokens();
            *stats.by_call_type.entry(u.call_type.clone()).or_default() += u.total_tokens();
            if u.success {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }
        }
        stats
    }

    // -----------------------------------------------------------------------
    // Breaker events
    // -----------------------------------------------------------------------

    pub async fn record_breaker_event(&self, event: BreakerEvent) {
        let mut doc = self.doc.write().await;
        doc.breaker_events.push_back(event);
        doc.trim(&self.caps);
    }

    /// Mark an event resolved. Only the resolved flag and note mutate.
    pub async fn resolve_breaker_event(
        &self,
        id: Uuid,
        note: impl Into<String>,
    ) -> Result<(), StoreError> {
        let mut doc = self.doc.write().await;
        let event = doc
            .breaker_events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("breaker event {id}")))?;
        event.resolved = true;
        event.resolution = Some(note.into());
        Ok(())
    }

    pub async fn list_breaker_events(&self, query: &BreakerEventQuery) -> Vec<BreakerEvent> {
        let doc = self.doc.read().await;
        doc.breaker_events
            .iter()
            .rev()
            .filter(|e| query.service.as_deref().is_none_or(|s| e.service == s))
            .filter(|e| !query.unresolved_only || !e.resolved)
            .take(query.limit.unwrap_or(DEFAULT_PAGE))
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut doc = self.doc.write().await;
        doc.settings.insert(key.into(), value.into());
    }

    pub async fn get_setting(&self, key: &str) -> Option<String> {
        let doc = self.doc.read().await;
        doc.settings.get(key).cloned()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Rewrite the database file. No-op in memory mode.
    pub async fn flush(&self) -> Result<(), StoreError> {
        if self.mode != DbMode::File {
            return Ok(());
        }
        let doc = self.doc.read().await;
        db::save(&self.data_dir, &doc).await?;
        debug!(path = %self.data_dir.display(), "database flushed");
        Ok(())
    }

    async fn flush_if_file(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "terminal-transition flush failed");
        }
    }

    /// Periodic flush loop; exits when `shutdown` resolves. Intervals below
    /// 30 s are raised to 30 s.
    pub async fn run_flush_loop(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let interval = interval.max(Duration::from_secs(30));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "periodic flush failed");
                    }
                }
                _ = shutdown.recv() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "shutdown flush failed");
                    }
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::types::StageStatus;

    fn feedback(lang: &str) -> Feedback {
        Feedback::new("the search box is slow", "user-1", lang)
    }

    #[tokio::test]
    async fn feedback_create_get_update() {
        let store = Store::in_memory();
        let f = feedback("en");
        let id = f.id;
        store.create_feedback(f).await;

        assert_eq!(store.get_feedback(id).await.unwrap().status, FeedbackStatus::Pending);

        store
            .update_feedback_status(id, FeedbackStatus::Analyzing, None)
            .await
            .unwrap();
        assert_eq!(
            store.get_feedback(id).await.unwrap().status,
            FeedbackStatus::Analyzing
        );
    }

    #[tokio::test]
    async fn update_missing_feedback_is_not_found() {
        let store = Store::in_memory();
        let err = store
            .update_feedback_status(Uuid::new_v4(), FeedbackStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn feedback_list_filters_and_pages() {
        let store = Store::in_memory();
        for _ in 0..3 {
            store.create_feedback(feedback("en")).await;
        }
        for _ in 0..2 {
            store.create_feedback(feedback("de")).await;
        }

        let page = store
            .list_feedback(&FeedbackQuery {
                language: Some("de".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 2);
        assert_eq!(page.list.len(), 2);

        let page = store
            .list_feedback(&FeedbackQuery {
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 5);
        assert_eq!(page.list.len(), 2);
    }

    #[tokio::test]
    async fn stage_rows_append_and_finish() {
        let store = Store::in_memory();
        let task = Task::new(Uuid::new_v4());
        let task_id = task.id;
        store.create_task(task).await;

        store
            .append_stage(task_id, StageRecord::started(StageName::AnalyzeIntent))
            .await
            .unwrap();
        store
            .finish_stage(
                task_id,
                StageName::AnalyzeIntent,
                StageStatus::Completed,
                serde_json::json!({"summary": "ok"}),
            )
            .await
            .unwrap();

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.stages.len(), 1);
        assert_eq!(task.stages[0].status, StageStatus::Completed);
        assert!(task.stages[0].ended_at.is_some());
        assert!(task.stages[0].ended_at.unwrap() >= task.stages[0].started_at);
    }

    #[tokio::test]
    async fn finish_without_open_stage_errors() {
        let store = Store::in_memory();
        let task = Task::new(Uuid::new_v4());
        let task_id = task.id;
        store.create_task(task).await;

        let err = store
            .finish_stage(
                task_id,
                StageName::RunTests,
                StageStatus::Completed,
                serde_json::Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn usage_stats_aggregate_filtered_slice() {
        let store = Store::in_memory();
        let task_a = Uuid::new_v4();
        let task_b = Uuid::new_v4();
        let feedback_id = Uuid::new_v4();

        for (task_id, call_type, prompt, completion, success) in [
            (task_a, "analyze", 100, 50, true),
            (task_a, "plan", 200, 100, true),
            (task_b, "analyze", 400, 0, false),
        ] {
            store
                .record_token_usage(TokenUsage {
                    id: Uuid::new_v4(),
                    task_id,
                    feedback_id,
                    model: "test-model".into(),
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    call_type: call_type.into(),
                    timestamp: Utc::now(),
                    success,
                    error: None,
                })
                .await;
        }

        let stats = store
            .token_usage_stats(&UsageQuery {
                task_id: Some(task_a),
                ..Default::default()
            })
            .await;
        assert_eq!(stats.total_tokens, 450);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.by_call_type["analyze"], 150);
        assert_eq!(stats.by_call_type["plan"], 300);

        let all = store.token_usage_stats(&UsageQuery::default()).await;
        assert_eq!(all.failure_count, 1);
        assert_eq!(all.by_model["test-model"], 850);
    }

    #[tokio::test]
    async fn breaker_events_resolve_and_filter() {
        use mend_core::types::{BreakerDenial, BreakerSnapshot, CircuitState};

        let store = Store::in_memory();
        let snapshot = BreakerSnapshot {
            circuit: CircuitState::Closed,
            daily_tokens_used: 0,
            max_daily_tokens: 1000,
            daily_window_remaining_ms: 0,
            tasks_in_flight: 0,
            max_concurrent_tasks: 3,
            recent_denials: 1,
            open_remaining_ms: None,
        };
        let event = BreakerEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            service: "llm".into(),
            action: "analyze".into(),
            event_type: BreakerDenial::DailyLimit,
            usage: snapshot,
            task_id: None,
            resolved: false,
            resolution: None,
        };
        let event_id = event.id;
        store.record_breaker_event(event).await;

        let unresolved = store
            .list_breaker_events(&BreakerEventQuery {
                unresolved_only: true,
                ..Default::default()
            })
            .await;
        assert_eq!(unresolved.len(), 1);

        store
            .resolve_breaker_event(event_id, "daily window rolled")
            .await
            .unwrap();
        let unresolved = store
            .list_breaker_events(&BreakerEventQuery {
                unresolved_only: true,
                ..Default::default()
            })
            .await;
        assert!(unresolved.is_empty());
    }

    #[tokio::test]
    async fn retention_evicts_oldest() {
        let store = Store::in_memory().with_retention(Retention {
            feedback: 3,
            tasks: 3,
            token_usage: 3,
            breaker_events: 3,
        });
        let first = feedback("en");
        let first_id = first.id;
        store.create_feedback(first).await;
        for _ in 0..3 {
            store.create_feedback(feedback("en")).await;
        }
        assert!(store.get_feedback(first_id).await.is_none());
        assert_eq!(store.list_feedback(&FeedbackQuery::default()).await.total, 3);
    }
}
