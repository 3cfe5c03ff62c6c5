//! Domain records shared across the workspace.
//!
//! Field keys serialize camelCase because these records cross the HTTP and
//! database-file boundaries; enum values stay snake_case except for error
//! kinds, which are kebab-case on the wire (`quality-gate-failed`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Maximum feedback content length after clamping.
pub const MAX_FEEDBACK_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Analyzing,
    Generating,
    Modifying,
    Testing,
    Publishing,
    Completed,
    NeedsHuman,
    Failed,
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FeedbackStatus::Pending => "pending",
            FeedbackStatus::Analyzing => "analyzing",
            FeedbackStatus::Generating => "generating",
            FeedbackStatus::Modifying => "modifying",
            FeedbackStatus::Testing => "testing",
            FeedbackStatus::Publishing => "publishing",
            FeedbackStatus::Completed => "completed",
            FeedbackStatus::NeedsHuman => "needs_human",
            FeedbackStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

impl FeedbackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeedbackStatus::Completed | FeedbackStatus::NeedsHuman | FeedbackStatus::Failed
        )
    }
}

/// One unit of user input: a natural-language request to improve the
/// product. Created by ingress, mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: Uuid,
    pub user_id: String,
    pub content: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub status: FeedbackStatus,
    /// Terminal outcome, present once `status.is_terminal()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskOutcome>,
}

impl Feedback {
    /// Build a new pending feedback, clamping content to
    /// [`MAX_FEEDBACK_CHARS`] on a char boundary.
    pub fn new(content: impl Into<String>, user_id: impl Into<String>, language: impl Into<String>) -> Self {
        let mut content: String = content.into();
        if content.chars().count() > MAX_FEEDBACK_CHARS {
            content = content.chars().take(MAX_FEEDBACK_CHARS).collect();
        }
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            content,
            language: language.into(),
            created_at: Utc::now(),
            status: FeedbackStatus::Pending,
            result: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task & stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// One end-to-end run of the pipeline for a feedback. A retry of the whole
/// pipeline creates a new task; the in-task plan/test loop does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub feedback_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Append-only stage log in execution order.
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(feedback_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            feedback_id,
            created_at: Utc::now(),
            completed_at: None,
            status: TaskStatus::Running,
            stages: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    AnalyzeIntent,
    GenerateSolution,
    ApplyChanges,
    RunTests,
    GenerateChangelog,
    CreatePr,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageName::AnalyzeIntent => "analyze_intent",
            StageName::GenerateSolution => "generate_solution",
            StageName::ApplyChanges => "apply_changes",
            StageName::RunTests => "run_tests",
            StageName::GenerateChangelog => "generate_changelog",
            StageName::CreatePr => "create_pr",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// One step of a task. `data` holds the stage's payload record
/// ([`Analysis`], [`Plan`], [`ChangeSet`], [`TestReport`], [`Publication`])
/// serialized to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub name: StageName,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl StageRecord {
    pub fn started(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Started,
            started_at: Utc::now(),
            ended_at: None,
            data: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage payload records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Accuracy,
    Speed,
    Ui,
    Function,
    Language,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feasibility {
    Low,
    Medium,
    High,
}

/// Output of the analyze stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub intent: Intent,
    pub feasibility: Feasibility,
    pub priority: u8,
    pub impact: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Replace,
    Insert,
    Delete,
}

/// Output of the plan stage: a single-file change proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub file: String,
    pub action: PlanAction,
    pub code_block: String,
    pub description: String,
}

/// Output of the modify stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub branch: String,
    pub file: String,
    pub commit_hash: String,
    pub lines_added: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
}

/// Result of one executed browser test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate output of the test stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub passed: bool,
    pub tests_run: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub details: Vec<CaseResult>,
    /// Structured reason when the report failed for a non-case reason
    /// (missing browser, gate below minimum cases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TestReport {
    /// Report for an environment that cannot run tests at all.
    pub fn environment_failure(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            tests_run: 0,
            tests_passed: 0,
            tests_failed: 0,
            details: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn from_cases(details: Vec<CaseResult>) -> Self {
        let tests_run = details.len();
        let tests_passed = details
            .iter()
            .filter(|c| c.status == CaseStatus::Passed)
            .count();
        Self {
            passed: tests_passed == tests_run && tests_run > 0,
            tests_run,
            tests_passed,
            tests_failed: tests_run - tests_passed,
            details,
            reason: None,
        }
    }
}

/// An opaque record of a published change proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrRecord {
    pub url: String,
    pub number: u64,
    pub branch: String,
    pub title: String,
    pub body: String,
    /// Which adapter produced the record (`github` or `recorded`). A
    /// `recorded` PR exists only in the store.
    pub provider: String,
}

/// Output of the publish stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    pub changelog: String,
    pub pr: PrRecord,
}

// ---------------------------------------------------------------------------
// Terminal outcome
// ---------------------------------------------------------------------------

/// What a finished pipeline produced, carried on the final `complete`
/// event and stored on the feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub needs_human: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrRecord>,
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Classification of pipeline failures, kebab-case on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    BreakerBlocked,
    ModelTransient,
    WorkspaceError,
    QualityGateFailed,
    TestEnvironmentMissing,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::BreakerBlocked => "breaker-blocked",
            ErrorKind::ModelTransient => "model-transient",
            ErrorKind::WorkspaceError => "workspace-error",
            ErrorKind::QualityGateFailed => "quality-gate-failed",
            ErrorKind::TestEnvironmentMissing => "test-environment-missing",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// One external-model call, success or failure. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub id: Uuid,
    pub task_id: Uuid,
    pub feedback_id: Uuid,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub call_type: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ---------------------------------------------------------------------------
// Breaker records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerDenial {
    CircuitOpen,
    DailyLimit,
    TaskLimit,
    ConcurrencyLimit,
    MaxRetries,
}

impl fmt::Display for BreakerDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerDenial::CircuitOpen => "circuit_open",
            BreakerDenial::DailyLimit => "daily_limit",
            BreakerDenial::TaskLimit => "task_limit",
            BreakerDenial::ConcurrencyLimit => "concurrency_limit",
            BreakerDenial::MaxRetries => "max_retries",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker, attached to denial records and
/// served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub circuit: CircuitState,
    pub daily_tokens_used: u64,
    pub max_daily_tokens: u64,
    pub daily_window_remaining_ms: u64,
    pub tasks_in_flight: usize,
    pub max_concurrent_tasks: usize,
    pub recent_denials: usize,
    /// Milliseconds until an open circuit admits a probe; absent unless
    /// the circuit is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_remaining_ms: Option<u64>,
}

/// One admission decision other than "allowed". Append-only except for
/// the resolution fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub action: String,
    pub event_type: BreakerDenial,
    pub usage: BreakerSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_clamps_long_content() {
        let long = "x".repeat(500);
        let feedback = Feedback::new(long, "user-1", "en");
        assert_eq!(feedback.content.chars().count(), MAX_FEEDBACK_CHARS);
        assert_eq!(feedback.status, FeedbackStatus::Pending);
    }

    #[test]
    fn feedback_clamp_respects_char_boundaries() {
        // Multi-byte content must not be split mid-character.
        let long = "语".repeat(400);
        let feedback = Feedback::new(long, "user-1", "zh");
        assert_eq!(feedback.content.chars().count(), MAX_FEEDBACK_CHARS);
    }

    #[test]
    fn terminal_statuses() {
        assert!(FeedbackStatus::Completed.is_terminal());
        assert!(FeedbackStatus::NeedsHuman.is_terminal());
        assert!(FeedbackStatus::Failed.is_terminal());
        assert!(!FeedbackStatus::Testing.is_terminal());
    }

    #[test]
    fn error_kind_wire_format_is_kebab() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::QualityGateFailed).unwrap(),
            "\"quality-gate-failed\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::BreakerBlocked).unwrap(),
            "\"breaker-blocked\""
        );
        assert_eq!(ErrorKind::TestEnvironmentMissing.to_string(), "test-environment-missing");
    }

    #[test]
    fn test_report_from_cases_aggregates() {
        let report = TestReport::from_cases(vec![
            CaseResult {
                name: "a".into(),
                status: CaseStatus::Passed,
                error: None,
            },
            CaseResult {
                name: "b".into(),
                status: CaseStatus::Failed,
                error: Some("expected text missing".into()),
            },
        ]);
        assert!(!report.passed);
        assert_eq!(report.tests_run, 2);
        assert_eq!(report.tests_passed, 1);
        assert_eq!(report.tests_failed, 1);
    }

    #[test]
    fn empty_case_list_does_not_pass() {
        let report = TestReport::from_cases(vec![]);
        assert!(!report.passed);
        assert_eq!(report.tests_run, 0);
    }

    #[test]
    fn record_keys_are_camel_case() {
        let feedback = Feedback::new("slow page", "u", "en");
        let value = serde_json::to_value(&feedback).unwrap();
        assert!(value.get("userId").is_some());
        assert!(value.get("createdAt").is_some());

        let usage = TokenUsage {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            feedback_id: Uuid::new_v4(),
            model: "m".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            call_type: "analyze".into(),
            timestamp: Utc::now(),
            success: true,
            error: None,
        };
        let value = serde_json::to_value(&usage).unwrap();
        assert!(value.get("promptTokens").is_some());
        assert!(value.get("callType").is_some());
        assert_eq!(usage.total_tokens(), 15);
    }

    #[test]
    fn feasibility_orders_low_to_high() {
        assert!(Feasibility::Low < Feasibility::Medium);
        assert!(Feasibility::Medium < Feasibility::High);
    }

    #[test]
    fn task_serialization_roundtrip() {
        let mut task = Task::new(Uuid::new_v4());
        task.stages.push(StageRecord::started(StageName::AnalyzeIntent));
        let json = serde_json::to_string(&task).unwrap();
        let deser: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(deser.status, TaskStatus::Running);
        assert_eq!(deser.stages.len(), 1);
        assert_eq!(deser.stages[0].name, StageName::AnalyzeIntent);
    }
}
