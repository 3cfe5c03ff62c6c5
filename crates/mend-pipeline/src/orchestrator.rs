//! Runs one feedback through the fixed pipeline with its single back-edge:
//!
//! analyze → (low feasibility → human handoff)
//!         → plan → modify → test
//!                            ├─ passed → publish → done
//!                            └─ failed → retry budget left? re-plan : handoff
//!
//! Policy lives here and nowhere else: stages never call each other, and
//! no stage runs twice except through the retry loop.

use std::sync::Arc;

use tracing::{error, info, warn};

use mend_core::types::{
    ErrorKind, Feasibility, Feedback, FeedbackStatus, Task, TaskOutcome, TaskStatus,
};
use mend_harness::{ShutdownSignal, TokenBreaker};
use mend_model::ModelClient;
use mend_store::Store;
use mend_workspace::Workspace;

use crate::events::{EventSender, TaskEvent};
use crate::publish::PrGateway;
use crate::qa::TestHarness;
use crate::stages::{
    Analyzer, Modifier, PipelineData, Planner, Publisher, StageCx, StageError, StageService,
    Tester,
};

enum Exit {
    Completed(TaskOutcome),
    NeedsHuman(TaskOutcome),
    RetriesExhausted(String),
    Failed(StageError),
    Cancelled,
}

pub struct Orchestrator {
    store: Arc<Store>,
    breaker: TokenBreaker,
    shutdown: ShutdownSignal,
    analyzer: Analyzer,
    planner: Planner,
    modifier: Modifier,
    tester: Tester,
    publisher: Publisher,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        breaker: TokenBreaker,
        model: ModelClient,
        workspace: Arc<Workspace>,
        harness: TestHarness,
        gateway: Arc<dyn PrGateway>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            analyzer: Analyzer::new(model.clone()),
            planner: Planner::new(model.clone()),
            modifier: Modifier::new(workspace, breaker.clone()),
            tester: Tester::new(model.clone(), harness, breaker.clone()),
            publisher: Publisher::new(model, gateway),
            store,
            breaker,
            shutdown,
        }
    }

    /// Drive one task to its terminal state. Always emits the final event
    /// pair (`complete` or `error`, then `done`), always writes matching
    /// terminal rows, and always frees the task's breaker slot.
    pub async fn run(self: Arc<Self>, feedback: Feedback, task: Task, events: EventSender) {
        let task_id = task.id;
        let feedback_id = feedback.id;

        events.emit(TaskEvent::Connected {
            task_id,
            feedback_id,
        });

        let mut cx = StageCx {
            task_id,
            feedback_id,
            content: feedback.content.clone(),
            language: feedback.language.clone(),
            attempt: 0,
            store: self.store.clone(),
            events: events.clone(),
            data: PipelineData::default(),
        };

        let exit = self.drive(&mut cx).await;

        let (feedback_status, task_status, task_error, final_event) = match exit {
            Exit::Completed(outcome) => {
                info!(%task_id, "pipeline completed");
                (
                    FeedbackStatus::Completed,
                    TaskStatus::Completed,
                    None,
                    TaskEvent::Complete { result: outcome },
                )
            }
            Exit::NeedsHuman(outcome) => {
                info!(%task_id, "pipeline handed off to a human");
                (
                    FeedbackStatus::NeedsHuman,
                    TaskStatus::Completed,
                    None,
                    TaskEvent::Complete { result: outcome },
                )
            }
            Exit::RetriesExhausted(message) => {
                warn!(%task_id, %message, "retry budget exhausted");
                (
                    FeedbackStatus::NeedsHuman,
                    TaskStatus::Failed,
                    Some(message.clone()),
                    TaskEvent::Error {
                        kind: ErrorKind::QualityGateFailed,
                        message,
                    },
                )
            }
            Exit::Failed(e) => {
                error!(%task_id, kind = %e.kind, message = %e.message, "pipeline failed");
                (
                    FeedbackStatus::Failed,
                    TaskStatus::Failed,
                    Some(e.message.clone()),
                    TaskEvent::Error {
                        kind: e.kind,
                        message: e.message,
                    },
                )
            }
            Exit::Cancelled => {
                warn!(%task_id, "pipeline aborted by shutdown");
                (
                    FeedbackStatus::Failed,
                    TaskStatus::Aborted,
                    Some("aborted by shutdown".into()),
                    TaskEvent::Error {
                        kind: ErrorKind::Cancelled,
                        message: "aborted by shutdown".into(),
                    },
                )
            }
        };

        let result = match &final_event {
            TaskEvent::Complete { result } => Some(result.clone()),
            _ => None,
        };
        if let Err(e) = self
            .store
            .update_feedback_status(feedback_id, feedback_status, result)
            .await
        {
            warn!(%feedback_id, error = %e, "terminal feedback write failed");
        }
        if let Err(e) = self
            .store
            .update_task_status(task_id, task_status, task_error)
            .await
        {
            warn!(%task_id, error = %e, "terminal task write failed");
        }

        events.emit(final_event);
        events.emit(TaskEvent::Done);

        // The reservation slot must come back on every exit path.
        self.breaker.release_task(task_id).await;
    }

    async fn drive(&self, cx: &mut StageCx) -> Exit {
        if let Err(e) = self.exec(&self.analyzer, FeedbackStatus::Analyzing, cx).await {
            return Self::exit_from(e);
        }
        let Some(analysis) = cx.data.analysis.clone() else {
            return Self::exit_from(StageError::new(
                ErrorKind::ModelTransient,
                "analyzer produced no analysis",
            ));
        };

        if analysis.feasibility == Feasibility::Low {
            return Exit::NeedsHuman(TaskOutcome {
                needs_human: true,
                summary: analysis.summary.clone(),
                analysis: Some(analysis),
                pr: None,
            });
        }

        loop {
            if let Err(e) = self.exec(&self.planner, FeedbackStatus::Generating, cx).await {
                return Self::exit_from(e);
            }
            if let Err(e) = self.exec(&self.modifier, FeedbackStatus::Modifying, cx).await {
                return Self::exit_from(e);
            }
            match self.exec(&self.tester, FeedbackStatus::Testing, cx).await {
                Ok(()) => break,
                Err(e) if e.kind == ErrorKind::QualityGateFailed && e.retryable => {
                    cx.attempt += 1;
                    info!(task_id = %cx.task_id, attempt = cx.attempt, "re-planning after failed tests");
                }
                Err(e) if e.kind == ErrorKind::QualityGateFailed => {
                    return Exit::RetriesExhausted(e.message);
                }
                Err(e) => return Self::exit_from(e),
            }
        }

        if let Err(e) = self.exec(&self.publisher, FeedbackStatus::Publishing, cx).await {
            return Self::exit_from(e);
        }

        Exit::Completed(TaskOutcome {
            needs_human: false,
            summary: analysis.summary.clone(),
            analysis: Some(analysis),
            pr: cx.data.publication.as_ref().map(|p| p.pr.clone()),
        })
    }

    /// Advance the feedback's phase, announce the stage, and run the
    /// service — racing the shutdown signal so cancellation is observed at
    /// every stage boundary and suspension point.
    async fn exec(
        &self,
        service: &dyn StageService,
        phase: FeedbackStatus,
        cx: &mut StageCx,
    ) -> Result<(), StageError> {
        if self.shutdown.is_shutting_down() {
            return Err(StageError::new(ErrorKind::Cancelled, "shutdown in progress"));
        }
        if let Err(e) = self
            .store
            .update_feedback_status(cx.feedback_id, phase, None)
            .await
        {
            return Err(StageError::new(
                ErrorKind::WorkspaceError,
                format!("store: {e}"),
            ));
        }
        cx.emit(TaskEvent::Stage { phase });

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            result = service.run(cx) => result,
            _ = shutdown.recv() => {
                Err(StageError::new(ErrorKind::Cancelled, "shutdown in progress"))
            }
        }
    }

    fn exit_from(e: StageError) -> Exit {
        if e.kind == ErrorKind::Cancelled {
            Exit::Cancelled
        } else {
            Exit::Failed(e)
        }
    }
}
