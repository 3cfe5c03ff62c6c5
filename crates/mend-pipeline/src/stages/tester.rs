use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use mend_core::types::{ErrorKind, StageName};
use mend_harness::TokenBreaker;
use mend_model::{CallOptions, ChatMessage, ModelClient};

use crate::events::TaskEvent;
use crate::qa::{TestCase, TestHarness};
use crate::stages::{parse_payload, StageCx, StageError, StageService};

const GENERATE_PROMPT: &str = "You write browser smoke tests for a just-applied code change. \
Reply with a JSON array of 3 to 5 cases: \
[{\"name\": \"<short name>\", \"path\": \"/<url path>\", \"expect\": \"<text the page must contain>\"}].";

const ASSESS_PROMPT: &str = "Rate how well the change satisfies the feedback on a 0.0-1.0 scale. \
Reply with one JSON object: {\"score\": <number>}.";

#[derive(Deserialize)]
struct Assessment {
    score: f32,
}

/// Generates test cases from the applied plan, executes them against the
/// browser harness, and applies the quality gate. A failed gate charges
/// the task's retry budget and reports whether another round is allowed.
pub struct Tester {
    model: ModelClient,
    harness: TestHarness,
    breaker: TokenBreaker,
}

impl Tester {
    pub fn new(model: ModelClient, harness: TestHarness, breaker: TokenBreaker) -> Self {
        Self {
            model,
            harness,
            breaker,
        }
    }

    async fn generate_cases(&self, cx: &StageCx) -> Result<Vec<TestCase>, StageError> {
        let plan = cx.data.plan.as_ref().ok_or_else(|| {
            StageError::new(ErrorKind::ModelTransient, "tester invoked without a plan")
        })?;
        let messages = [
            ChatMessage::system(GENERATE_PROMPT),
            ChatMessage::user(format!(
                "Feedback: {}\nChanged file: {}\nChange description: {}",
                cx.content, plan.file, plan.description
            )),
        ];
        let opts =
            CallOptions::new(cx.task_id, cx.feedback_id, "generate_tests").with_max_tokens(1024);
        let reply = self.model.call(&messages, &opts).await?;
        parse_payload(&reply.content)
    }

    /// Optional model-assessed quality score. Scoring trouble degrades to
    /// `None` rather than failing the stage; the gate decides what a
    /// missing score means.
    async fn assess_score(&self, cx: &StageCx) -> Option<f32> {
        if self.harness.gate.min_score.is_none() {
            return None;
        }
        let messages = [
            ChatMessage::system(ASSESS_PROMPT),
            ChatMessage::user(format!("Feedback: {}", cx.content)),
        ];
        let opts =
            CallOptions::new(cx.task_id, cx.feedback_id, "assess_quality").with_max_tokens(128);
        match self.model.call(&messages, &opts).await {
            Ok(reply) => parse_payload::<Assessment>(&reply.content)
                .ok()
                .map(|a| a.score),
            Err(e) => {
                warn!(task_id = %cx.task_id, error = %e, "quality assessment unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl StageService for Tester {
    fn name(&self) -> StageName {
        StageName::RunTests
    }

    async fn run(&self, cx: &mut StageCx) -> Result<(), StageError> {
        cx.begin(self.name()).await?;

        let cases = match self.generate_cases(cx).await {
            Ok(cases) => cases,
            Err(err) => {
                cx.fail(self.name(), &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };

        let events = cx.events.clone();
        let mut report = self
            .harness
            .run_cases(&cases, |current, total, name| {
                events.emit(TaskEvent::TestProgress {
                    current,
                    total,
                    name: name.to_string(),
                });
            })
            .await;

        let score = self.assess_score(cx).await;

        match self.harness.gate.evaluate(&report, score) {
            Ok(()) => {
                info!(task_id = %cx.task_id, cases = report.tests_run, "quality gate passed");
                cx.complete(self.name(), &report).await?;
                cx.emit(TaskEvent::TestResult {
                    report: report.clone(),
                });
                cx.data.report = Some(report);
                Ok(())
            }
            Err(reason) => {
                report.passed = false;
                report.reason = Some(reason.clone());

                cx.fail(self.name(), &report).await?;
                cx.emit(TaskEvent::TestResult {
                    report: report.clone(),
                });
                cx.data.report = Some(report);

                let can_retry = self.breaker.increment_retry(cx.task_id).await;
                warn!(
                    task_id = %cx.task_id,
                    attempt = cx.attempt,
                    can_retry,
                    reason = %reason,
                    "quality gate failed"
                );
                Err(StageError {
                    kind: ErrorKind::QualityGateFailed,
                    message: reason,
                    retryable: can_retry,
                })
            }
        }
    }
}
