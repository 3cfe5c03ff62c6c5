use async_trait::async_trait;
use tracing::info;

use mend_core::types::{ErrorKind, Plan, StageName};
use mend_model::{CallOptions, ChatMessage, ModelClient};

use crate::events::TaskEvent;
use crate::stages::{parse_payload, StageCx, StageError, StageService};

const SYSTEM_PROMPT: &str = "You turn an analyzed feedback into one concrete code change. \
Reply with one JSON object: {\"file\": \"<relative path>\", \
\"action\": \"replace\"|\"insert\"|\"delete\", \"codeBlock\": \"<the code>\", \
\"description\": \"<one sentence>\"}.";

/// Lines of the proposed code streamed per `code_chunk` event.
const CHUNK_LINES: usize = 8;

/// Produces a single-file change proposal from the analysis. Re-runs on
/// the retry back-edge with the previous failure attached.
pub struct Planner {
    model: ModelClient,
}

impl Planner {
    pub fn new(model: ModelClient) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StageService for Planner {
    fn name(&self) -> StageName {
        StageName::GenerateSolution
    }

    async fn run(&self, cx: &mut StageCx) -> Result<(), StageError> {
        let analysis = cx.data.analysis.clone().ok_or_else(|| {
            StageError::new(ErrorKind::ModelTransient, "planner invoked without analysis")
        })?;

        cx.begin(self.name()).await?;

        let mut user = format!(
            "Feedback: {}\nIntent: {:?}\nSummary: {}",
            cx.content, analysis.intent, analysis.summary
        );
        if cx.attempt > 0 {
            let failure = cx
                .data
                .report
                .as_ref()
                .map(|r| format!("{}/{} tests passed", r.tests_passed, r.tests_run))
                .unwrap_or_else(|| "tests failed".into());
            user.push_str(&format!(
                "\nPrevious attempt {} failed its tests ({failure}). Propose a different fix.",
                cx.attempt
            ));
        }

        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)];
        let opts = CallOptions::new(cx.task_id, cx.feedback_id, "plan").with_max_tokens(2048);

        let reply = match self.model.call(&messages, &opts).await {
            Ok(reply) => reply,
            Err(e) => {
                let err = StageError::from(e);
                cx.fail(self.name(), &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };

        let plan: Plan = match parse_payload(&reply.content) {
            Ok(plan) => plan,
            Err(err) => {
                cx.fail(self.name(), &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };

        info!(task_id = %cx.task_id, file = %plan.file, action = ?plan.action, "plan generated");

        // Stream the proposed code before the structured suggestion, the
        // way a subscriber watches it being written.
        let lines: Vec<&str> = plan.code_block.lines().collect();
        for chunk in lines.chunks(CHUNK_LINES) {
            cx.emit(TaskEvent::CodeChunk {
                content: chunk.join("\n"),
            });
        }

        cx.complete(self.name(), &plan).await?;
        cx.emit(TaskEvent::Suggestion { plan: plan.clone() });
        cx.data.plan = Some(plan);
        Ok(())
    }
}
