use async_trait::async_trait;
use tracing::info;

use mend_core::types::{Analysis, StageName};
use mend_model::{CallOptions, ChatMessage, ModelClient};

use crate::events::TaskEvent;
use crate::stages::{parse_payload, StageCx, StageError, StageService};

const SYSTEM_PROMPT: &str = "You analyze user feedback about a web product. \
Reply with one JSON object: {\"intent\": \"accuracy\"|\"speed\"|\"ui\"|\"function\"|\"language\"|\"other\", \
\"feasibility\": \"high\"|\"medium\"|\"low\", \"priority\": 1-5, \
\"impact\": \"<one sentence>\", \"summary\": \"<one sentence>\"}. \
Feasibility low means the request needs a human decision.";

/// Classifies a feedback: what the user wants, and whether the pipeline
/// can act on it without a human.
pub struct Analyzer {
    model: ModelClient,
}

impl Analyzer {
    pub fn new(model: ModelClient) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StageService for Analyzer {
    fn name(&self) -> StageName {
        StageName::AnalyzeIntent
    }

    async fn run(&self, cx: &mut StageCx) -> Result<(), StageError> {
        cx.begin(self.name()).await?;

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Feedback (language tag {}): {}",
                cx.language, cx.content
            )),
        ];
        let opts = CallOptions::new(cx.task_id, cx.feedback_id, "analyze").with_max_tokens(512);

        let reply = match self.model.call(&messages, &opts).await {
            Ok(reply) => reply,
            Err(e) => {
                let err = StageError::from(e);
                cx.fail(self.name(), &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };

        let analysis: Analysis = match parse_payload(&reply.content) {
            Ok(analysis) => analysis,
            Err(err) => {
                cx.fail(self.name(), &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };

        info!(
            task_id = %cx.task_id,
            intent = ?analysis.intent,
            feasibility = ?analysis.feasibility,
            "feedback analyzed"
        );
        cx.complete(self.name(), &analysis).await?;
        cx.emit(TaskEvent::Intent {
            analysis: analysis.clone(),
        });
        cx.data.analysis = Some(analysis);
        Ok(())
    }
}
