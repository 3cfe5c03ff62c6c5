use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use mend_core::types::{ErrorKind, Publication, StageName};
use mend_model::{CallOptions, ChatMessage, ModelClient};

use crate::events::TaskEvent;
use crate::publish::{PrGateway, PrRequest};
use crate::stages::{StageCx, StageError, StageService};

const CHANGELOG_PROMPT: &str = "Write a short markdown changelog entry for the change below. \
Two to four bullet points, no heading.";

/// Synthesizes a changelog and publishes the branch as a pull request
/// through the configured gateway. Writes two stage rows: one per step.
pub struct Publisher {
    model: ModelClient,
    gateway: Arc<dyn PrGateway>,
    base_branch: String,
}

impl Publisher {
    pub fn new(model: ModelClient, gateway: Arc<dyn PrGateway>) -> Self {
        Self {
            model,
            gateway,
            base_branch: "main".into(),
        }
    }
}

#[async_trait]
impl StageService for Publisher {
    fn name(&self) -> StageName {
        StageName::GenerateChangelog
    }

    async fn run(&self, cx: &mut StageCx) -> Result<(), StageError> {
        let change_set = cx.data.change_set.clone().ok_or_else(|| {
            StageError::new(ErrorKind::WorkspaceError, "publisher invoked without changes")
        })?;
        let plan = cx.data.plan.clone().ok_or_else(|| {
            StageError::new(ErrorKind::WorkspaceError, "publisher invoked without a plan")
        })?;

        // Step one: changelog.
        cx.begin(StageName::GenerateChangelog).await?;
        let messages = [
            ChatMessage::system(CHANGELOG_PROMPT),
            ChatMessage::user(format!(
                "Feedback: {}\nFile: {}\nDescription: {}",
                cx.content, change_set.file, plan.description
            )),
        ];
        let opts = CallOptions::new(cx.task_id, cx.feedback_id, "changelog").with_max_tokens(512);
        let changelog = match self.model.call(&messages, &opts).await {
            Ok(reply) => reply.content.trim().to_string(),
            Err(e) => {
                let err = StageError::from(e);
                cx.fail(StageName::GenerateChangelog, &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };
        cx.complete(
            StageName::GenerateChangelog,
            &serde_json::json!({ "changelog": changelog }),
        )
        .await?;

        // Step two: pull request.
        cx.begin(StageName::CreatePr).await?;
        let request = PrRequest {
            branch: change_set.branch.clone(),
            base: self.base_branch.clone(),
            title: format!("fix: {}", plan.description),
            body: changelog.clone(),
        };
        let pr = match self.gateway.open_pr(&request).await {
            Ok(pr) => pr,
            Err(e) => {
                let err = StageError::new(
                    ErrorKind::WorkspaceError,
                    format!("pull request creation failed: {e}"),
                );
                cx.fail(StageName::CreatePr, &serde_json::json!({ "error": err.message }))
                    .await?;
                return Err(err);
            }
        };

        info!(task_id = %cx.task_id, pr = %pr.url, "change published");
        cx.complete(StageName::CreatePr, &pr).await?;
        cx.emit(TaskEvent::Pr { pr: pr.clone() });
        cx.data.publication = Some(Publication { changelog, pr });
        Ok(())
    }
}
