use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use mend_core::ids;
use mend_core::types::{ChangeSet, ErrorKind, Plan, PlanAction, StageName};
use mend_harness::TokenBreaker;
use mend_workspace::{Workspace, WriteMode};

use crate::stages::{StageCx, StageError, StageService};

/// Wall-clock guard around the whole git sequence.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Applies a plan to the shared working tree: ensure → snapshot → branch →
/// write → commit, all under the workspace mutex. On a retry round the
/// tree is first restored to the latest pre-modification snapshot so every
/// attempt starts from the same baseline.
pub struct Modifier {
    workspace: Arc<Workspace>,
    breaker: TokenBreaker,
}

impl Modifier {
    pub fn new(workspace: Arc<Workspace>, breaker: TokenBreaker) -> Self {
        Self { workspace, breaker }
    }
}

#[async_trait]
impl StageService for Modifier {
    fn name(&self) -> StageName {
        StageName::ApplyChanges
    }

    async fn run(&self, cx: &mut StageCx) -> Result<(), StageError> {
        let plan = cx.data.plan.clone().ok_or_else(|| {
            StageError::new(ErrorKind::WorkspaceError, "modifier invoked without a plan")
        })?;

        // Workspace mutation consumes no tokens but still honors the
        // circuit: an open breaker stops the pipeline before git runs.
        let decision = self
            .breaker
            .check("workspace", "apply_changes", 0, Some(cx.task_id))
            .await;
        if !decision.allowed {
            let reason = decision
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "denied".into());
            return Err(StageError::new(
                ErrorKind::BreakerBlocked,
                format!("workspace mutation blocked: {reason}"),
            ));
        }

        cx.begin(self.name()).await?;

        let workspace = self.workspace.clone();
        let attempt = cx.attempt;
        let mut branch = ids::branch_name(&cx.feedback_id);
        if attempt > 0 {
            branch.push_str(&format!("-r{attempt}"));
        }

        let apply = tokio::task::spawn_blocking(move || apply_plan(&workspace, &plan, &branch, attempt));
        let outcome = match tokio::time::timeout(GIT_TIMEOUT, apply).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StageError::new(
                ErrorKind::WorkspaceError,
                format!("modifier worker failed: {join_err}"),
            )),
            Err(_) => Err(StageError::new(
                ErrorKind::WorkspaceError,
                format!("git sequence exceeded {GIT_TIMEOUT:?}"),
            )),
        };

        match outcome {
            Ok(change_set) => {
                info!(
                    task_id = %cx.task_id,
                    branch = %change_set.branch,
                    commit = %change_set.commit_hash,
                    "changes applied"
                );
                cx.complete(self.name(), &change_set).await?;
                cx.data.change_set = Some(change_set);
                Ok(())
            }
            Err(err) => {
                cx.fail(self.name(), &serde_json::json!({ "error": err.message }))
                    .await?;
                Err(err)
            }
        }
    }
}

fn apply_plan(
    workspace: &Workspace,
    plan: &Plan,
    branch: &str,
    attempt: u32,
) -> Result<ChangeSet, StageError> {
    let to_stage_error =
        |e: mend_workspace::WorkspaceError| StageError::new(ErrorKind::WorkspaceError, e.to_string());

    let mut guard = workspace.lock();
    guard.ensure().map_err(to_stage_error)?;

    if attempt > 0 {
        if let Some(snapshot) = guard.latest_snapshot() {
            guard.restore(snapshot).map_err(to_stage_error)?;
        }
    }
    guard
        .snapshot(&format!("pre-modification-{branch}"))
        .map_err(to_stage_error)?;

    guard.checkout_new_branch(branch).map_err(to_stage_error)?;

    let lines_added = match plan.action {
        PlanAction::Replace => guard
            .write_file(&plan.file, &plan.code_block, WriteMode::Replace)
            .map_err(to_stage_error)?,
        PlanAction::Insert => guard
            .write_file(&plan.file, &plan.code_block, WriteMode::Insert)
            .map_err(to_stage_error)?,
        PlanAction::Delete => {
            guard.remove_file(&plan.file).map_err(to_stage_error)?;
            0
        }
    };

    let commit_hash = guard
        .commit(&format!("fix: {}", plan.description))
        .map_err(to_stage_error)?;

    Ok(ChangeSet {
        branch: branch.to_string(),
        file: plan.file.clone(),
        commit_hash,
        lines_added,
    })
}
