//! Ingress: validate a submission, open its event stream, and launch the
//! pipeline in the background.
//!
//! The returned receiver is the subscriber's handle; dropping it never
//! cancels the run — the pipeline always reaches its own terminal state.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use mend_core::types::{Feedback, Task};
use mend_store::Store;

use crate::events::{task_channel, EventReceiver, DEFAULT_EVENT_CAPACITY};
use crate::orchestrator::Orchestrator;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("content must not be empty")]
    EmptyContent,
}

/// An accepted submission: the ids plus the live event stream.
pub struct Submission {
    pub feedback_id: Uuid,
    pub task_id: Uuid,
    pub events: EventReceiver,
}

pub struct Ingress {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
}

impl Ingress {
    pub fn new(store: Arc<Store>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Validate, persist, and launch. Content is clamped to the feedback
    /// length limit; empty or whitespace-only content is rejected before
    /// any row is written.
    pub async fn submit(
        &self,
        content: &str,
        user_id: Option<String>,
        language: Option<String>,
    ) -> Result<Submission, ValidationError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }

        let feedback = Feedback::new(
            content,
            user_id.unwrap_or_else(|| "anonymous".into()),
            language.unwrap_or_else(|| "en".into()),
        );
        let task = Task::new(feedback.id);
        let feedback_id = feedback.id;
        let task_id = task.id;

        self.store.create_feedback(feedback.clone()).await;
        self.store.create_task(task.clone()).await;

        let (tx, rx) = task_channel(DEFAULT_EVENT_CAPACITY);
        info!(%feedback_id, %task_id, "feedback accepted");
        tokio::spawn(self.orchestrator.clone().run(feedback, task, tx));

        Ok(Submission {
            feedback_id,
            task_id,
            events: rx,
        })
    }
}
