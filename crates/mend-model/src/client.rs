use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use mend_core::config::ModelConfig;
use mend_core::types::{BreakerDenial, TokenUsage};
use mend_harness::TokenBreaker;
use mend_store::Store;

use crate::provider::{ChatMessage, ChatParams, LlmProvider, ProviderError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The breaker refused admission; the call never left the process.
    #[error("breaker blocked: {reason}")]
    BreakerBlocked { reason: BreakerDenial },

    /// Timeout, network failure, 5xx, or rate limiting.
    #[error("transient model failure: {0}")]
    Transient(String),

    /// The vendor rejected the request or returned an unusable body.
    #[error("model call failed: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Options & reply
// ---------------------------------------------------------------------------

/// Per-call options. `max_tokens` doubles as the breaker's token estimate.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub task_id: Uuid,
    pub feedback_id: Uuid,
    pub call_type: &'static str,
}

impl CallOptions {
    pub fn new(task_id: Uuid, feedback_id: Uuid, call_type: &'static str) -> Self {
        Self {
            model: None,
            temperature: 0.2,
            max_tokens: 1024,
            task_id,
            feedback_id,
            call_type,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl ModelReply {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ---------------------------------------------------------------------------
// ModelClient
// ---------------------------------------------------------------------------

/// Breaker-guarded model access. Every call:
///
/// 1. asks the breaker for admission (estimate = `max_tokens`),
/// 2. runs the provider under a hard timeout,
/// 3. appends a token-usage row — success or failure — and
/// 4. releases the reservation with the actual spend.
#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
    breaker: TokenBreaker,
    store: Arc<Store>,
    default_model: String,
    timeout: Duration,
}

impl ModelClient {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        breaker: TokenBreaker,
        store: Arc<Store>,
        config: &ModelConfig,
    ) -> Self {
        Self {
            provider,
            breaker,
            store,
            default_model: config.model.clone(),
            timeout: config.timeout,
        }
    }

    pub async fn call(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
    ) -> Result<ModelReply, ModelError> {
        let decision = self
            .breaker
            .check("llm", opts.call_type, u64::from(opts.max_tokens), Some(opts.task_id))
            .await;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or(BreakerDenial::CircuitOpen);
            warn!(task_id = %opts.task_id, call_type = opts.call_type, %reason, "model call blocked");
            return Err(ModelError::BreakerBlocked { reason });
        }

        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        let params = ChatParams {
            model: model.clone(),
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
        };

        let outcome = tokio::time::timeout(self.timeout, self.provider.complete(messages, &params))
            .await
            .map_err(|_| ProviderError::Timeout)
            .and_then(|r| r);

        match outcome {
            Ok(reply) => {
                let actual = reply.prompt_tokens + reply.completion_tokens;
                self.record_usage(opts, &reply.model, reply.prompt_tokens, reply.completion_tokens, None)
                    .await;
                self.breaker.release(opts.task_id, actual, true).await;
                debug!(
                    task_id = %opts.task_id,
                    call_type = opts.call_type,
                    tokens = actual,
                    "model call completed"
                );
                Ok(ModelReply {
                    content: reply.content,
                    model: reply.model,
                    prompt_tokens: reply.prompt_tokens,
                    completion_tokens: reply.completion_tokens,
                })
            }
            Err(e) => {
                self.record_usage(opts, &model, 0, 0, Some(e.to_string())).await;
                self.breaker.release(opts.task_id, 0, false).await;
                if e.is_transient() {
                    Err(ModelError::Transient(e.to_string()))
                } else {
                    Err(ModelError::Failed(e.to_string()))
                }
            }
        }
    }

    async fn record_usage(
        &self,
        opts: &CallOptions,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        error: Option<String>,
    ) {
        self.store
            .record_token_usage(TokenUsage {
                id: Uuid::new_v4(),
                task_id: opts.task_id,
                feedback_id: opts.feedback_id,
                model: model.to_string(),
                prompt_tokens,
                completion_tokens,
                call_type: opts.call_type.to_string(),
                timestamp: Utc::now(),
                success: error.is_none(),
                error,
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
