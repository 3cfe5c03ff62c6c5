use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Connection failure, DNS, TLS, and friends.
    #[error("http error: {0}")]
    Http(String),

    /// Non-success status from the vendor.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected schema.
    #[error("parse error: {0}")]
    Parse(String),

    /// HTTP 429 from the vendor.
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

impl ProviderError {
    /// Whether the failure is transient (network, timeout, 5xx, 429) as
    /// opposed to a caller bug (4xx, schema mismatch).
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout | ProviderError::RateLimited { .. } => {
                true
            }
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Parse(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message author. The serde rename is the wire format; nothing else
/// needs the strings, so there is no separate formatting path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A completed vendor call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Request parameters a provider needs beyond the messages themselves.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatReply, ProviderError>;
}

// ---------------------------------------------------------------------------
// HttpProvider — OpenAI-compatible chat completions over HTTPS
// ---------------------------------------------------------------------------

/// Provider for any vendor exposing the `/v1/chat/completions` protocol
/// with bearer-token auth. The base URL is overridable so tests can point
/// at a local server.
pub struct HttpProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

/// Wire shape of one completion request. `ChatMessage` already serializes
/// to the vendor's message format, so the whole request is a borrow — no
/// per-message translation step.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: &'a [ChatMessage],
}

impl HttpProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Seconds from a `Retry-After` header, if the vendor sent a usable one.
/// Date-formatted values are ignored rather than guessed at.
fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    model: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Default, Deserialize)]
struct ApiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl ApiResponse {
    /// Fold the vendor body into a [`ChatReply`]. Servers that omit the
    /// model or usage blocks get the requested model and zero counts; a
    /// body with no choices is unusable.
    fn into_reply(self, requested_model: &str) -> Result<ChatReply, ProviderError> {
        let usage = self.usage.unwrap_or_default();
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("reply carried no choices".into()))?;
        Ok(ChatReply {
            content: choice.message.content.unwrap_or_default(),
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatReply, ProviderError> {
        let request = ChatRequest {
            model: &params.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            messages,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after_seconds(response.headers()),
            });
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".into());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?
            .into_reply(&params.model)
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Queue-backed mock. Each `complete` pops the next scripted result; an
/// empty queue yields a default reply. Requests are captured for
/// assertions.
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<ChatReply, ProviderError>>>,
    captured: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            captured: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(self, content: impl Into<String>, prompt: u64, completion: u64) -> Self {
        self.responses.lock().unwrap().push_back(Ok(ChatReply {
            content: content.into(),
            model: "mock-model".into(),
            prompt_tokens: prompt,
            completion_tokens: completion,
        }));
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn push_reply(&self, content: impl Into<String>, prompt: u64, completion: u64) {
        self.responses.lock().unwrap().push_back(Ok(ChatReply {
            content: content.into(),
            model: "mock-model".into(),
            prompt_tokens: prompt,
            completion_tokens: completion,
        }));
    }

    pub fn captured_requests(&self) -> Vec<Vec<ChatMessage>> {
        self.captured.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatReply, ProviderError> {
        self.captured.lock().unwrap().push(messages.to_vec());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(ChatReply {
                content: "mock reply".into(),
                model: params.model.clone(),
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
