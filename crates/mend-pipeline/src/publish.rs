//! Pull-request publishing seam.
//!
//! The hosting call is an interface: [`GitHubGateway`] talks to a real
//! GitHub repository when credentials are configured, and
//! [`RecordedGateway`] otherwise records the proposal locally with
//! `provider: "recorded"` so nothing downstream mistakes it for a remote
//! object.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use mend_core::config::HostingConfig;
use mend_core::types::PrRecord;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("hosting error: {0}")]
    Hosting(String),

    #[error("hosting credentials incomplete: token, owner, and repo are all required")]
    MissingCredentials,
}

// ---------------------------------------------------------------------------
// PrGateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PrRequest {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait PrGateway: Send + Sync {
    async fn open_pr(&self, request: &PrRequest) -> Result<PrRecord, PublishError>;
}

// ---------------------------------------------------------------------------
// GitHubGateway
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GitHubGateway {
    octocrab: octocrab::Octocrab,
    owner: String,
    repo: String,
}

impl GitHubGateway {
    pub fn new(config: &HostingConfig) -> Result<Self, PublishError> {
        let (Some(token), Some(owner), Some(repo)) =
            (config.token.clone(), config.owner.clone(), config.repo.clone())
        else {
            return Err(PublishError::MissingCredentials);
        };
        let octocrab = octocrab::Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| PublishError::Hosting(e.to_string()))?;
        Ok(Self {
            octocrab,
            owner,
            repo,
        })
    }
}

#[async_trait]
impl PrGateway for GitHubGateway {
    async fn open_pr(&self, request: &PrRequest) -> Result<PrRecord, PublishError> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(&request.title, &request.branch, &request.base)
            .body(&request.body)
            .send()
            .await
            .map_err(|e| PublishError::Hosting(e.to_string()))?;

        info!(number = pr.number, branch = %request.branch, "pull request opened");
        Ok(PrRecord {
            url: pr
                .html_url
                .map(|u| u.to_string())
                .unwrap_or_else(|| format!("https://github.com/{}/{}/pull/{}", self.owner, self.repo, pr.number)),
            number: pr.number,
            branch: request.branch.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            provider: "github".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordedGateway
// ---------------------------------------------------------------------------

/// Default gateway when no hosting credentials exist. The record is local
/// only; `provider: "recorded"` marks the boundary.
pub struct RecordedGateway {
    counter: AtomicU64,
}

impl RecordedGateway {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for RecordedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrGateway for RecordedGateway {
    async fn open_pr(&self, request: &PrRequest) -> Result<PrRecord, PublishError> {
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(number, branch = %request.branch, "pull request recorded locally");
        Ok(PrRecord {
            url: format!("recorded://pulls/{number}"),
            number,
            branch: request.branch.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            provider: "recorded".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PrRequest {
        PrRequest {
            branch: "feedback-ab12cd34-1700000000000".into(),
            base: "main".into(),
            title: "Improve translation accuracy".into(),
            body: "## Changelog\n- fixed German output".into(),
        }
    }

    #[tokio::test]
    async fn recorded_gateway_numbers_sequentially() {
        let gateway = RecordedGateway::new();
        let first = gateway.open_pr(&request()).await.unwrap();
        let second = gateway.open_pr(&request()).await.unwrap();

        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
        assert_eq!(first.provider, "recorded");
        assert!(first.url.starts_with("recorded://"));
        assert_eq!(first.branch, request().branch);
    }

    #[test]
    fn github_gateway_requires_full_credentials() {
        let err = GitHubGateway::new(&HostingConfig {
            token: Some("t".into()),
            owner: None,
            repo: Some("r".into()),
        })
        .unwrap_err();
        assert!(matches!(err, PublishError::MissingCredentials));
    }
}
