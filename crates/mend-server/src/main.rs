//! mend server — accepts feedback over HTTP and drives the improvement
//! pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mend_core::config::Config;
use mend_harness::{ShutdownSignal, TokenBreaker};
use mend_model::{HttpProvider, LlmProvider, MockProvider, ModelClient};
use mend_pipeline::{
    GitHubGateway, HeadlessBrowser, Ingress, Orchestrator, PrGateway, RecordedGateway, TestHarness,
};
use mend_server::{api_router, ApiState};
use mend_store::Store;
use mend_workspace::Workspace;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    info!(port = config.server.port, mode = ?config.db.mode, "mend server starting");

    // --- storage ---
    let store = Arc::new(
        Store::open(&config.db)
            .await
            .context("failed to open the record store")?,
    );
    store.set_setting("model", config.model.model.clone()).await;
    if let Some(url) = &config.repo.url {
        store.set_setting("repoUrl", url.clone()).await;
    }

    // --- admission control ---
    let breaker = TokenBreaker::new(config.breaker.clone(), store.clone());

    // --- model access ---
    let provider: Arc<dyn LlmProvider> = match &config.model.api_key {
        Some(key) => Arc::new(HttpProvider::new(key.clone(), config.model.base_url.clone())),
        None => {
            warn!("MODEL_API_KEY not set; model calls go to the mock provider");
            Arc::new(MockProvider::new())
        }
    };
    let model = ModelClient::new(provider, breaker.clone(), store.clone(), &config.model);

    // --- pipeline collaborators ---
    let workspace = Arc::new(Workspace::new(&config.repo));
    let browser = Arc::new(HeadlessBrowser::discover(&config.tests));
    let harness = TestHarness::new(browser, &config.tests);
    let gateway: Arc<dyn PrGateway> = if config.hosting.is_configured() {
        Arc::new(GitHubGateway::new(&config.hosting).context("failed to build hosting gateway")?)
    } else {
        info!("no hosting credentials; pull requests will be recorded locally");
        Arc::new(RecordedGateway::new())
    };

    let shutdown = ShutdownSignal::new();
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        breaker.clone(),
        model,
        workspace,
        harness,
        gateway,
        shutdown.clone(),
    ));
    let ingress = Ingress::new(store.clone(), orchestrator);

    // --- background loops ---
    tokio::spawn({
        let breaker = breaker.clone();
        let rx = shutdown.subscribe();
        async move { breaker.run_housekeeping(rx).await }
    });
    tokio::spawn({
        let store = store.clone();
        let rx = shutdown.subscribe();
        async move {
            store
                .run_flush_loop(std::time::Duration::from_secs(30), rx)
                .await
        }
    });

    // --- serve ---
    let state = Arc::new(ApiState::new(ingress, store.clone(), breaker));
    let app = api_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c listener failed");
                return;
            }
            info!("ctrl-c received, shutting down");
            shutdown.trigger();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .context("server error")?;

    // In-flight pipelines observed the shutdown signal; persist what we
    // have before exiting.
    store.flush().await.ok();
    info!("mend server stopped");
    Ok(())
}
