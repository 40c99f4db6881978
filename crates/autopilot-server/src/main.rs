mod logging;
mod routes;
mod signature;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autopilot_agent::ClaudeBackend;
use autopilot_core::{
    config::Config,
    git::GitCli,
    hosting::GhCli,
    ledger::RunLedger,
    pipeline::Pipeline,
    poller::Poller,
    processed::ProcessedSet,
    sentry::SentryClient,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::logging::{BroadcastLayer, LogRing};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Empty disables the Sentry webhook (every request gets a 500).
    pub webhook_secret: String,
    pub repo_path: String,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: LogRing,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring: LogRing = Arc::default();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "autopilot_server=info,autopilot_core=info,autopilot_agent=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir))?;
    std::fs::create_dir_all(&config.runs_dir)
        .with_context(|| format!("create runs dir {}", config.runs_dir))?;

    let mut host = GhCli::new(config.repo_path.clone());
    if !config.github_repo.is_empty() {
        host = host.with_repo(config.github_repo.clone());
    }
    if !config.github_pat.is_empty() {
        host = host.with_token(config.github_pat.clone());
    }

    let agent = ClaudeBackend::new(config.claude_bin.clone())
        .with_models(config.fix_model.clone(), config.audit_model.clone())
        .with_turns(config.fix_max_turns, config.audit_max_turns)
        .with_sentry_mcp(config.sentry_auth_token.clone(), config.npx_path.clone());

    let ledger = Arc::new(RunLedger::new(config.runs_dir.clone()));
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(host),
        Arc::new(agent),
        Arc::new(GitCli),
        ledger,
        config.pipeline_config(),
    ));

    // Forward pipeline events to the SSE log stream
    tokio::spawn(logging::forward_pipeline_events(
        pipeline.subscribe(),
        log_tx.clone(),
        Arc::clone(&log_ring),
    ));

    let missing = config.missing_poller_keys();
    if missing.is_empty() {
        let source = SentryClient::new(
            &config.sentry_api_url,
            &config.sentry_auth_token,
            &config.sentry_org,
            &config.sentry_project,
        )
        .with_limit(config.poll_limit);
        let processed = Arc::new(ProcessedSet::load(config.processed_file()));
        info!(
            already_processed = processed.len(),
            "loaded processed issue ids"
        );
        let poller = Arc::new(Poller::new(Arc::new(source), Arc::clone(&pipeline), processed));
        tokio::spawn(poller.run_forever(Duration::from_secs(config.poll_interval_s)));
    } else {
        warn!(missing = ?missing, "Sentry poller disabled");
    }

    if config.sentry_webhook_secret.is_empty() {
        warn!("SENTRY_WEBHOOK_SECRET is not set, /sentry-webhook will refuse requests");
    }

    let state = Arc::new(AppState {
        pipeline,
        webhook_secret: config.sentry_webhook_secret.clone(),
        repo_path: config.repo_path.clone(),
        log_tx,
        log_ring,
    });
    let app = routes::router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    info!(repo_path = %config.repo_path, "Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
