use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use cf_domain::config::Config;
use cf_gateway::api;
use cf_gateway::runtime::access::AccessControl;
use cf_gateway::runtime::{TurnEngine, TurnTimeouts};
use cf_gateway::state::AppState;
use cf_platform::{CardPool, PlatformClient, TokenCache};
use cf_sessions::SessionCache;

#[derive(Parser)]
#[command(name = "cf-gateway", about = "CardFlow streaming chat gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // ── Config ───────────────────────────────────────────────────────
    let config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        Config::default()
    };
    let config = Arc::new(config);

    // ── Tracing ──────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cf_gateway=debug"));
    let _log_guard = if config.enable_log {
        let appender = tracing_appender::rolling::daily("logs", "gateway.log");
        let (file_writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(file_writer.and(std::io::stdout))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
        None
    };

    tracing::info!("CardFlow gateway starting");
    if !args.config.exists() {
        tracing::warn!(path = %args.config.display(), "config file not found, using defaults");
    }

    // ── Services, in dependency order ────────────────────────────────
    let tokens = Arc::new(
        TokenCache::new(&config.platform_base_url, &config.app_id, &config.app_secret)
            .context("initializing token cache")?,
    );

    let sessions = Arc::new(SessionCache::new());
    let sessions_shutdown = CancellationToken::new();
    cf_sessions::spawn_background_tasks(sessions.clone(), sessions_shutdown.clone());
    tracing::info!("session cache ready");

    let platform = Arc::new(
        PlatformClient::new(&config.platform_base_url, tokens.clone())
            .context("initializing platform client")?,
    );

    let pool = match CardPool::new(platform.clone()).await {
        Ok(pool) => pool,
        Err(e) => {
            // A cold pool is not fatal: gets fall back to on-demand
            // creation and the inline card path.
            tracing::warn!(error = %e, "card pool fill failed, starting empty");
            CardPool::with_capacity(platform.clone(), 0)
                .await
                .context("initializing empty card pool")?
        }
    };
    tracing::info!(size = pool.size(), "card pool ready");

    let provider = cf_upstream::create_provider(&config).context("initializing AI provider")?;
    tracing::info!(provider = %config.ai_provider_type, "AI provider ready");

    let access = AccessControl::new(
        config.access_control_enable,
        config.access_control_max_count_per_user_per_day,
    );
    let engine = Arc::new(TurnEngine::new(
        sessions.clone(),
        pool.clone(),
        platform.clone(),
        provider.clone(),
        access,
        TurnTimeouts::default(),
    ));

    let state = AppState {
        config: config.clone(),
        sessions,
        engine,
    };

    // ── HTTP listener ────────────────────────────────────────────────
    let app = api::router()
        .layer(CorsLayer::permissive())
        .with_state(state);

    if config.use_https {
        tracing::warn!(
            cert = %config.cert_file,
            key = %config.key_file,
            "TLS termination is not built in; run behind a TLS-terminating proxy"
        );
    }

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "CardFlow gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // ── Teardown, reverse of construction ────────────────────────────
    tracing::info!("shutting down");
    provider.shutdown();
    pool.stop();
    sessions_shutdown.cancel();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
