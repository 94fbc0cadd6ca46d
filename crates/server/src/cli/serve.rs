use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use llama_runtime::{EchoEngine, Engine};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::build_router;
use crate::cli::{GlobalArgs, ServeArgs};
use crate::config::AppConfig;
use crate::services::model_manager::{ModelManager, UnloadTarget};
use crate::services::reaper::IdleReaper;
use crate::services::registry::ModelRegistry;
use crate::state::AppState;

pub async fn execute(global: GlobalArgs, serve_args: ServeArgs) -> anyhow::Result<()> {
    //  Config
    let mut cfg = AppConfig::load(global.config.as_deref())?;
    global.apply(&mut cfg);
    serve_args.apply(&mut cfg);

    //  Registry (an unreadable models dir is fatal at startup)
    let registry = Arc::new(
        ModelRegistry::open(cfg.registry_config()).context("model discovery failed")?,
    );

    //  Model manager
    let engine: Arc<dyn Engine> = Arc::new(
        EchoEngine::new().with_token_delay(Duration::from_millis(serve_args.token_delay_ms)),
    );
    let manager = ModelManager::new(engine, registry.clone(), cfg.manager_config());

    //  Pre-load model if specified
    if let Some(name) = &serve_args.preload {
        let lease = manager
            .acquire(Some(name))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to pre-load model: {e}"))?;
        info!(model = %lease.name(), "Pre-loaded model");
    }

    //  Background reaper
    let shutdown = CancellationToken::new();
    let reaper = IdleReaper::spawn(manager.clone(), cfg.reaper_config(), shutdown.clone());

    //  Router
    let state = AppState::new(cfg.clone(), manager.clone());
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!(
        %addr,
        engine = manager.engine_name(),
        models = registry.snapshot().len(),
        models_dir = %cfg.models_dir.display(),
        "Starting server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    //  Shutdown: stop reaping, then free whatever is idle.
    shutdown.cancel();
    if let Err(e) = reaper.await {
        error!(error = %e, "Idle reaper task failed");
    }
    let summary = manager.explicit_unload(UnloadTarget::All).await?;
    info!(
        unloaded = summary.unloaded.len(),
        busy = summary.busy.len(),
        "Shutdown complete"
    );

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        },
        _ = token.cancelled() => {}
    }
}
