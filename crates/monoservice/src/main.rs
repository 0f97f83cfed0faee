//! Monoservice - main entry point
//!
//! This is the host process that:
//! - Watches the module folder and loads new modules
//! - Publishes each module's route, replacing older handlers in place
//! - Serves HTTP requests against whatever handlers are currently bound

mod adapter;
mod config;
mod router;
mod runtime;

#[cfg(test)]
mod testing;

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::runtime::{DylibLoader, ModuleLoader, ModuleWatcher, ReloadPolicy, RoutePublisher, RouteTable};

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub routes: Arc<RouteTable>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,monoservice=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(run(AppConfig::from_env()));

    // A handler stuck in process() must not keep the process alive.
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(config: AppConfig) -> Result<()> {
    tracing::info!("Starting monoservice");
    tracing::info!("Configuration loaded: {:?}", config);

    tokio::fs::create_dir_all(&config.module_folder)
        .await
        .with_context(|| format!("failed to create module folder {:?}", config.module_folder))?;

    let loader: Arc<dyn ModuleLoader> = match config.reload_policy() {
        ReloadPolicy::CreateOnly => Arc::new(DylibLoader::new()),
        ReloadPolicy::ReloadOnWrite => Arc::new(
            DylibLoader::with_shadow_copies().context("failed to create module shadow directory")?,
        ),
    };

    let routes = Arc::new(RouteTable::new());
    let (events_tx, events_rx) = mpsc::channel(1);

    let publisher = tokio::spawn(RoutePublisher::new(Arc::clone(&routes)).run(events_rx));
    let mut watcher = ModuleWatcher::new(
        config.module_folder.clone(),
        loader,
        events_tx,
        config.reload_policy(),
    )
    .start()
    .context("failed to watch module folder")?;

    let listen_addr = config.listen_addr();
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    tracing::info!("Service listening on {}", listen_addr);

    let state = Arc::new(AppState { config, routes });
    let app = router::create_gateway_router(state).layer(TraceLayer::new_for_http());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for interrupt")?;
            tracing::info!("Interrupt received, shutting down");
            Ok(())
        }
        res = watcher.join() => {
            let err = match res {
                Ok(()) => anyhow!("module watcher exited unexpectedly"),
                Err(e) => anyhow::Error::new(e).context("module watcher failed"),
            };
            tracing::error!("{:#}", err);
            Err(err)
        }
        res = &mut server => {
            let err = match res {
                Ok(Ok(())) => anyhow!("server exited unexpectedly"),
                Ok(Err(e)) => anyhow::Error::new(e).context("server failed"),
                Err(e) => anyhow::Error::new(e).context("server task failed"),
            };
            tracing::error!("{:#}", err);
            return Err(err);
        }
    };

    watcher.stop();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(grace, &mut server).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server stopped gracefully"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task failed during shutdown: {}", e),
        Err(_) => {
            tracing::warn!(grace_secs = grace.as_secs(), "Grace period elapsed, dropping in-flight requests");
            server.abort();
        }
    }
    publisher.abort();

    tracing::info!("best regards.");
    outcome
}
