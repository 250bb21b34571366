//! berth-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON optional).
//! 3. Open the disk model store.
//! 4. Build the backend set and start the scheduler (installer + loader).
//! 5. Build the Axum router.
//! 6. Serve on a Unix socket (default) or loopback TCP, with an optional
//!    concurrent TLS listener, until SIGINT/SIGTERM; then drain runners and
//!    clean up the socket file.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;
mod stream;
mod tls;

use std::sync::Arc;

use berth_core::recorder::{Recorder, RecorderConfig};
use berth_core::store::DiskModelStore;
use berth_core::{Backend, BackendKind, BackendSet, LoaderConfig, SchedulerBuilder};
use tower::Layer as _;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env()?;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: MODEL_RUNNER_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "berth-server starting");

    // ── 3. Model store ─────────────────────────────────────────────────────────
    tokio::fs::create_dir_all(&cfg.models_path).await?;
    let store = Arc::new(DiskModelStore::new(&cfg.models_path));
    info!(models_path = %cfg.models_path.display(), "model store ready");

    // ── 4. Scheduler (backends, installer, loader) ─────────────────────────────
    let backends = BackendSet::new(vec![
        Backend::new(BackendKind::Gguf, cfg.gguf_bin.clone()),
        Backend::new(BackendKind::Safetensors, cfg.safetensors_bin.clone()),
        Backend::new(BackendKind::Mlx, cfg.mlx_bin.clone()),
        Backend::new(BackendKind::Diffusion, cfg.diffusion_bin.clone()),
    ]);
    let scheduler = SchedulerBuilder::new(backends, store)
        .loader_config(LoaderConfig {
            slot_count: cfg.slot_count,
            idle_timeout: cfg.idle_timeout,
            scratch_dir: cfg.scratch_dir.clone(),
            ..LoaderConfig::default()
        })
        .build();
    info!(slots = cfg.slot_count, "scheduler initialised");

    // ── 5. Router ──────────────────────────────────────────────────────────────
    let state = AppState {
        config: Arc::new(cfg.clone()),
        scheduler: Arc::clone(&scheduler),
        recorder: Arc::new(Recorder::new(RecorderConfig::default())),
    };
    let router = routes::build(state);

    // ── 6. Listeners ───────────────────────────────────────────────────────────
    let tls_handle = match cfg.tls_port {
        Some(port) => Some(spawn_tls_listener(port, router.clone()).await?),
        None => None,
    };

    // The /exp prefix rewrite must run before routing, so it wraps the
    // router instead of being a router layer.
    let app = middleware::RewriteExperimentalLayer.layer(router);

    match cfg.tcp_port {
        Some(port) => {
            let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(%addr, "HTTP server listening");
            axum::serve(
                listener,
                <_ as axum::ServiceExt<axum::extract::Request>>::into_make_service(app),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        }
        None => {
            #[cfg(unix)]
            {
                // Remove a stale socket file left from a previous run.
                let _ = tokio::fs::remove_file(&cfg.socket_path).await;
                if let Some(parent) = cfg.socket_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let listener = tokio::net::UnixListener::bind(&cfg.socket_path)?;
                info!(socket = %cfg.socket_path.display(), "HTTP server listening");
                axum::serve(
                    listener,
                    <_ as axum::ServiceExt<axum::extract::Request>>::into_make_service(app),
                )
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            }
            #[cfg(not(unix))]
            {
                anyhow::bail!("unix sockets unavailable; set MODEL_RUNNER_PORT");
            }
        }
    }

    // ── 7. Shutdown ────────────────────────────────────────────────────────────
    if let Some(handle) = tls_handle {
        handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    }
    scheduler.shutdown().await;
    if cfg.tcp_port.is_none() {
        if let Err(e) = tokio::fs::remove_file(&cfg.socket_path).await {
            warn!(
                socket = %cfg.socket_path.display(),
                error = %e,
                "failed to remove socket file on shutdown (may not exist)"
            );
        }
    }

    info!("berth-server stopped");
    Ok(())
}

/// Start the optional TLS listener with generated certificates.
async fn spawn_tls_listener(
    port: u16,
    router: axum::Router,
) -> anyhow::Result<axum_server::Handle> {
    let app = middleware::RewriteExperimentalLayer.layer(router);
    let cert_dir = dirs_next::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("berth")
        .join("tls");
    let (cert, key) = tls::ensure_certificates(&cert_dir)?;
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;

    let handle = axum_server::Handle::new();
    let serve_handle = handle.clone();
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    tokio::spawn(async move {
        info!(%addr, "TLS listener starting");
        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .handle(serve_handle)
            .serve(<_ as axum::ServiceExt<axum::extract::Request>>::into_make_service(
                app,
            ))
            .await
        {
            warn!(error = %e, "TLS listener exited");
        }
    });
    Ok(handle)
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
