use onceread::{
    config::{AppConfig, BackendKind},
    envelope::EnvelopeCodec,
    secret::{AccessPolicy, CleanupHandle, SecretManager},
    store::{MemoryBackend, RedisBackend, SharedBackend},
    web,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the in-memory store drops expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging first
    let json_logs = std::env::var("ONCEREAD_LOG_FORMAT").as_deref() == Ok("json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onceread=debug,tower_http=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting onceread v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    let backend = connect_backend(config).await?;
    let secrets = Arc::new(SecretManager::new(backend, AccessPolicy::default()));
    secrets
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Secret store not reachable: {}", e))?;

    let codec = Arc::new(EnvelopeCodec::new(config.crypto)?);
    info!(
        version = codec.config().version.tag(),
        memory_kib = config.crypto.memory_cost_kib,
        "Envelope codec ready"
    );

    let (cleanup, cleanup_worker) = CleanupHandle::spawn(
        secrets.clone(),
        config.cleanup.timeout(),
        config.cleanup.queue_size,
        config.cleanup.max_concurrent,
    );

    let state = web::AppState::new(codec, secrets, cleanup, config.server.public_url.clone());
    let app = web::create_router(state);

    let addr = config.server.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Web server listening on http://{}", addr);

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.notified().await }
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        res = &mut server => {
            res??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    info!("Shutting down, draining in-flight requests...");
    shutdown.notify_one();
    match tokio::time::timeout(config.server.shutdown_timeout(), server).await {
        Ok(res) => res??,
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Graceful shutdown timed out"
        ),
    }

    // The worker exits once the router's handle is gone.
    if tokio::time::timeout(config.cleanup.timeout(), cleanup_worker)
        .await
        .is_err()
    {
        debug!("Cleanup worker still busy at exit");
    }

    info!("Server stopped");
    Ok(())
}

async fn connect_backend(config: &AppConfig) -> anyhow::Result<SharedBackend> {
    match config.store.backend {
        BackendKind::Redis => {
            let redis = RedisBackend::connect(
                &config.store.redis_url,
                config.store.connect_timeout(),
                config.store.response_timeout(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;
            Ok(Arc::new(redis))
        }
        BackendKind::Memory => {
            warn!("Using in-memory store, secrets will not survive a restart");
            let memory = Arc::new(MemoryBackend::new());
            let sweeper = memory.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    let purged = sweeper.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired entries purged");
                    }
                }
            });
            Ok(memory)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
