//! # Voice Relay Proxy - Main Application Entry Point
//!
//! Runs two listeners in one process:
//!
//! - **WebSocket proxy** (`proxy.port`, default 5002): browser audio and control
//!   messages are relayed to the conversational backend, with device
//!   authentication, Opus transcoding and reconnection handled here
//! - **HTTP launcher** (`server.port`, default 5001): serves the browser client
//!   page plus health, metrics, config and connection-test endpoints
//!
//! ## Application Architecture:
//! - **config**: configuration from defaults, `config.toml`, `APP__*` and legacy env vars
//! - **audio**: framing, Opus codec adapter, playback chunks
//! - **proxy**: listener, sessions, backend link, session registry
//! - **state / health / handlers / middleware**: the HTTP launcher
//! - **error**: relay and HTTP error types
//!
//! ## Shutdown:
//! SIGINT/SIGTERM cancels one `CancellationToken`. The HTTP server stops
//! gracefully, the proxy stops accepting, and every live session (running under
//! a child token) closes both of its sockets.

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod proxy;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::{OpusCodecFactory, SharedCodecFactory};
use config::AppConfig;
use proxy::{BackendHandshake, ProxyServer, SessionRegistry};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long live sessions get to close after the proxy stops accepting.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        backend = %config.backend.url,
        device_id = %config.backend.device_id,
        token_enabled = config.backend.enable_token,
        "Configuration loaded"
    );

    let handshake = BackendHandshake::from_config(&config.backend)?;
    let codecs: SharedCodecFactory = Arc::new(OpusCodecFactory::new(&config.audio));
    let registry = Arc::new(SessionRegistry::new(config.proxy.max_sessions));
    let shutdown = CancellationToken::new();

    let proxy = ProxyServer::bind(config.clone(), handshake, codecs, registry.clone()).await?;
    let proxy_task = tokio::spawn(proxy.run(shutdown.clone()));

    let app_state = AppState::new(config.clone(), registry.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/", web::get().to(handlers::index))
            .route("/health", web::get().to(health::health_check))
            .route("/test_connection", web::get().to(handlers::test_connection))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            server_handle.stop(true).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            server_handle.stop(true).await;
        }
    }

    shutdown.cancel();
    if let Err(e) = proxy_task.await {
        error!("Proxy task error: {}", e);
    }
    drain_sessions(&registry).await;

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_proxy=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

async fn drain_sessions(registry: &SessionRegistry) {
    let deadline = tokio::time::Instant::now() + SESSION_DRAIN_TIMEOUT;
    while registry.active_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining = registry.active_count(), "Sessions still open at shutdown");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
