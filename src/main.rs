//! # Audio Relay Backend - Main Application Entry Point
//!
//! A real-time bidirectional audio relay. Clients open a persistent WebSocket
//! at `/ws/audio`, stream binary audio frames and JSON control messages, and
//! the server runs each audio frame through a pluggable pipeline (echo by
//! default) while answering control messages in place.
//!
//! ## Application Architecture:
//! - **config**: configuration management (TOML files + environment variables)
//! - **state**: shared application state, registry and metrics
//! - **frame**: inbound message classification (audio / control / malformed)
//! - **session**: per-connection state machine, registry, outbound queue
//! - **pipeline**: pluggable audio transform
//! - **websocket**: the WebSocket transport actor
//! - **health / handlers**: HTTP observability and config surface
//! - **error**: HTTP error types

mod config;
mod error;
mod frame;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use session::state::CloseReason;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handlers and polled by the main
/// task. AtomicBool keeps it safely readable from any thread.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## Startup sequence:
/// 1. Load and validate configuration (a bind-level misconfiguration is fatal
///    here, before anything serves traffic)
/// 2. Set up structured logging
/// 3. Create the shared state (registry, pipeline, metrics)
/// 4. Bind the HTTP/WebSocket server - bind failure is fatal
/// 5. On shutdown signal: stop accepting, close every session, wait (bounded)
///    for the drain, force-close stragglers, then stop the server
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting audio-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting relay server on {}", bind_addr);

    let server = HttpServer::new({
        let app_state = app_state.clone();
        move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .wrap(cors)
                .wrap(Logger::default())
                .wrap(middleware::MetricsMiddleware)
                .route("/ws/audio", web::get().to(websocket::relay_websocket))
                .service(
                    web::scope("/api/v1")
                        .route("/health", web::get().to(health::health_check))
                        .route("/metrics", web::get().to(health::detailed_metrics))
                        .route("/config", web::get().to(handlers::get_config))
                        .route("/config", web::put().to(handlers::update_config))
                        .route("/sessions", web::get().to(handlers::list_sessions)),
                )
                .route("/health", web::get().to(health::health_check))
        }
    })
    .bind(&bind_addr)? // bind failure is fatal at startup
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, draining sessions...");
            shutdown_sessions(&app_state).await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Close every live session and wait (bounded) for the drain.
///
/// Each session observes the broadcast through its own mailbox and begins its
/// Closing transition; a session whose drain outlives the configured timeout
/// is force-closed so one stalled transport cannot delay shutdown.
async fn shutdown_sessions(app_state: &AppState) {
    let registry = app_state.registry().clone();
    let drain_timeout = app_state.get_config().relay.drain_timeout();

    registry.close_all(CloseReason::ServerShutdown);

    if registry.await_drained(drain_timeout).await {
        info!("all sessions drained");
    } else {
        let forced = registry.force_close_remaining();
        warn!(forced_sessions = forced, "drain timeout expired, force-closed remaining sessions");
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that set the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag until it is set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
