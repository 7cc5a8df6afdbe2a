//! # Trip Master Backend - Speech Gateway Entry Point
//!
//! Sets up the Actix-web HTTP server that fronts the streaming speech recognizer.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The whole server is asynchronous; one thread serves many requests
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Startup failures are returned, not panicked
//! - **Arc & RwLock**: Thread-safe shared state (see `state.rs`)
//! - **static**: The shutdown flag lives for the entire program
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **speech**: The gateway to the upstream recognizer (signing, framing, transcript assembly)
//! - **audio**: Normalizes uploads to 16kHz mono 16-bit PCM
//! - **state**: Shared configuration, metrics and recognition counters
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request telemetry (logging, metrics, request ids)
//! - **handlers**: HTTP handlers for the speech and config endpoints
//! - **error**: HTTP error types and JSON error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod speech;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handlers and polled by `main`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## What this function does:
/// 1. **Loads configuration** from .env, config.toml and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state** (config, metrics, the upstream connector)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
///
/// Missing recognizer credentials do not stop the server: it starts, logs a warning,
/// and each recognition request reports the configuration error.
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        upstream = %format!("{}://{}{}", config.speech.scheme, config.speech.host, config.speech.path),
        language = %config.speech.language,
        receive_timeout_secs = config.speech.receive_timeout_secs,
        "Speech gateway configured"
    );

    if !config.speech.has_credentials() {
        warn!("XUNFEI_APP_ID, XUNFEI_API_KEY or XUNFEI_API_SECRET is not set; speech recognition requests will fail until they are");
    }

    let app_state = AppState::new(config.clone());
    info!(converters = ?app_state.normalizer.converter_names(), "Audio normalization chain ready");
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::RequestTelemetry)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/speech-to-text", web::post().to(handlers::speech_to_text))
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .default_service(web::route().to(handlers::not_found))
    })
    .bind(&bind_addr)?
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
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Log filter (e.g. "debug", "trip_master_backend=trace")
/// - Defaults to "trip_master_backend=debug,actix_web=info"
///
/// Every upstream frame is logged at debug level, so use
/// `RUST_LOG=trip_master_backend=info` in production.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trip_master_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and set the shutdown flag when either arrives.
///
/// In-flight recognitions are allowed to finish: `server_handle.stop(true)` waits
/// for running requests before the workers exit.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

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

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
