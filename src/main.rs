//! # Agent Call Backend - Main Application Entry Point
//!
//! Entry point for the outbound-calling assistant backend. Sets up an
//! Actix-web server that exposes:
//!
//! - the media-stream WebSocket endpoint driving live calls
//!   (`/api/call/media-stream`)
//! - health, metrics, and runtime-configuration endpoints under `/api/v1`
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment)
//! - **state**: shared state and server metrics
//! - **audio**: mu-law codec, inbound accumulator, call sessions
//! - **websocket**: the per-connection streaming session controller
//! - **pipeline**: the transcribe -> respond -> synthesize turn cycle
//! - **speech / llm / broadcast**: external collaborator clients
//! - **middleware / handlers / health / error**: HTTP plumbing

mod audio;       // Codec, accumulator, and call-session state
mod broadcast;   // Transcript broadcast sink
mod config;      // Configuration management
mod error;       // Error handling types
mod handlers;    // HTTP request handlers
mod health;      // Health check endpoints
mod llm;         // Reply-generation client
mod middleware;  // Request logging and metrics middleware
mod pipeline;    // Turn pipeline
mod speech;      // Speech-to-text / text-to-speech clients
mod state;       // Application state management
mod websocket;   // Media-stream WebSocket handler

use actix_cors::Cors;
use actix_web::{web, App, HttpServer, middleware::Logger};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio::session::SessionManager;
use broadcast::{NullTranscriptSink, RealtimeBroadcast, TranscriptSink};
use crate::config::AppConfig;
use llm::OpenAiGenerator;
use pipeline::TurnPipeline;
use speech::{ElevenLabsStt, ElevenLabsTts};
use state::AppState;

/// Global shutdown flag, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env (if present) before anything
    // reads API keys.
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting agent-call-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone());
    let session_manager = web::Data::new(SessionManager::new(
        config.performance.max_concurrent_calls,
    ));
    let turn_pipeline = web::Data::new(build_pipeline(&config)?);
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
            .app_data(session_manager.clone())
            .app_data(turn_pipeline.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
            )
            .route("/health", web::get().to(health::health_check))
            // Duplex telephony audio for live calls
            .route("/api/call/media-stream", web::get().to(websocket::media_stream))
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

/// Wire the four collaborator clients into a shared turn pipeline.
///
/// Missing speech/LLM keys are a warning rather than a startup failure: the
/// HTTP surface still serves, and the affected collaborator fails per turn
/// where the pipeline's stage-boundary handling logs it.
fn build_pipeline(config: &AppConfig) -> Result<TurnPipeline> {
    let speech_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building speech HTTP client")?;
    let llm_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("building completion HTTP client")?;

    let elevenlabs_key = env_or_empty("ELEVENLABS_API_KEY");
    if elevenlabs_key.is_empty() {
        warn!("ELEVENLABS_API_KEY is not set; transcription and synthesis will fail");
    }
    let openai_key = env_or_empty("OPENAI_API_KEY");
    if openai_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; reply generation will fail");
    }

    let transcriber = ElevenLabsStt::new(
        speech_client.clone(),
        elevenlabs_key.clone(),
        config.speech.stt_model.clone(),
        config.speech.language_code.clone(),
    );
    let synthesizer = ElevenLabsTts::new(
        speech_client.clone(),
        elevenlabs_key,
        config.speech.tts_voice_id.clone(),
        config.speech.tts_model.clone(),
        config.audio.synthesis_rate,
    );
    let generator = OpenAiGenerator::new(
        llm_client,
        openai_key,
        config.llm.model.clone(),
        config.llm.max_tokens,
        config.llm.temperature,
        config.llm.history_window,
    );

    let transcripts: Arc<dyn TranscriptSink> = match std::env::var("BROADCAST_URL") {
        Ok(url) if !url.trim().is_empty() => Arc::new(RealtimeBroadcast::new(
            speech_client,
            url,
            env_or_empty("BROADCAST_API_KEY"),
        )),
        _ => {
            info!("BROADCAST_URL is not set; transcript broadcasting disabled");
            Arc::new(NullTranscriptSink)
        }
    };

    Ok(TurnPipeline::new(
        Arc::new(transcriber),
        Arc::new(generator),
        Arc::new(synthesizer),
        transcripts,
        config.audio_settings(),
    ))
}

fn env_or_empty(name: &str) -> String {
    std::env::var(name).unwrap_or_default().trim().to_string()
}

/// Initialize the tracing subscriber, honoring `RUST_LOG` when set.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_call_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
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

/// Poll the shutdown flag; returns once shutdown has been requested.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
