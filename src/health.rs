//! # Health & Metrics Endpoints
//!
//! Liveness and observability for the call backend: uptime, request and
//! error counters, live call count, and whether each external collaborator
//! has credentials configured (without ever echoing the secrets).

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "agent-call-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_calls": metrics.active_calls
        },
        "collaborators": {
            "speech": {
                "stt_model": config.speech.stt_model,
                "tts_model": config.speech.tts_model,
                "configured": env_present("ELEVENLABS_API_KEY")
            },
            "llm": {
                "model": config.llm.model,
                "configured": env_present("OPENAI_API_KEY")
            },
            "broadcast": {
                "configured": env_present("BROADCAST_URL")
            }
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "average_duration_ms": metric.average_duration_ms(),
            "error_rate": metric.error_rate()
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "totals": {
            "request_count": metrics.request_count,
            "error_count": metrics.error_count,
            "active_calls": metrics.active_calls
        },
        "endpoints": endpoint_stats
    }))
}

/// True when the named environment variable is set and non-empty.
fn env_present(name: &str) -> bool {
    std::env::var(name).map(|v| !v.trim().is_empty()).unwrap_or(false)
}
