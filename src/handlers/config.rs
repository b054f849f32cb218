//! Runtime configuration endpoints: read the current (non-secret)
//! configuration and apply validated partial updates. API keys never appear
//! here; they live in environment variables only.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "speech": {
                "stt_model": config.speech.stt_model,
                "language_code": config.speech.language_code,
                "tts_voice_id": config.speech.tts_voice_id,
                "tts_model": config.speech.tts_model
            },
            "llm": {
                "model": config.llm.model,
                "max_tokens": config.llm.max_tokens,
                "temperature": config.llm.temperature,
                "history_window": config.llm.history_window
            },
            "audio": {
                "buffer_threshold_bytes": config.audio.buffer_threshold_bytes,
                "chunk_bytes": config.audio.chunk_bytes,
                "chunk_interval_ms": config.audio.chunk_interval_ms,
                "initial_turn_delay_ms": config.audio.initial_turn_delay_ms,
                "recognizer_rate": config.audio.recognizer_rate,
                "synthesis_rate": config.audio.synthesis_rate
            },
            "performance": {
                "max_concurrent_calls": config.performance.max_concurrent_calls
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config)
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
