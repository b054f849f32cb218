//! # Speech-to-Text Client
//!
//! Submits one containerized utterance fragment per request and returns the
//! recognized text. The engine is request/response, not streaming; the
//! inbound accumulator upstream decides when a fragment is big enough to be
//! worth the round trip.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Maximum audio upload size (10 MiB). A fragment this large means the
/// accumulator threshold is misconfigured, not that the caller spoke for
/// twenty minutes.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Capability interface: framed audio bytes -> recognized text.
///
/// Implementations return the raw recognizer output; deciding whether the
/// text is long enough to count as an utterance is the pipeline's job.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
}

/// Production transcriber backed by the ElevenLabs speech-to-text API.
#[derive(Clone)]
pub struct ElevenLabsStt {
    client: reqwest::Client,
    api_key: String,
    model_id: String,
    language_code: String,
}

impl ElevenLabsStt {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        model_id: String,
        language_code: String,
    ) -> Self {
        Self {
            client,
            api_key,
            model_id,
            language_code,
        }
    }
}

#[async_trait]
impl Transcriber for ElevenLabsStt {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        if wav.len() > MAX_STT_INPUT_BYTES {
            return Err(anyhow!(
                "audio upload exceeds maximum size: {} bytes (limit {})",
                wav.len(),
                MAX_STT_INPUT_BYTES
            ));
        }

        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("building audio upload part")?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model_id", self.model_id.clone())
            .text("language_code", self.language_code.clone());

        let response = self
            .client
            .post("https://api.elevenlabs.io/v1/speech-to-text")
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .context("speech-to-text request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("speech-to-text returned {}: {}", status, body));
        }

        let parsed: SttResponse = response
            .json()
            .await
            .context("decoding speech-to-text response")?;
        Ok(parsed.text)
    }
}
