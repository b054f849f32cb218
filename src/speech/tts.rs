//! # Speech-Synthesis Client
//!
//! Turns one reply string into raw linear PCM at the engine's native rate.
//! Downstream, the pipeline resamples to the telephony rate and mu-law
//! encodes before anything reaches the wire, so this client stays
//! format-agnostic beyond asking the API for raw PCM output.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// Maximum synthesis input (64 KiB of text). Replies are one or two
/// sentences; anything near this limit is a runaway generation.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Capability interface: reply text -> raw 16-bit LE PCM at the engine's
/// native sample rate.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Production synthesizer backed by the ElevenLabs text-to-speech API.
#[derive(Clone)]
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
    /// Requested raw-PCM output rate, e.g. 22050 -> `output_format=pcm_22050`
    output_rate: u32,
}

impl ElevenLabsTts {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        voice_id: String,
        model_id: String,
        output_rate: u32,
    ) -> Self {
        Self {
            client,
            api_key,
            voice_id,
            model_id,
            output_rate,
        }
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(anyhow!(
                "synthesis text exceeds maximum size: {} bytes (limit {})",
                text.len(),
                MAX_TTS_INPUT_BYTES
            ));
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=pcm_{}",
            self.voice_id, self.output_rate
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&json!({
                "text": text,
                "model_id": self.model_id,
                "voice_settings": {
                    "stability": 0.5,
                    "similarity_boost": 0.75,
                    "style": 0.3,
                    "use_speaker_boost": true
                }
            }))
            .send()
            .await
            .context("speech-synthesis request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("speech-synthesis returned {}: {}", status, body));
        }

        let pcm = response
            .bytes()
            .await
            .context("reading synthesized audio")?;
        Ok(pcm.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_text_rejected_before_any_io() {
        let tts = ElevenLabsTts::new(
            reqwest::Client::new(),
            "key".to_string(),
            "voice".to_string(),
            "eleven_turbo_v2_5".to_string(),
            22050,
        );
        let text = "a".repeat(MAX_TTS_INPUT_BYTES + 1);
        let err = tts.synthesize(&text).await.unwrap_err();
        assert!(err.to_string().contains("maximum size"));
    }
}
