//! # Transcript Broadcast Sink
//!
//! Fire-and-forget publication of transcript lines so a frontend can follow
//! the call live. The sink is an opaque collaborator: a failed publish is
//! logged and swallowed, never allowed to affect the turn that produced the
//! line.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

/// Capability interface: (call id, speaker, text) -> best-effort publish.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn publish(&self, call_sid: &str, speaker: &str, text: &str);
}

/// Sink used when no broadcast endpoint is configured (and in tests).
pub struct NullTranscriptSink;

#[async_trait]
impl TranscriptSink for NullTranscriptSink {
    async fn publish(&self, _call_sid: &str, _speaker: &str, _text: &str) {}
}

/// Publishes transcript lines to a realtime broadcast endpoint, one topic
/// per call (`call:{call_sid}`).
pub struct RealtimeBroadcast {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RealtimeBroadcast {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: String) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    async fn send(&self, call_sid: &str, speaker: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .json(&json!({
                "messages": [{
                    "topic": format!("call:{}", call_sid),
                    "event": "transcript",
                    "payload": {
                        "speaker": speaker,
                        "text": text,
                        "timestamp": chrono::Utc::now().timestamp_millis(),
                    },
                }],
            }))
            .send()
            .await
            .context("broadcast request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("broadcast endpoint returned {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptSink for RealtimeBroadcast {
    async fn publish(&self, call_sid: &str, speaker: &str, text: &str) {
        // No call id means the start event never arrived; nothing to key on.
        if call_sid.is_empty() {
            return;
        }
        if let Err(err) = self.send(call_sid, speaker, text).await {
            warn!(call_sid = %call_sid, error = %err, "Transcript broadcast failed");
        }
    }
}
