//! # Reply Generation Client
//!
//! Chat-completion collaborator for composing what the assistant says next.
//! The pipeline hands over the call parameters, a short transcript suffix,
//! and the turn kind; everything about prompt wording and the wire protocol
//! stays inside this module.
//!
//! ## Rate limiting:
//! The completion API throttles with HTTP 429. Requests retry up to four
//! times, honoring a `Retry-After` header when present and otherwise
//! backing off exponentially from two seconds. Any other failure surfaces
//! immediately and is handled at the pipeline stage boundary.

use crate::audio::session::{CallParams, Role, TranscriptEntry};
use crate::pipeline::TurnKind;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Retry budget for rate-limited completion calls.
const MAX_RETRIES: u32 = 4;

/// First backoff step; doubles per attempt when no `Retry-After` is given.
const INITIAL_BACKOFF_SECS: u64 = 2;

/// Said when the completion comes back empty; better than dead air.
const FALLBACK_REPLY: &str = "Could you please repeat that?";

/// Capability interface: call context + transcript suffix -> reply text.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        params: &CallParams,
        history: &[TranscriptEntry],
        kind: TurnKind,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Assemble the chat messages for one turn.
///
/// The opening turn gets an opening-statement instruction built purely from
/// the call parameters; reactive turns get a reply instruction anchored on
/// the last thing the other side said. Either way the recent transcript
/// rides along as chat history so the model keeps conversational context.
fn build_messages(
    params: &CallParams,
    history: &[TranscriptEntry],
    kind: TurnKind,
) -> Vec<ChatMessage> {
    let non_empty = |value: &str, fallback: &str| -> String {
        if value.is_empty() {
            fallback.to_string()
        } else {
            value.to_string()
        }
    };

    let (system, user) = match kind {
        TurnKind::Initial => {
            let purpose = match params.purpose.as_str() {
                "new_appointment" => "Book new appointment".to_string(),
                "reschedule" => "Reschedule".to_string(),
                other => other.to_string(),
            };
            (
                format!(
                    "You are an AI phone assistant making a call to book an appointment.\n\
                     Generate the opening message for a call to {}.\n\
                     Be polite, professional, and clearly state you're an AI calling on behalf of {}.\n\
                     Keep it concise (2-3 sentences max). Speak naturally as if on a phone call.",
                    params.provider_name, params.user_name
                ),
                format!(
                    "Generate opening for:\nService: {}\nPurpose: {}\nDetails: {}\nTime preference: {}",
                    params.service,
                    purpose,
                    non_empty(&params.details, "None"),
                    non_empty(&params.time_preference, "Flexible")
                ),
            )
        }
        TurnKind::Reactive => {
            let last_utterance = history
                .last()
                .map(|entry| entry.text.clone())
                .unwrap_or_else(|| "Hello?".to_string());
            (
                format!(
                    "You are an AI phone assistant in a live phone conversation to book an appointment at {}.\n\
                     Based on what the receptionist/staff said, generate an appropriate reply.\n\
                     If they offered a time slot, confirm it and ask for confirmation details.\n\
                     If they asked a question, answer it based on the context.\n\
                     If they can't help, thank them politely.\n\
                     Keep responses concise (1-2 sentences). Be natural and conversational.",
                    params.provider_name
                ),
                format!(
                    "The receptionist said: \"{}\"\n\nService requested: {}\nTime preference: {}\nAdditional context: {}\n\nWhat should you say next?",
                    last_utterance,
                    params.service,
                    non_empty(&params.time_preference, "Flexible"),
                    non_empty(&params.details, "None")
                ),
            )
        }
    };

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system",
        content: system,
    });
    for entry in history {
        messages.push(ChatMessage {
            role: match entry.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: entry.text.clone(),
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: user,
    });
    messages
}

/// Backoff delay for a rate-limited attempt, absent server guidance.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(INITIAL_BACKOFF_SECS * 2u64.pow(attempt))
}

/// Production generator backed by an OpenAI-compatible chat-completions API.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    /// How many trailing transcript entries ride along as chat history
    history_window: usize,
}

impl OpenAiGenerator {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        model: String,
        max_tokens: u32,
        temperature: f32,
        history_window: usize,
    ) -> Self {
        Self {
            client,
            api_key,
            model,
            max_tokens,
            temperature,
            history_window,
        }
    }

    async fn chat_completion(&self, messages: &[ChatMessage]) -> Result<ChatCompletionResponse> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(CHAT_COMPLETIONS_URL)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .context("chat-completion request failed")?;

            if response.status().as_u16() != 429 {
                if !response.status().is_success() {
                    let status = response.status();
                    let detail = response.text().await.unwrap_or_default();
                    return Err(anyhow!(
                        "chat-completion returned {}: {}",
                        status,
                        detail.chars().take(500).collect::<String>()
                    ));
                }
                return response
                    .json::<ChatCompletionResponse>()
                    .await
                    .context("decoding chat-completion response");
            }

            if attempt >= MAX_RETRIES {
                return Err(anyhow!("chat-completion rate limit exceeded after retries"));
            }

            let wait = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or_else(|| backoff_delay(attempt));

            warn!(
                attempt = attempt + 1,
                wait_secs = wait.as_secs_f64(),
                "Rate-limited by completion API, retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        params: &CallParams,
        history: &[TranscriptEntry],
        kind: TurnKind,
    ) -> Result<String> {
        let start = history.len().saturating_sub(self.history_window);
        let messages = build_messages(params, &history[start..], kind);

        let response = self.chat_completion(&messages).await?;
        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if reply.trim().is_empty() {
            Ok(FALLBACK_REPLY.to_string())
        } else {
            Ok(reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CallParams {
        CallParams {
            provider_name: "Acme Dental".to_string(),
            service: "checkup".to_string(),
            user_name: "Nora".to_string(),
            purpose: "new_appointment".to_string(),
            details: String::new(),
            time_preference: "mornings".to_string(),
        }
    }

    #[test]
    fn test_initial_messages_have_no_history_requirement() {
        let messages = build_messages(&params(), &[], TurnKind::Initial);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("Acme Dental"));
        assert!(messages[0].content.contains("Nora"));
        assert_eq!(messages[1].role, "user");
        assert!(messages[1].content.contains("Book new appointment"));
        assert!(messages[1].content.contains("mornings"));
    }

    #[test]
    fn test_reactive_messages_quote_last_utterance() {
        let history = vec![
            TranscriptEntry {
                role: Role::Assistant,
                text: "Hello, I'm calling to book a checkup.".to_string(),
            },
            TranscriptEntry {
                role: Role::User,
                text: "We have Tuesday at nine.".to_string(),
            },
        ];
        let messages = build_messages(&params(), &history, TurnKind::Reactive);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[2].role, "user");
        assert!(messages[3].content.contains("We have Tuesday at nine."));
    }

    #[test]
    fn test_reactive_without_history_asks_about_hello() {
        let messages = build_messages(&params(), &[], TurnKind::Reactive);
        assert!(messages.last().unwrap().content.contains("Hello?"));
    }

    #[test]
    fn test_empty_fields_fall_back_in_prompt() {
        let mut p = params();
        p.details = String::new();
        p.time_preference = String::new();
        let messages = build_messages(&p, &[], TurnKind::Initial);
        let user = &messages.last().unwrap().content;
        assert!(user.contains("Details: None"));
        assert!(user.contains("Time preference: Flexible"));
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
        assert_eq!(backoff_delay(1), Duration::from_secs(4));
        assert_eq!(backoff_delay(2), Duration::from_secs(8));
        assert_eq!(backoff_delay(3), Duration::from_secs(16));
    }

    #[test]
    fn test_completion_response_tolerates_missing_content() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());

        let parsed: ChatCompletionResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(parsed.choices.is_empty());
    }
}
