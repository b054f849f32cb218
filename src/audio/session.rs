//! # Call Session Management
//!
//! Per-call mutable context for the media-stream pipeline: transport
//! identifiers, caller-supplied parameters, the rolling conversation
//! transcript, the inbound audio accumulator, and the single-flight guard
//! that keeps turn executions from overlapping.
//!
//! ## Session Lifecycle:
//! 1. **Created**: populated from the transport's `start` event
//! 2. **Active**: accumulating audio, running turns
//! 3. **Released**: removed from the manager when the connection closes
//!
//! Each session is owned by exactly one connection actor; the manager map
//! exists for bookkeeping and the concurrent-call ceiling, not for sharing
//! state between connections.

use crate::audio::buffer::InboundAudioBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Caller-supplied call parameters, immutable once the call starts.
///
/// Each field has a stated default so a `start` event with missing or
/// partial `customParameters` still yields a workable session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    /// Name of the business being called
    #[serde(rename = "providerName", default = "default_provider_name")]
    pub provider_name: String,

    /// Service the caller wants to book
    #[serde(default = "default_service")]
    pub service: String,

    /// Person the assistant is calling on behalf of
    #[serde(rename = "userName", default = "default_user_name")]
    pub user_name: String,

    /// Reason for the call (e.g. "new_appointment", "reschedule")
    #[serde(default = "default_purpose")]
    pub purpose: String,

    /// Free-text context supplied by the caller
    #[serde(default)]
    pub details: String,

    /// Preferred appointment time, free text
    #[serde(rename = "timePreference", default = "default_time_preference")]
    pub time_preference: String,
}

fn default_provider_name() -> String {
    "the business".to_string()
}

fn default_service() -> String {
    "appointment".to_string()
}

fn default_user_name() -> String {
    "a customer".to_string()
}

fn default_purpose() -> String {
    "new_appointment".to_string()
}

fn default_time_preference() -> String {
    "flexible".to_string()
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            provider_name: default_provider_name(),
            service: default_service(),
            user_name: default_user_name(),
            purpose: default_purpose(),
            details: String::new(),
            time_preference: default_time_preference(),
        }
    }
}

/// Speaker of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversational exchange line, in wall-clock turn order.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
}

/// Mutable context for one live call.
///
/// ## Thread Safety:
/// The connection actor appends audio while spawned turn tasks drain it and
/// append transcript entries, so the transcript sits behind a `Mutex` and
/// the busy latch is an `AtomicBool`. The guard's compare-and-swap is the
/// only way a turn begins, which makes "drained by the task that flipped
/// busy false to true" hold by construction.
pub struct CallSession {
    /// Transport-assigned stream identifier (outbound events echo it back)
    pub stream_sid: String,

    /// Transport-assigned call identifier (used for transcript broadcasts)
    pub call_sid: String,

    /// Caller-supplied parameters, fixed at `start`
    pub params: CallParams,

    /// Not-yet-processed inbound mu-law audio
    pub buffer: InboundAudioBuffer,

    /// Ordered conversation transcript, append-only
    transcript: Mutex<Vec<TranscriptEntry>>,

    /// Single-flight latch: true while a turn execution is in flight
    busy: AtomicBool,

    /// When the session was created
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        stream_sid: String,
        call_sid: String,
        params: CallParams,
        buffer_threshold_bytes: usize,
    ) -> Self {
        Self {
            stream_sid,
            call_sid,
            params,
            buffer: InboundAudioBuffer::new(buffer_threshold_bytes),
            transcript: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    /// Append inbound audio and report whether a turn should launch now.
    ///
    /// True exactly when the accumulator has reached its threshold AND no
    /// turn is currently in flight. The caller still goes through
    /// [`try_begin_turn`](Self::try_begin_turn) before touching the buffer,
    /// so a stale `true` here can never cause double processing.
    pub fn push_audio(&self, data: &[u8]) -> bool {
        self.buffer.append(data);
        self.buffer.is_ready() && !self.is_busy()
    }

    /// Attempt to acquire the single-flight guard.
    ///
    /// Returns true for exactly one caller at a time; everyone else backs
    /// off until [`finish_turn`](Self::finish_turn) releases the latch.
    pub fn try_begin_turn(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the single-flight guard after a turn completes or fails.
    pub fn finish_turn(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Whether a turn execution is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Atomically take all accumulated audio for processing.
    pub fn drain_audio(&self) -> Vec<u8> {
        self.buffer.drain()
    }

    /// Append one entry to the conversation transcript.
    pub fn append_transcript(&self, role: Role, text: &str) {
        self.transcript.lock().unwrap().push(TranscriptEntry {
            role,
            text: text.to_string(),
        });
    }

    /// Most recent `window` transcript entries, oldest first.
    ///
    /// Generation requests read a suffix rather than the full history to
    /// bound prompt growth over long calls.
    pub fn recent_transcript(&self, window: usize) -> Vec<TranscriptEntry> {
        let transcript = self.transcript.lock().unwrap();
        let start = transcript.len().saturating_sub(window);
        transcript[start..].to_vec()
    }

    /// Full transcript copy (diagnostics and tests).
    pub fn transcript_snapshot(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().unwrap().clone()
    }

    /// Number of transcript entries so far.
    pub fn transcript_len(&self) -> usize {
        self.transcript.lock().unwrap().len()
    }
}

/// Bookkeeping for the set of live call sessions.
///
/// ## Resource Management:
/// Enforces the configured concurrent-call ceiling and lets the health
/// endpoint report how many calls are in progress. Sessions are registered
/// on the transport's `start` event and removed when the connection closes.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    max_concurrent_calls: usize,
}

impl SessionManager {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_calls,
        }
    }

    /// Register a new session keyed by its stream id.
    ///
    /// Fails when the concurrent-call ceiling is reached or the stream id
    /// is already registered.
    pub fn register(&self, session: Arc<CallSession>) -> Result<(), String> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_concurrent_calls {
            return Err(format!(
                "Maximum concurrent calls ({}) reached",
                self.max_concurrent_calls
            ));
        }

        if sessions.contains_key(&session.stream_sid) {
            return Err(format!(
                "Stream '{}' already has a session",
                session.stream_sid
            ));
        }

        sessions.insert(session.stream_sid.clone(), session);
        Ok(())
    }

    /// Look up a session by stream id.
    pub fn get(&self, stream_sid: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().unwrap().get(stream_sid).cloned()
    }

    /// Remove a session when its connection closes.
    pub fn remove(&self, stream_sid: &str) -> bool {
        self.sessions.write().unwrap().remove(stream_sid).is_some()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_threshold(threshold: usize) -> CallSession {
        CallSession::new(
            "MZ123".to_string(),
            "CA456".to_string(),
            CallParams::default(),
            threshold,
        )
    }

    #[test]
    fn test_call_params_defaults_for_missing_fields() {
        let params: CallParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.provider_name, "the business");
        assert_eq!(params.service, "appointment");
        assert_eq!(params.user_name, "a customer");
        assert_eq!(params.purpose, "new_appointment");
        assert_eq!(params.details, "");
        assert_eq!(params.time_preference, "flexible");
    }

    #[test]
    fn test_call_params_wire_field_names() {
        let params: CallParams = serde_json::from_str(
            r#"{"providerName":"Acme Dental","service":"checkup","userName":"Nora","purpose":"new_appointment","timePreference":"mornings"}"#,
        )
        .unwrap();
        assert_eq!(params.provider_name, "Acme Dental");
        assert_eq!(params.user_name, "Nora");
        assert_eq!(params.time_preference, "mornings");
    }

    #[test]
    fn test_push_audio_threshold_boundary() {
        let session = session_with_threshold(16000);
        assert!(!session.push_audio(&vec![0u8; 15999]));
        assert!(session.push_audio(&[0u8; 1]));
    }

    #[test]
    fn test_push_audio_suppressed_while_busy() {
        let session = session_with_threshold(4);
        assert!(session.try_begin_turn());
        assert!(!session.push_audio(&[0u8; 8]));
        session.finish_turn();
        assert!(session.push_audio(&[]));
    }

    #[test]
    fn test_single_flight_guard_admits_one_winner() {
        let session = Arc::new(session_with_threshold(4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(std::thread::spawn(move || session.try_begin_turn()));
        }

        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);

        session.finish_turn();
        assert!(session.try_begin_turn());
    }

    #[test]
    fn test_transcript_order_and_window() {
        let session = session_with_threshold(4);
        session.append_transcript(Role::User, "hello");
        session.append_transcript(Role::Assistant, "hi there");
        session.append_transcript(Role::User, "do you have mornings free");

        let all = session.transcript_snapshot();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].role, Role::User);
        assert_eq!(all[1].role, Role::Assistant);

        let recent = session.recent_transcript(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "hi there");
        assert_eq!(recent[1].text, "do you have mornings free");
    }

    #[test]
    fn test_manager_enforces_call_ceiling() {
        let manager = SessionManager::new(1);
        manager
            .register(Arc::new(session_with_threshold(4)))
            .unwrap();
        assert_eq!(manager.active_count(), 1);

        let overflow = Arc::new(CallSession::new(
            "MZ999".to_string(),
            "CA999".to_string(),
            CallParams::default(),
            4,
        ));
        assert!(manager.register(overflow).is_err());

        assert!(manager.remove("MZ123"));
        assert_eq!(manager.active_count(), 0);
        assert!(!manager.remove("MZ123"));
    }
}
