//! # Turn Pipeline
//!
//! One "turn" is a transcribe -> generate-reply -> synthesize -> playback
//! cycle corresponding to one conversational exchange. The pipeline composes
//! the audio codec with the four external collaborators behind their
//! capability traits, so the whole thing runs against deterministic fakes in
//! tests.
//!
//! ## Execution model:
//! Turns run as independently spawned tasks so the connection's event loop
//! never blocks on a network round trip. The session's single-flight guard
//! is acquired here (compare-and-swap), which both prevents overlapping
//! executions and guarantees that only the winning task drains the audio
//! accumulator.
//!
//! ## Failure policy:
//! Any stage failure is logged at the stage boundary and aborts the turn
//! without touching the session lifecycle; the next threshold trigger simply
//! starts a fresh turn. The guard is released on every path.

use crate::audio::codec::{self, TELEPHONY_RATE};
use crate::audio::session::{CallSession, Role};
use crate::broadcast::TranscriptSink;
use crate::llm::ReplyGenerator;
use crate::speech::{Synthesizer, Transcriber};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Transcriptions shorter than this are treated as line noise, not speech.
const MIN_UTTERANCE_CHARS: usize = 2;

/// Mark name signalling playback completion to the telephony side.
const PLAYBACK_MARK: &str = "audio_complete";

/// Which flavor of turn is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// Opening statement at call start; no inbound audio to process
    Initial,
    /// Reply to accumulated caller audio
    Reactive,
}

/// Outbound half of the duplex connection, as seen by the pipeline.
///
/// The WebSocket actor implements this by queueing frames on its own
/// mailbox; tests implement it with an in-memory recorder. Send failures on
/// a closed connection are surfaced as errors and swallowed at the turn
/// boundary.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_media(&self, payload: String) -> Result<()>;
    async fn send_mark(&self, name: &str) -> Result<()>;
}

/// Rates and pacing knobs for the audio legs of a turn.
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// Sample rate the recognizer expects (Hz)
    pub recognizer_rate: u32,

    /// Native output rate of the synthesizer (Hz)
    pub synthesis_rate: u32,

    /// Outbound chunk size in mu-law bytes (640 = 80 ms at 8 kHz)
    pub chunk_bytes: usize,

    /// Sleep between outbound chunks, approximating real-time playback
    pub chunk_interval: Duration,
}

/// The transcribe -> respond -> synthesize sequence for one session.
pub struct TurnPipeline {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn Synthesizer>,
    transcripts: Arc<dyn TranscriptSink>,
    settings: AudioSettings,
}

impl TurnPipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn Synthesizer>,
        transcripts: Arc<dyn TranscriptSink>,
        settings: AudioSettings,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            transcripts,
            settings,
        }
    }

    /// Run one turn for `session`, at most one concurrently per session.
    ///
    /// Losing the single-flight race is not an error; the caller that got
    /// the guard is already handling the same audio.
    pub async fn run_turn(&self, session: &CallSession, sink: &dyn OutboundSink, kind: TurnKind) {
        if !session.try_begin_turn() {
            debug!(stream_sid = %session.stream_sid, "Turn already in flight, skipping trigger");
            return;
        }

        if let Err(err) = self.execute(session, sink, kind).await {
            error!(
                stream_sid = %session.stream_sid,
                kind = ?kind,
                "Turn aborted: {:#}", err
            );
        }

        session.finish_turn();
    }

    async fn execute(
        &self,
        session: &CallSession,
        sink: &dyn OutboundSink,
        kind: TurnKind,
    ) -> Result<()> {
        if kind == TurnKind::Reactive {
            let heard = match self.recognize_utterance(session).await? {
                Some(text) => text,
                None => return Ok(()),
            };

            info!(call_sid = %session.call_sid, "Provider said: {}", heard);
            session.append_transcript(Role::User, &heard);
            self.transcripts
                .publish(&session.call_sid, "user", &heard)
                .await;
        }

        let history = session.recent_transcript(usize::MAX);
        let reply = self
            .generator
            .generate(&session.params, &history, kind)
            .await
            .context("reply generation failed")?;

        info!(call_sid = %session.call_sid, "Assistant says: {}", reply);
        session.append_transcript(Role::Assistant, &reply);
        self.transcripts
            .publish(&session.call_sid, "ai", &reply)
            .await;

        self.speak(sink, &reply).await
    }

    /// Drain the accumulator and run it through decode -> resample -> wrap ->
    /// recognize. Returns `None` when the turn should end silently: nothing
    /// accumulated, or the recognizer heard only noise.
    async fn recognize_utterance(&self, session: &CallSession) -> Result<Option<String>> {
        let raw = session.drain_audio();
        if raw.is_empty() {
            return Ok(None);
        }

        let pcm_line = codec::ulaw_to_pcm(&raw);
        let pcm_recognizer = codec::resample(&pcm_line, TELEPHONY_RATE, self.settings.recognizer_rate)
            .map_err(anyhow::Error::msg)
            .context("resampling inbound audio")?;
        let wav = codec::wrap_wav(&pcm_recognizer, self.settings.recognizer_rate, 1, 16);

        let text = self
            .transcriber
            .transcribe(wav)
            .await
            .context("transcription failed")?;

        if text.trim().chars().count() < MIN_UTTERANCE_CHARS {
            debug!(
                stream_sid = %session.stream_sid,
                "Discarding sub-utterance transcription ({:?})", text
            );
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Synthesize the reply and play it out in paced chunks, ending with a
    /// single completion mark.
    async fn speak(&self, sink: &dyn OutboundSink, reply: &str) -> Result<()> {
        let pcm_native = self
            .synthesizer
            .synthesize(reply)
            .await
            .context("speech synthesis failed")?;

        let pcm_line = codec::resample(&pcm_native, self.settings.synthesis_rate, TELEPHONY_RATE)
            .map_err(anyhow::Error::msg)
            .context("resampling synthesized audio")?;
        let ulaw = codec::pcm_to_ulaw(&pcm_line)
            .map_err(anyhow::Error::msg)
            .context("encoding synthesized audio")?;

        // One frame would overrun the transport's buffer and play back as a
        // burst; discrete chunks with a short sleep approximate real time.
        for chunk in ulaw.chunks(self.settings.chunk_bytes) {
            sink.send_media(BASE64.encode(chunk))
                .await
                .context("sending audio chunk")?;
            tokio::time::sleep(self.settings.chunk_interval).await;
        }

        sink.send_mark(PLAYBACK_MARK)
            .await
            .context("sending playback mark")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::CallParams;
    use crate::broadcast::NullTranscriptSink;
    use anyhow::anyhow;
    use std::sync::Mutex;

    struct FakeTranscriber {
        text: String,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, _wav: Vec<u8>) -> Result<String> {
            Ok(self.text.clone())
        }
    }

    struct FakeGenerator {
        reply: String,
        delay: Duration,
    }

    #[async_trait]
    impl ReplyGenerator for FakeGenerator {
        async fn generate(
            &self,
            _params: &CallParams,
            _history: &[crate::audio::session::TranscriptEntry],
            _kind: TurnKind,
        ) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl ReplyGenerator for FailingGenerator {
        async fn generate(
            &self,
            _params: &CallParams,
            _history: &[crate::audio::session::TranscriptEntry],
            _kind: TurnKind,
        ) -> Result<String> {
            Err(anyhow!("generation unavailable"))
        }
    }

    struct FakeSynthesizer {
        pcm: Vec<u8>,
    }

    #[async_trait]
    impl Synthesizer for FakeSynthesizer {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
            Ok(self.pcm.clone())
        }
    }

    #[derive(Debug, PartialEq)]
    enum SinkEvent {
        Media(String),
        Mark(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<SinkEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send_media(&self, payload: String) -> Result<()> {
            self.events.lock().unwrap().push(SinkEvent::Media(payload));
            Ok(())
        }

        async fn send_mark(&self, name: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Mark(name.to_string()));
            Ok(())
        }
    }

    fn test_settings() -> AudioSettings {
        AudioSettings {
            recognizer_rate: 16000,
            // Matching the telephony rate keeps synthesized byte counts
            // predictable in assertions (no resampling leg).
            synthesis_rate: TELEPHONY_RATE,
            chunk_bytes: 640,
            chunk_interval: Duration::ZERO,
        }
    }

    fn pipeline_with(
        transcribed: &str,
        reply: &str,
        synth_pcm_bytes: usize,
        generator_delay: Duration,
    ) -> TurnPipeline {
        TurnPipeline::new(
            Arc::new(FakeTranscriber {
                text: transcribed.to_string(),
            }),
            Arc::new(FakeGenerator {
                reply: reply.to_string(),
                delay: generator_delay,
            }),
            Arc::new(FakeSynthesizer {
                pcm: vec![0u8; synth_pcm_bytes],
            }),
            Arc::new(NullTranscriptSink),
            test_settings(),
        )
    }

    fn session() -> CallSession {
        CallSession::new(
            "MZ123".to_string(),
            "CA456".to_string(),
            CallParams::default(),
            16000,
        )
    }

    #[tokio::test]
    async fn test_initial_turn_emits_media_then_single_mark() {
        // 3200 PCM bytes = 1600 mu-law bytes = two full chunks plus a tail.
        let pipeline = pipeline_with("", "Hello, this is an assistant.", 3200, Duration::ZERO);
        let session = session();
        let sink = RecordingSink::default();

        pipeline.run_turn(&session, &sink, TurnKind::Initial).await;

        let events = sink.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], SinkEvent::Media(_)));
        assert!(matches!(events[1], SinkEvent::Media(_)));
        assert!(matches!(events[2], SinkEvent::Media(_)));
        assert_eq!(events[3], SinkEvent::Mark("audio_complete".to_string()));

        let transcript = session.transcript_snapshot();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, Role::Assistant);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_reactive_turn_appends_user_then_assistant() {
        let pipeline = pipeline_with(
            "We have Tuesday at nine.",
            "Tuesday at nine works, thank you.",
            640,
            Duration::ZERO,
        );
        let session = session();
        session.push_audio(&vec![0u8; 16000]);
        let sink = RecordingSink::default();

        pipeline.run_turn(&session, &sink, TurnKind::Reactive).await;

        let transcript = session.transcript_snapshot();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[0].text, "We have Tuesday at nine.");
        assert_eq!(transcript[1].role, Role::Assistant);

        let events = sink.events();
        assert!(events.len() >= 2);
        assert_eq!(*events.last().unwrap(), SinkEvent::Mark("audio_complete".to_string()));
        assert!(session.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_noise_transcription_aborts_turn_silently() {
        for noise in ["", "a", " a "] {
            let pipeline = pipeline_with(noise, "should never be said", 640, Duration::ZERO);
            let session = session();
            session.push_audio(&vec![0u8; 16000]);
            let sink = RecordingSink::default();

            pipeline.run_turn(&session, &sink, TurnKind::Reactive).await;

            assert_eq!(session.transcript_len(), 0, "noise {:?}", noise);
            assert!(sink.events().is_empty(), "noise {:?}", noise);
            assert!(!session.is_busy());
        }
    }

    #[tokio::test]
    async fn test_reactive_turn_with_empty_accumulator_is_a_no_op() {
        let pipeline = pipeline_with("anything", "anything", 640, Duration::ZERO);
        let session = session();
        let sink = RecordingSink::default();

        pipeline.run_turn(&session, &sink, TurnKind::Reactive).await;

        assert_eq!(session.transcript_len(), 0);
        assert!(sink.events().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_exactly_one_turn() {
        let pipeline = pipeline_with("", "One reply only.", 640, Duration::from_millis(20));
        let session = session();
        let sink = RecordingSink::default();

        tokio::join!(
            pipeline.run_turn(&session, &sink, TurnKind::Initial),
            pipeline.run_turn(&session, &sink, TurnKind::Initial),
        );

        let marks = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event, SinkEvent::Mark(_)))
            .count();
        assert_eq!(marks, 1);
        assert_eq!(session.transcript_len(), 1);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_collaborator_failure_releases_guard() {
        let pipeline = TurnPipeline::new(
            Arc::new(FakeTranscriber {
                text: "Can I help you?".to_string(),
            }),
            Arc::new(FailingGenerator),
            Arc::new(FakeSynthesizer { pcm: vec![0u8; 64] }),
            Arc::new(NullTranscriptSink),
            test_settings(),
        );
        let session = session();
        session.push_audio(&vec![0u8; 16000]);
        let sink = RecordingSink::default();

        pipeline.run_turn(&session, &sink, TurnKind::Reactive).await;

        // The utterance landed before the failing stage; no audio went out,
        // and the session is free for the next trigger.
        assert_eq!(session.transcript_len(), 1);
        assert!(sink.events().is_empty());
        assert!(!session.is_busy());
        assert!(session.try_begin_turn());
    }

    #[tokio::test]
    async fn test_chunks_decode_back_to_synthesized_length() {
        let pipeline = pipeline_with("", "reply", 1600, Duration::ZERO);
        let session = session();
        let sink = RecordingSink::default();

        pipeline.run_turn(&session, &sink, TurnKind::Initial).await;

        let mut total = 0;
        for event in sink.events() {
            if let SinkEvent::Media(payload) = event {
                total += BASE64.decode(payload).unwrap().len();
            }
        }
        // 1600 PCM bytes -> 800 samples -> 800 mu-law bytes.
        assert_eq!(total, 800);
    }
}
