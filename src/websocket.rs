//! # Media-Stream WebSocket Handler
//!
//! The streaming session controller: one actor per duplex telephony
//! connection, alive for the lifetime of one call. Consumes the tagged
//! inbound event protocol, owns the call session, and launches turn-pipeline
//! executions without ever blocking the event loop on a network round trip.
//!
//! ## WebSocket Protocol (JSON text frames, tagged by `event`):
//! - **Inbound**: `connected` (diagnostic), `start` (stream/call ids +
//!   custom parameters), `media` (base64 mu-law payload), `stop`, `mark`
//! - **Outbound**: `media` (base64 mu-law chunk) and `mark` (playback
//!   complete), both echoing the stream id
//!
//! ## Lifecycle:
//! Connection accept -> `start` creates the session and schedules the
//! opening turn after a short settle delay -> `media` events accumulate
//! audio and trigger reactive turns at the byte threshold -> close releases
//! the session. In-flight turns are never force-cancelled; their sends on a
//! dead connection simply fail and are logged.

use crate::audio::session::{CallParams, CallSession, SessionManager};
use crate::config::AppConfig;
use crate::pipeline::{OutboundSink, TurnKind, TurnPipeline};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Inbound transport events, tagged by the `event` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Transport-level hello; nothing in the payload is consumed
    Connected,

    /// Call start: identifiers plus caller-supplied custom parameters
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: String,
        #[serde(default)]
        start: StartInfo,
    },

    /// One fragment of inbound telephony audio
    Media { media: MediaPayload },

    /// Transport announces the stream is ending; no forced teardown here
    Stop,

    /// Playback acknowledgement for a mark we sent
    Mark,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartInfo {
    #[serde(rename = "callSid", default)]
    pub call_sid: String,

    #[serde(rename = "customParameters", default)]
    pub custom_parameters: CallParams,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded mu-law audio
    #[serde(default)]
    pub payload: String,
}

/// Outbound transport events.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: OutboundMark,
    },
}

#[derive(Debug, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct OutboundMark {
    pub name: String,
}

/// Text frame queued from a pipeline task onto the connection.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// WebSocket actor bound to one telephony connection.
///
/// ## Actor Model:
/// The mailbox serializes inbound events, so session creation and buffer
/// appends never race each other. Turn executions run in spawned tasks and
/// report back by queueing `SendText` frames on this actor's address.
pub struct MediaStreamSocket {
    /// The live call session, present once `start` has been handled
    session: Option<Arc<CallSession>>,

    /// Turn pipeline shared across connections
    pipeline: Arc<TurnPipeline>,

    /// Session bookkeeping and the concurrent-call ceiling
    session_manager: Arc<SessionManager>,

    /// Shared state for call metrics
    app_state: web::Data<AppState>,

    /// Configuration snapshot taken at connection time
    config: AppConfig,
}

impl MediaStreamSocket {
    pub fn new(
        app_state: web::Data<AppState>,
        pipeline: Arc<TurnPipeline>,
        session_manager: Arc<SessionManager>,
    ) -> Self {
        let config = app_state.get_config();
        Self {
            session: None,
            pipeline,
            session_manager,
            app_state,
            config,
        }
    }

    /// Handle the `start` event: build the session and schedule the opening
    /// statement after a short delay so the line can settle before we speak.
    fn handle_start(&mut self, stream_sid: String, start: StartInfo, ctx: &mut ws::WebsocketContext<Self>) {
        // The transport always assigns a stream id in practice; a generated
        // one keeps session bookkeeping unique if it ever arrives blank.
        let stream_sid = if stream_sid.is_empty() {
            warn!("Start event carried no stream id, generating one");
            uuid::Uuid::new_v4().to_string()
        } else {
            stream_sid
        };

        info!(
            stream_sid = %stream_sid,
            call_sid = %start.call_sid,
            provider = %start.custom_parameters.provider_name,
            "Media stream started"
        );

        let session = Arc::new(CallSession::new(
            stream_sid,
            start.call_sid,
            start.custom_parameters,
            self.config.audio.buffer_threshold_bytes,
        ));

        if let Err(err) = self.session_manager.register(session.clone()) {
            warn!("Rejecting call: {}", err);
            ctx.stop();
            return;
        }

        self.session = Some(session);
        self.app_state.increment_active_calls();

        let delay = Duration::from_millis(self.config.audio.initial_turn_delay_ms);
        ctx.run_later(delay, |act, ctx| {
            act.spawn_turn(ctx, TurnKind::Initial);
        });
    }

    /// Handle a `media` event: decode, accumulate, and trigger a reactive
    /// turn once the threshold is reached and no turn is in flight.
    fn handle_media(&mut self, media: MediaPayload, ctx: &mut ws::WebsocketContext<Self>) {
        let session = match &self.session {
            Some(session) => session,
            None => {
                debug!("Dropping media event before start");
                return;
            }
        };

        let audio = match BASE64.decode(media.payload.as_bytes()) {
            Ok(audio) => audio,
            Err(err) => {
                warn!("Ignoring undecodable media payload: {}", err);
                return;
            }
        };

        if session.push_audio(&audio) {
            self.spawn_turn(ctx, TurnKind::Reactive);
        }
    }

    /// Launch one turn-pipeline execution as an independent task.
    ///
    /// The single-flight guard inside the pipeline makes redundant launches
    /// harmless, so this never has to coordinate with in-flight work.
    fn spawn_turn(&self, ctx: &mut ws::WebsocketContext<Self>, kind: TurnKind) {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return,
        };
        let pipeline = self.pipeline.clone();
        let sink = ConnectionSink {
            addr: ctx.address(),
            stream_sid: session.stream_sid.clone(),
        };

        tokio::spawn(async move {
            pipeline.run_turn(&session, &sink, kind).await;
        });
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Media stream connection opened");
    }

    /// Release the session when the connection goes away, normally or not.
    /// Any turn still running keeps the session `Arc` alive until it
    /// finishes; its frames land in a dead mailbox and are logged.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.session.take() {
            self.session_manager.remove(&session.stream_sid);
            self.app_state.decrement_active_calls();
            info!(
                stream_sid = %session.stream_sid,
                transcript_entries = session.transcript_len(),
                "Media stream connection closed, session released"
            );
        } else {
            info!("Media stream connection closed before start");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<StreamEvent>(&text) {
                Ok(StreamEvent::Connected) => {
                    info!("Telephony media stream connected");
                }
                Ok(StreamEvent::Start { stream_sid, start }) => {
                    self.handle_start(stream_sid, start, ctx);
                }
                Ok(StreamEvent::Media { media }) => {
                    self.handle_media(media, ctx);
                }
                Ok(StreamEvent::Stop) => {
                    info!("Telephony media stream stopped");
                }
                Ok(StreamEvent::Mark) => {
                    debug!("Playback mark acknowledged");
                }
                Err(err) => {
                    // Malformed or unknown events are ignored, not fatal.
                    warn!("Ignoring unparseable stream event: {}", err);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Ignoring unexpected binary frame; protocol is JSON text");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("Media stream closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("Media stream protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Outbound sink that queues frames on the connection actor's mailbox.
struct ConnectionSink {
    addr: Addr<MediaStreamSocket>,
    stream_sid: String,
}

impl ConnectionSink {
    fn queue(&self, event: &OutboundEvent) -> anyhow::Result<()> {
        let json = serde_json::to_string(event)?;
        self.addr
            .try_send(SendText(json))
            .map_err(|err| anyhow!("connection gone: {}", err))
    }
}

#[async_trait]
impl OutboundSink for ConnectionSink {
    async fn send_media(&self, payload: String) -> anyhow::Result<()> {
        self.queue(&OutboundEvent::Media {
            stream_sid: self.stream_sid.clone(),
            media: OutboundMedia { payload },
        })
    }

    async fn send_mark(&self, name: &str) -> anyhow::Result<()> {
        self.queue(&OutboundEvent::Mark {
            stream_sid: self.stream_sid.clone(),
            mark: OutboundMark {
                name: name.to_string(),
            },
        })
    }
}

/// HTTP -> WebSocket upgrade for the media-stream endpoint.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    pipeline: web::Data<TurnPipeline>,
    session_manager: web::Data<SessionManager>,
) -> ActixResult<HttpResponse> {
    info!(
        "New media-stream connection from {:?}",
        req.connection_info().peer_addr()
    );

    let socket = MediaStreamSocket::new(
        app_state,
        pipeline.into_inner(),
        session_manager.into_inner(),
    );
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_event_parses_wire_shape() {
        let raw = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ18ad3ab5a668481ce02b83e7395059f0",
            "start": {
                "accountSid": "AC0000",
                "callSid": "CA5c6b0a2c",
                "customParameters": {
                    "providerName": "Acme Dental",
                    "service": "checkup",
                    "userName": "Nora",
                    "purpose": "new_appointment"
                }
            }
        }"#;

        match serde_json::from_str::<StreamEvent>(raw).unwrap() {
            StreamEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ18ad3ab5a668481ce02b83e7395059f0");
                assert_eq!(start.call_sid, "CA5c6b0a2c");
                assert_eq!(start.custom_parameters.provider_name, "Acme Dental");
                assert_eq!(start.custom_parameters.user_name, "Nora");
                // Absent parameters fall back to their defaults.
                assert_eq!(start.custom_parameters.time_preference, "flexible");
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_start_event_tolerates_missing_payload() {
        let event: StreamEvent = serde_json::from_str(r#"{"event":"start"}"#).unwrap();
        match event {
            StreamEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "");
                assert_eq!(start.call_sid, "");
                assert_eq!(start.custom_parameters.provider_name, "the business");
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_media_event_carries_base64_payload() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"event":"media","media":{"payload":"//8A"}}"#).unwrap();
        match event {
            StreamEvent::Media { media } => {
                assert_eq!(BASE64.decode(media.payload).unwrap(), vec![0xFF, 0xFF, 0x00]);
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_a_parse_error() {
        assert!(serde_json::from_str::<StreamEvent>(r#"{"event":"dtmf"}"#).is_err());
        assert!(serde_json::from_str::<StreamEvent>("not json").is_err());
    }

    #[test]
    fn test_outbound_media_serialization() {
        let event = OutboundEvent::Media {
            stream_sid: "MZ1".to_string(),
            media: OutboundMedia {
                payload: "AAAA".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"media","streamSid":"MZ1","media":{"payload":"AAAA"}}"#
        );
    }

    #[test]
    fn test_outbound_mark_serialization() {
        let event = OutboundEvent::Mark {
            stream_sid: "MZ1".to_string(),
            mark: OutboundMark {
                name: "audio_complete".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"mark","streamSid":"MZ1","mark":{"name":"audio_complete"}}"#
        );
    }
}
