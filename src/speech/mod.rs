//! # Speech Collaborators
//!
//! Narrow capability interfaces over the external speech engines, plus
//! their production HTTP implementations. The turn pipeline only ever sees
//! the traits, so tests run against deterministic fakes with no network.
//!
//! ## Key Components:
//! - **Transcriber**: WAV-wrapped PCM in, recognized text out
//! - **Synthesizer**: reply text in, raw linear PCM out

pub mod stt;   // Speech-to-text client
pub mod tts;   // Speech-synthesis client

pub use stt::{ElevenLabsStt, Transcriber};
pub use tts::{ElevenLabsTts, Synthesizer};
