//! # Audio Module
//!
//! Everything between the telephony wire format and the speech engines:
//! the mu-law/PCM codec, the inbound accumulator, and per-call session
//! state.
//!
//! ## Key Components:
//! - **Codec**: mu-law <-> linear PCM, resampling, WAV framing
//! - **Inbound Buffer**: threshold-gated accumulator of line audio
//! - **Call Session**: transcript, parameters, and the single-flight guard
//!
//! ## Audio Formats:
//! - **Line**: 8-bit mu-law, 8 kHz, mono (1 byte per sample)
//! - **Recognizer input**: 16-bit LE PCM, 16 kHz, mono, WAV-wrapped
//! - **Synthesizer output**: 16-bit LE PCM at the engine's native rate

pub mod buffer;    // Threshold-gated inbound accumulator
pub mod codec;     // mu-law/PCM conversions and WAV framing
pub mod session;   // Per-call state and session bookkeeping
