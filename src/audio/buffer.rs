//! # Inbound Audio Accumulator
//!
//! Collects raw mu-law bytes from the telephony stream until there is enough
//! audio to be worth one speech-to-text round trip. The recognizer is a
//! request/response call rather than a streaming one, so a minimum buffer
//! amortizes call overhead and yields comprehensible utterance fragments.
//!
//! There is deliberately no silence or voice-activity detection here: the
//! fixed byte threshold is the only segmentation signal, which means speech
//! can be split mid-word across processing cycles. That limitation is part
//! of the design, not something this module tries to paper over.

use std::sync::Mutex;

use crate::audio::codec::TELEPHONY_RATE;

/// Byte accumulator for not-yet-processed inbound telephony audio.
///
/// ## Thread Safety:
/// The WebSocket actor appends while a spawned pipeline task drains, so the
/// underlying storage sits behind a `Mutex`. Draining swaps the whole buffer
/// out in one locked operation; there is no partial read.
pub struct InboundAudioBuffer {
    /// Accumulated mu-law bytes (1 byte per sample at the telephony rate)
    buffer: Mutex<Vec<u8>>,

    /// Byte count at which a processing cycle should be triggered
    threshold_bytes: usize,
}

impl InboundAudioBuffer {
    /// Create an empty accumulator that reports readiness at `threshold_bytes`.
    ///
    /// At the 8 kHz telephony rate, 16000 bytes is roughly two seconds of
    /// audio, which is the default trigger point.
    pub fn new(threshold_bytes: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(threshold_bytes)),
            threshold_bytes,
        }
    }

    /// Append decoded payload bytes, returning the new accumulated length.
    pub fn append(&self, data: &[u8]) -> usize {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(data);
        buffer.len()
    }

    /// Whether enough audio has accumulated to start a processing cycle.
    pub fn is_ready(&self) -> bool {
        self.len() >= self.threshold_bytes
    }

    /// Take everything accumulated so far, leaving the buffer empty.
    ///
    /// The swap happens under the lock, so bytes arriving concurrently land
    /// in the fresh buffer and are picked up by the next cycle.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    /// Current accumulated length in bytes.
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duration of the accumulated audio in seconds (1 byte per sample).
    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / TELEPHONY_RATE as f64
    }
}
