//! # Telephony Audio Codec
//!
//! Pure conversion functions between the 8-bit logarithmic encoding used on
//! the phone line (G.711 mu-law) and the 16-bit linear PCM expected by the
//! speech engines, plus sample-rate conversion and minimal WAV framing.
//!
//! ## Key Functions:
//! - **mu-law decode**: 256-entry lookup table, one i16 sample per input byte
//! - **mu-law encode**: sign/clip/bias/exponent/mantissa packing, bit-inverted
//! - **Resampling**: single-pass linear interpolation (no anti-alias filter)
//! - **WAV framing**: 44-byte RIFF header for the transcription upload
//!
//! Everything here is stateless and deterministic; nothing in this module
//! touches a session or performs I/O.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Sample rate of the telephony line (mu-law, 8 kHz).
pub const TELEPHONY_RATE: u32 = 8000;

/// Encoding bias added before the exponent search, per the G.711 definition.
const ULAW_BIAS: i32 = 0x84;

/// Largest linear magnitude representable after biasing; louder samples clip.
const ULAW_CLIP: i32 = 32635;

/// Expansion table: mu-law byte -> signed 16-bit linear sample.
///
/// Built once at compile time by inverting the byte, splitting it into
/// sign / 3-bit exponent / 4-bit mantissa, and reconstructing the biased
/// magnitude `((mantissa << 3) + 0x84) << exponent - 0x84`.
const fn build_ulaw_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        let mu = !(i as u8);
        let sign = mu & 0x80;
        let exponent = ((mu >> 4) & 0x07) as u32;
        let mantissa = (mu & 0x0F) as i32;
        let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
        table[i] = if sign != 0 {
            -magnitude as i16
        } else {
            magnitude as i16
        };
        i += 1;
    }
    table
}

static ULAW_TO_LINEAR: [i16; 256] = build_ulaw_table();

/// Decode mu-law bytes to signed 16-bit little-endian PCM bytes.
///
/// Defined for all 256 input values; output is exactly twice as long as the
/// input (one i16 sample per mu-law byte).
pub fn ulaw_to_pcm(ulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(ulaw.len() * 2);
    for &byte in ulaw {
        // Writing into a Vec cannot fail.
        pcm.write_i16::<LittleEndian>(ULAW_TO_LINEAR[byte as usize])
            .unwrap();
    }
    pcm
}

/// Compress one linear sample to a mu-law byte.
///
/// ## Steps:
/// 1. Extract the sign bit and work on the magnitude
/// 2. Clip to the largest representable magnitude (32635)
/// 3. Add the standard bias (0x84)
/// 4. Find the exponent: highest set bit under a moving mask from 0x4000
/// 5. Take the 4-bit mantissa below the exponent position
/// 6. Pack sign|exponent|mantissa and complement (the line format is inverted)
fn linear_to_ulaw(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign = ((value >> 8) & 0x80) as u8;
    if sign != 0 {
        value = -value;
    }
    if value > ULAW_CLIP {
        value = ULAW_CLIP;
    }
    value += ULAW_BIAS;

    let mut exponent: u32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (value & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;

    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Encode signed 16-bit little-endian PCM bytes to mu-law bytes.
///
/// The compression is lossy by design (the law is non-linear); encoding a
/// decoded mu-law value always lands back on the same quantization level.
///
/// An odd byte count means the caller handed us half a sample; that is a
/// contract violation, not a recoverable condition, so it is rejected
/// rather than silently truncated.
pub fn pcm_to_ulaw(pcm: &[u8]) -> Result<Vec<u8>, String> {
    let samples = read_samples(pcm)?;
    Ok(samples.iter().map(|&s| linear_to_ulaw(s)).collect())
}

/// Convert PCM between sample rates with single-pass linear interpolation.
///
/// ## Behavior:
/// - Equal rates return the input unchanged
/// - Output length is `floor(input_samples / (from_rate / to_rate))`
/// - Each output sample interpolates between its floor and ceil source
///   neighbors, clamped at the end of the input
///
/// No filtering beyond the interpolation itself; for voice-call audio the
/// latency win outweighs the aliasing cost.
pub fn resample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, String> {
    if from_rate == to_rate {
        return Ok(pcm.to_vec());
    }

    let src = read_samples(pcm)?;
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (src.len() as f64 / ratio) as usize;

    let mut out = Vec::with_capacity(out_len * 2);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let lo = src_pos as usize;
        let hi = (lo + 1).min(src.len() - 1);
        let frac = src_pos - lo as f64;
        let value = src[lo] as f64 * (1.0 - frac) + src[hi] as f64 * frac;
        out.write_i16::<LittleEndian>(value as i16).unwrap();
    }
    Ok(out)
}

/// Wrap raw signed 16-bit little-endian PCM in a minimal WAV container.
///
/// Produces exactly `44 + pcm.len()` bytes: RIFF/WAVE header, a 16-byte
/// `fmt ` chunk (PCM format tag, channel count, sample rate, byte rate,
/// block alignment, bits per sample), then the `data` chunk. All multi-byte
/// fields are little-endian. The transcription collaborator requires a
/// self-describing container rather than a raw stream.
pub fn wrap_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let bytes_per_sample = (bits_per_sample / 8) as u32;
    let byte_rate = sample_rate * channels as u32 * bytes_per_sample;
    let block_align = channels * (bits_per_sample / 8);
    let data_size = pcm.len() as u32;

    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_size).unwrap();
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap(); // PCM format tag
    out.write_u16::<LittleEndian>(channels).unwrap();
    out.write_u32::<LittleEndian>(sample_rate).unwrap();
    out.write_u32::<LittleEndian>(byte_rate).unwrap();
    out.write_u16::<LittleEndian>(block_align).unwrap();
    out.write_u16::<LittleEndian>(bits_per_sample).unwrap();
    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_size).unwrap();
    out.extend_from_slice(pcm);
    out
}

/// Read little-endian 16-bit samples out of a raw PCM byte buffer.
fn read_samples(pcm: &[u8]) -> Result<Vec<i16>, String> {
    if pcm.len() % 2 != 0 {
        return Err(format!(
            "PCM buffer length must be even for 16-bit samples, got {} bytes",
            pcm.len()
        ));
    }
    let mut cursor = Cursor::new(pcm);
    let mut samples = Vec::with_capacity(pcm.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(byte: u8) -> i16 {
        ULAW_TO_LINEAR[byte as usize]
    }

    #[test]
    fn test_decode_table_reference_values() {
        // Extremes and the two zero codes of the mu-law table.
        assert_eq!(decode_one(0x00), -32124);
        assert_eq!(decode_one(0x80), 32124);
        assert_eq!(decode_one(0xFF), 0);
        assert_eq!(decode_one(0x7F), 0);

        // Sign split: 0x00..=0x7F decode non-positive, 0x80..=0xFF non-negative.
        for b in 0x00..=0x7Fu8 {
            assert!(decode_one(b) <= 0, "byte {:#04x} decoded positive", b);
        }
        for b in 0x80..=0xFFu8 {
            assert!(decode_one(b) >= 0, "byte {:#04x} decoded negative", b);
        }

        // Within each sign half the table is monotonic in magnitude.
        for b in 0x00..0x7Fu8 {
            assert!(decode_one(b) <= decode_one(b + 1));
        }
        for b in 0x80..0xFFu8 {
            assert!(decode_one(b) >= decode_one(b + 1));
        }
    }

    #[test]
    fn test_encode_inverts_decode_for_all_bytes() {
        for b in 0..=255u8 {
            let linear = decode_one(b);
            let reencoded = linear_to_ulaw(linear);
            // Every value the table can produce sits exactly on a
            // quantization level, so re-decoding recovers it precisely.
            assert_eq!(
                decode_one(reencoded),
                linear,
                "byte {:#04x}: decode {} re-encoded to {:#04x}",
                b,
                linear,
                reencoded
            );
            // The byte itself round-trips except the negative-zero alias
            // (0x7F and 0xFF both decode to 0; zero encodes as 0xFF).
            if b != 0x7F {
                assert_eq!(reencoded, b);
            }
        }
    }

    #[test]
    fn test_encode_clips_extremes() {
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        assert_eq!(linear_to_ulaw(0), 0xFF);
    }

    #[test]
    fn test_decode_output_length() {
        let ulaw = vec![0x00u8, 0x7F, 0x80, 0xFF];
        let pcm = ulaw_to_pcm(&ulaw);
        assert_eq!(pcm.len(), 8);
    }

    #[test]
    fn test_encode_rejects_odd_length() {
        assert!(pcm_to_ulaw(&[0u8; 3]).is_err());
        assert!(pcm_to_ulaw(&[0u8; 4]).is_ok());
    }

    #[test]
    fn test_resample_identity_at_equal_rates() {
        let pcm: Vec<u8> = (0..64u8).collect();
        let out = resample(&pcm, 8000, 8000).unwrap();
        assert_eq!(out, pcm);
    }

    #[test]
    fn test_resample_rejects_odd_length() {
        assert!(resample(&[0u8; 5], 8000, 16000).is_err());
    }

    #[test]
    fn test_resample_output_lengths() {
        // 100 samples upsampled 8 kHz -> 16 kHz doubles the count.
        let pcm = vec![0u8; 200];
        let up = resample(&pcm, 8000, 16000).unwrap();
        assert_eq!(up.len() / 2, 200);

        // 2205 samples downsampled 22050 Hz -> 8000 Hz: floor(2205 / 2.75625).
        let pcm = vec![0u8; 4410];
        let down = resample(&pcm, 22050, 8000).unwrap();
        assert_eq!(down.len() / 2, 800);
    }

    #[test]
    fn test_resample_preserves_constant_signal() {
        let mut pcm = Vec::new();
        for _ in 0..100 {
            pcm.write_i16::<LittleEndian>(1000).unwrap();
        }
        let out = resample(&pcm, 8000, 16000).unwrap();
        let mut cursor = Cursor::new(out.as_slice());
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            assert_eq!(sample, 1000);
        }
    }

    #[test]
    fn test_wav_header_layout() {
        let pcm = vec![1u8, 2, 3, 4, 5, 6];
        let wav = wrap_wav(&pcm, 16000, 1, 16);

        assert_eq!(wav.len(), 44 + pcm.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let riff_size = u32::from_le_bytes(wav[4..8].try_into().unwrap());
        assert_eq!(riff_size, 36 + pcm.len() as u32);

        let format_tag = u16::from_le_bytes(wav[20..22].try_into().unwrap());
        let channels = u16::from_le_bytes(wav[22..24].try_into().unwrap());
        let rate = u32::from_le_bytes(wav[24..28].try_into().unwrap());
        let byte_rate = u32::from_le_bytes(wav[28..32].try_into().unwrap());
        let block_align = u16::from_le_bytes(wav[32..34].try_into().unwrap());
        let bits = u16::from_le_bytes(wav[34..36].try_into().unwrap());
        let data_size = u32::from_le_bytes(wav[40..44].try_into().unwrap());

        assert_eq!(format_tag, 1);
        assert_eq!(channels, 1);
        assert_eq!(rate, 16000);
        assert_eq!(byte_rate, 32000);
        assert_eq!(block_align, 2);
        assert_eq!(bits, 16);
        assert_eq!(data_size, pcm.len() as u32);
        assert_eq!(&wav[44..], pcm.as_slice());
    }
}
