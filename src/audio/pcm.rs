//! # PCM Conversion and WAV Framing
//!
//! Helpers shared by the segmenter, the transcription client and the
//! synthesis stage.
//!
//! ## Formats:
//! - **Inbound**: 16-bit little-endian PCM, mono, 16kHz
//! - **Model input**: 32-bit floats normalized to [-1.0, 1.0]
//! - **Outbound**: canonical 44-byte-header WAV around raw PCM

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Sample rate of microphone audio sent by the client.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio returned by the synthesis collaborator.
pub const SYNTH_SAMPLE_RATE: u32 = 22_050;

/// Bytes per 16-bit sample.
pub const SAMPLE_WIDTH: usize = 2;

const WAV_HEADER_LEN: usize = 44;

/// Decode little-endian 16-bit PCM bytes into samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / SAMPLE_WIDTH);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Convert 16-bit PCM bytes to normalized floats for speech recognition.
///
/// ## Conversion:
/// Scales from [-32768, 32767] to [-1.0, 1.0), the range ML audio models expect.
pub fn pcm16_to_float(data: &[u8]) -> Vec<f32> {
    pcm16_samples(data)
        .into_iter()
        .map(|sample| sample as f32 / 32768.0)
        .collect()
}

/// Root-mean-square level of a PCM byte span, on the i16 scale.
pub fn rms(data: &[u8]) -> f32 {
    let samples = pcm16_samples(data);
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Wrap raw mono 16-bit PCM in a WAV container.
///
/// ## Header layout (all little-endian):
/// `RIFF` chunk → `fmt ` chunk (PCM, 1 channel, 16 bits) → `data` chunk
pub fn wav_from_pcm16(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * SAMPLE_WIDTH as u32;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    // Writes into a Vec are infallible.
    let _ = write_wav_header(&mut out, data_len, sample_rate, byte_rate);
    out.extend_from_slice(pcm);
    out
}

fn write_wav_header(
    out: &mut Vec<u8>,
    data_len: u32,
    sample_rate: u32,
    byte_rate: u32,
) -> std::io::Result<()> {
    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(1)?; // PCM
    out.write_u16::<LittleEndian>(1)?; // mono
    out.write_u32::<LittleEndian>(sample_rate)?;
    out.write_u32::<LittleEndian>(byte_rate)?;
    out.write_u16::<LittleEndian>(SAMPLE_WIDTH as u16)?;
    out.write_u16::<LittleEndian>(16)?;

    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_len)?;
    Ok(())
}
