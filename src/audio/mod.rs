//! # Audio Handling
//!
//! Inbound microphone audio and outbound synthesized audio.
//!
//! ## Audio Format Requirements:
//! - **Inbound**: 16kHz, 16-bit little-endian PCM, mono, arbitrary chunk size
//! - **Outbound**: 22050Hz, 16-bit PCM, mono, framed as WAV
//!
//! ## Key Components:
//! - **Segmenter**: buffers inbound audio and detects end-of-utterance
//! - **PCM helpers**: sample decoding, float normalization, WAV framing

pub mod pcm;        // PCM conversion and WAV framing
pub mod segmenter;  // End-of-utterance detection

pub use segmenter::{Utterance, UtteranceSegmenter};
