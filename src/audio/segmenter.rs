//! # Utterance Segmentation
//!
//! Accumulates inbound microphone audio and decides when the buffered span is a
//! finished utterance.
//!
//! ## Endpointing rule:
//! After every append, once the buffer holds at least one 30ms frame, the
//! *leading* frame of the buffer is classified by the VAD oracle. When it is
//! not speech and at least one second of audio has accumulated, the whole
//! buffer is emitted as an [`Utterance`] and the buffer is cleared.
//!
//! Only the first frame is ever inspected. A silent lead-in followed by speech
//! closes an utterance as soon as the size threshold is met, and trailing
//! silence after leading speech is never noticed by itself.
//! TODO: replace with a sliding-window endpointer over the newest frames once
//! clients can opt in to the new boundary behavior.

use crate::audio::pcm::{self, INPUT_SAMPLE_RATE, SAMPLE_WIDTH};
use crate::models::VoiceActivityDetector;
use std::sync::Arc;
use tracing::{debug, warn};

/// Duration of the frame handed to the VAD oracle.
pub const FRAME_DURATION_MS: usize = 30;

/// Bytes in one VAD frame: 16kHz × 30ms × 2 bytes = 960.
pub const FRAME_BYTES: usize = INPUT_SAMPLE_RATE as usize * FRAME_DURATION_MS / 1000 * SAMPLE_WIDTH;

/// Minimum buffered audio before an utterance may be closed (1 second).
pub const MIN_UTTERANCE_BYTES: usize = INPUT_SAMPLE_RATE as usize * SAMPLE_WIDTH;

/// One finalized span of user speech, consumed once by transcription.
#[derive(Debug, PartialEq, Eq)]
pub struct Utterance {
    bytes: Vec<u8>,
}

impl Utterance {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.bytes.len() as f64 / (INPUT_SAMPLE_RATE as usize * SAMPLE_WIDTH) as f64
    }

    /// Normalized float samples, the input format of the transcriber.
    pub fn into_float_samples(self) -> Vec<f32> {
        pcm::pcm16_to_float(&self.bytes)
    }
}

/// Per-connection audio accumulator with VAD-based endpointing.
pub struct UtteranceSegmenter {
    buffer: Vec<u8>,
    vad: Arc<dyn VoiceActivityDetector>,
}

impl UtteranceSegmenter {
    pub fn new(vad: Arc<dyn VoiceActivityDetector>) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_UTTERANCE_BYTES * 2),
            vad,
        }
    }

    /// Append audio and return a finished utterance if the buffer now forms one.
    ///
    /// A VAD failure counts as "undecided": nothing is emitted and the buffer is kept.
    pub fn add_audio(&mut self, data: &[u8]) -> Option<Utterance> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() < FRAME_BYTES {
            return None;
        }

        let leading_frame = &self.buffer[..FRAME_BYTES];
        let is_speech = match self.vad.is_speech(leading_frame, INPUT_SAMPLE_RATE) {
            Ok(is_speech) => is_speech,
            Err(err) => {
                warn!("VAD failed, keeping {} buffered bytes: {}", self.buffer.len(), err);
                return None;
            }
        };

        if !is_speech && self.buffer.len() >= MIN_UTTERANCE_BYTES {
            let bytes = std::mem::take(&mut self.buffer);
            debug!("Utterance closed with {} bytes", bytes.len());
            return Some(Utterance { bytes });
        }

        None
    }

    /// Drop all buffered audio (barge-in).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
