//! Energy-threshold voice activity detection.

use crate::audio::pcm::{self, SAMPLE_WIDTH};
use crate::models::VoiceActivityDetector;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shared, runtime-adjustable speech threshold.
///
/// Holds the bit pattern of an `f32`.
#[derive(Debug, Clone)]
pub struct VadThreshold(Arc<AtomicU32>);

impl VadThreshold {
    pub fn new(threshold: f32) -> Self {
        Self(Arc::new(AtomicU32::new(threshold.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, threshold: f32) {
        self.0.store(threshold.to_bits(), Ordering::Relaxed);
    }
}

/// Classifies a frame as speech when its RMS level reaches the current threshold.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: VadThreshold,
}

impl EnergyVad {
    pub fn new(threshold: VadThreshold) -> Self {
        Self { threshold }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&self, frame: &[u8], sample_rate: u32) -> Result<bool> {
        if sample_rate == 0 {
            return Err(anyhow!("Invalid sample rate 0"));
        }
        if frame.is_empty() || frame.len() % SAMPLE_WIDTH != 0 {
            return Err(anyhow!(
                "Frame of {} bytes is not a whole number of 16-bit samples",
                frame.len()
            ));
        }
        Ok(pcm::rms(frame) >= self.threshold.get())
    }
}
