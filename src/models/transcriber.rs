//! # Transcription Client
//!
//! Speech-to-text through an OpenAI-compatible `/v1/audio/transcriptions`
//! endpoint (whisper.cpp server, faster-whisper-server, and similar).
//!
//! ## Request:
//! Multipart form with the utterance as a 16kHz mono WAV file plus the model name.
//!
//! ## Response:
//! `{"text": "..."}`. Whitespace-only text counts as "nothing heard".

use crate::audio::pcm::{self, INPUT_SAMPLE_RATE};
use crate::config::ModelsConfig;
use crate::models::Transcriber;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpTranscriber {
    pub fn new(config: &ModelsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build transcription HTTP client")?;

        Ok(Self {
            client,
            url: config.transcription_url.clone(),
            model: config.transcription_model.clone(),
        })
    }
}

/// Re-quantize normalized samples to 16-bit PCM bytes.
fn float_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
            scaled.to_le_bytes()
        })
        .collect()
}

/// Normalize a transcript; `None` when nothing was recognized.
fn clean_transcript(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, samples: &[f32]) -> Result<Option<String>> {
        if samples.is_empty() {
            return Ok(None);
        }

        let start_time = Instant::now();
        let wav = pcm::wav_from_pcm16(&float_to_pcm16_bytes(samples), INPUT_SAMPLE_RATE);

        let file = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file);

        let response: TranscriptionResponse = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?
            .error_for_status()
            .context("Transcription service returned an error status")?
            .json()
            .await
            .context("Transcription response was not valid JSON")?;

        debug!(
            "Transcribed {:.2}s of audio in {}ms",
            samples.len() as f64 / INPUT_SAMPLE_RATE as f64,
            start_time.elapsed().as_millis()
        );

        Ok(clean_transcript(&response.text))
    }
}
