//! Text-to-speech over HTTP.
//!
//! POSTs `{"text": ...}` to the configured endpoint and expects mono 16-bit
//! PCM at 22050Hz back. Servers that answer with a WAV file instead have the
//! container stripped so the pipeline can re-frame the samples itself.

use crate::config::ModelsConfig;
use crate::models::SpeechSynthesizer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
}

pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSynthesizer {
    pub fn new(config: &ModelsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build synthesis HTTP client")?;

        Ok(Self {
            client,
            url: config.tts_url.clone(),
        })
    }
}

/// Return the sample data of a RIFF/WAVE payload, or the input unchanged.
fn strip_wav_container(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return bytes;
    }

    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body = offset + 8;
        if id == b"data" {
            let end = body.saturating_add(size).min(bytes.len());
            return bytes[body..end].to_vec();
        }
        // Chunks are padded to even length.
        offset = body.saturating_add(size + (size & 1));
    }
    Vec::new()
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let bytes = self
            .client
            .post(&self.url)
            .json(&SynthesisRequest { text })
            .send()
            .await
            .context("Synthesis request failed")?
            .error_for_status()
            .context("Synthesis service returned an error status")?
            .bytes()
            .await
            .context("Failed to read synthesized audio")?;

        let pcm = strip_wav_container(bytes.to_vec());
        debug!("Synthesized {} bytes of audio for {} chars", pcm.len(), text.len());

        Ok(Some(pcm).filter(|pcm| !pcm.is_empty()))
    }
}
