//! # Reply Generation Client
//!
//! Streams a reply from an Ollama-compatible `/api/generate` endpoint.
//!
//! ## Wire format:
//! The response body is newline-delimited JSON, one object per token batch:
//! `{"response": "Hel", "done": false}` ... `{"response": "", "done": true}`
//!
//! ## Cancellation:
//! The returned stream checks the turn's cancellation token before yielding
//! each fragment and before reading more of the body. Dropping the stream
//! drops the HTTP response, which closes the connection to the model server.

use crate::config::ModelsConfig;
use crate::models::{FragmentStream, ReplyGenerator};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    system_prompt: Option<String>,
}

impl OllamaGenerator {
    pub fn new(config: &ModelsConfig) -> Result<Self> {
        // No total timeout: a reply streams for as long as the model keeps talking.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build generation HTTP client")?;

        let system_prompt = Some(config.system_prompt.trim().to_string()).filter(|p| !p.is_empty());

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", config.llm_url.trim_end_matches('/')),
            model: config.llm_model.clone(),
            system_prompt,
        })
    }
}

#[async_trait]
impl ReplyGenerator for OllamaGenerator {
    async fn generate(&self, prompt: &str, cancel: CancellationToken) -> Result<FragmentStream> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            system: self.system_prompt.as_deref(),
            stream: true,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("Generation request failed")?
            .error_for_status()
            .context("Generation service returned an error status")?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(anyhow::Error::from))
            .boxed();

        Ok(fragment_stream(body, cancel))
    }
}

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        Some(rest).filter(|line| !line.is_empty())
    }
}

struct StreamState {
    body: BoxStream<'static, Result<Vec<u8>>>,
    lines: LineBuffer,
    ready: VecDeque<Result<String>>,
    cancel: CancellationToken,
    finished: bool,
}

impl StreamState {
    /// Queue the fragments carried by one NDJSON line.
    fn accept_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<GenerateChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.ready.push_back(Err(anyhow!("Generation failed: {}", error)));
                    self.finished = true;
                    return;
                }
                if !chunk.response.is_empty() {
                    self.ready.push_back(Ok(chunk.response));
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(err) => {
                warn!("Skipping malformed generation line: {}", err);
            }
        }
    }
}

/// Turn a raw NDJSON body into a cancellable stream of reply fragments.
fn fragment_stream(
    body: BoxStream<'static, Result<Vec<u8>>>,
    cancel: CancellationToken,
) -> FragmentStream {
    let state = StreamState {
        body,
        lines: LineBuffer::default(),
        ready: VecDeque::new(),
        cancel,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() {
                debug!("Generation stream stopped by cancellation");
                return None;
            }
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for line in state.lines.push(&bytes) {
                        if state.finished {
                            break;
                        }
                        state.accept_line(&line);
                    }
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    if let Some(line) = state.lines.finish() {
                        state.accept_line(&line);
                    }
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
