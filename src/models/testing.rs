//! Scripted collaborators for exercising the turn engine without model servers.

use crate::models::{
    FragmentStream, ModelProvider, ReplyGenerator, SpeechSynthesizer, Transcriber,
    VoiceActivityDetector,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// VAD answering from a queue, then with a fixed fallback.
pub struct ScriptedVad {
    answers: Mutex<VecDeque<Option<bool>>>,
    fallback: Option<bool>,
    calls: AtomicUsize,
}

impl ScriptedVad {
    /// `None` entries make the oracle fail for that call.
    pub fn new(answers: Vec<Option<bool>>, fallback: Option<bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(answer: bool) -> Self {
        Self::new(Vec::new(), Some(answer))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VoiceActivityDetector for ScriptedVad {
    fn is_speech(&self, _frame: &[u8], _sample_rate: u32) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        answer.ok_or_else(|| anyhow!("vad unavailable"))
    }
}

#[derive(Debug, Clone)]
pub enum TranscriptScript {
    Text(String),
    Nothing,
    Fail,
}

pub struct ScriptedTranscriber {
    script: TranscriptScript,
    calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(script: TranscriptScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(TranscriptScript::Text(text.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _samples: &[f32]) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            TranscriptScript::Text(text) => Ok(Some(text.clone())),
            TranscriptScript::Nothing => Ok(None),
            TranscriptScript::Fail => Err(anyhow!("asr offline")),
        }
    }
}

/// Generator yielding fixed fragments.
///
/// With a gate, each fragment waits for one semaphore permit, so a test can
/// hold a turn mid-stream. Waiting ends early when the turn is cancelled.
pub struct ScriptedGenerator {
    fragments: Vec<String>,
    gate: Option<Arc<Semaphore>>,
    fail_on_start: bool,
    calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            gate: None,
            fail_on_start: false,
            calls: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(fragments: &[&str], gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(fragments)
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_on_start: true,
            ..Self::new(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of generation streams alive at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, cancel: CancellationToken) -> Result<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_on_start {
            return Err(anyhow!("llm offline"));
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        let fragments: VecDeque<String> = self.fragments.iter().cloned().collect();
        let gate = self.gate.clone();

        Ok(stream::unfold(
            (fragments, gate, cancel, guard),
            |(mut fragments, gate, cancel, guard)| async move {
                let next = fragments.pop_front()?;
                if let Some(gate) = &gate {
                    tokio::select! {
                        permit = gate.acquire() => permit.ok()?.forget(),
                        _ = cancel.cancelled() => return None,
                    }
                }
                Some((Ok(next), (fragments, gate, cancel, guard)))
            },
        )
        .boxed())
    }
}

pub enum SynthesisScript {
    Audio(Vec<u8>),
    Nothing,
    Fail,
}

pub struct ScriptedSynthesizer {
    script: SynthesisScript,
    calls: AtomicUsize,
}

impl ScriptedSynthesizer {
    pub fn new(script: SynthesisScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Option<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            SynthesisScript::Audio(bytes) => Ok(Some(bytes.clone())),
            SynthesisScript::Nothing => Ok(None),
            SynthesisScript::Fail => Err(anyhow!("tts offline")),
        }
    }
}

/// Handles to the fakes behind a provider, for assertions.
pub struct Fakes {
    pub vad: Arc<ScriptedVad>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<ScriptedSynthesizer>,
}

impl Fakes {
    pub fn new(
        vad: ScriptedVad,
        transcriber: ScriptedTranscriber,
        generator: ScriptedGenerator,
        synthesizer: ScriptedSynthesizer,
    ) -> Self {
        Self {
            vad: Arc::new(vad),
            transcriber: Arc::new(transcriber),
            generator: Arc::new(generator),
            synthesizer: Arc::new(synthesizer),
        }
    }

    /// Speech everywhere, transcript "hello", reply "Hi there.", 4 bytes of audio.
    pub fn happy() -> Self {
        Self::new(
            ScriptedVad::always(true),
            ScriptedTranscriber::text("hello"),
            ScriptedGenerator::new(&["Hi", " there."]),
            ScriptedSynthesizer::new(SynthesisScript::Audio(vec![1, 0, 2, 0])),
        )
    }

    pub fn provider(&self) -> Arc<ModelProvider> {
        Arc::new(ModelProvider::with_collaborators(
            self.vad.clone(),
            self.transcriber.clone(),
            self.generator.clone(),
            self.synthesizer.clone(),
        ))
    }
}
