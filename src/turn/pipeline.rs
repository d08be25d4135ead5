//! # Generation Pipeline
//!
//! The stages of one turn, in order:
//! 1. **Transcribe** (audio turns only): utterance → `stt`
//! 2. **Generate**: `llm_start`, one `llm` per fragment, then `llm_final`
//! 3. **Synthesize**: full reply → WAV → `tts_audio`
//!
//! ## Failure policy:
//! - Transcription failure or empty transcript: turn ends silently
//! - Generation or synthesis failure: logged, reported as `error`, turn ends
//! - Cancellation: no further output; the stream is not polled again
//!
//! Nothing here propagates an error to the connection.

use crate::audio::pcm::{self, SYNTH_SAMPLE_RATE};
use crate::audio::Utterance;
use crate::models::ModelProvider;
use crate::protocol::ServerMessage;
use crate::turn::{Gate, TurnInput, TurnOutbox, TurnOutcome};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a turn stopped early.
enum Halt {
    Gate(Gate),
    Failed { stage: &'static str, error: anyhow::Error },
}

impl From<Gate> for Halt {
    fn from(gate: Gate) -> Self {
        Halt::Gate(gate)
    }
}

pub struct TurnPipeline {
    turn_id: u64,
    models: Arc<ModelProvider>,
    out: TurnOutbox,
}

impl TurnPipeline {
    pub fn new(turn_id: u64, models: Arc<ModelProvider>, out: TurnOutbox) -> Self {
        Self { turn_id, models, out }
    }

    /// Run every stage for `input` and report how the turn ended.
    pub async fn run(self, input: TurnInput) -> TurnOutcome {
        let start_time = Instant::now();
        let outcome = match self.execute(input).await {
            Ok(outcome) => outcome,
            Err(Halt::Gate(Gate::Canceled)) => TurnOutcome::Canceled,
            Err(Halt::Gate(Gate::Disconnected)) => {
                debug!("Connection writer gone, ending turn {}", self.turn_id);
                TurnOutcome::Canceled
            }
            Err(Halt::Failed { stage, error }) => {
                error!("Turn {} failed during {}: {:#}", self.turn_id, stage, error);
                // Suppressed like any other write if the turn was cancelled meanwhile.
                let _ = self
                    .out
                    .emit(ServerMessage::error(format!("{} failed: {}", stage, error)));
                TurnOutcome::Failed
            }
        };

        info!(
            turn_id = self.turn_id,
            outcome = outcome.as_str(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Turn finished"
        );
        outcome
    }

    async fn execute(&self, input: TurnInput) -> Result<TurnOutcome, Halt> {
        let prompt = match input {
            TurnInput::Prompt(text) => text,
            TurnInput::Utterance(utterance) => match self.transcribe(utterance).await? {
                Some(transcript) => transcript,
                None => return Ok(TurnOutcome::Aborted),
            },
        };

        let reply = self.generate(&prompt).await?;
        self.synthesize(&reply).await?;
        Ok(TurnOutcome::Completed)
    }

    /// Stage 1. `Ok(None)` means the turn ends here without any output.
    async fn transcribe(&self, utterance: Utterance) -> Result<Option<String>, Halt> {
        let duration = utterance.duration_seconds();

        let transcriber = match self.models.transcriber().await {
            Ok(transcriber) => transcriber,
            Err(err) => {
                warn!("Transcriber unavailable, dropping {:.2}s utterance: {:#}", duration, err);
                return Ok(None);
            }
        };

        let samples = utterance.into_float_samples();
        let transcript = match transcriber.transcribe(&samples).await {
            Ok(Some(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                info!("No speech recognized in {:.2}s utterance", duration);
                return Ok(None);
            }
            Err(err) => {
                warn!("Transcription failed for {:.2}s utterance: {:#}", duration, err);
                return Ok(None);
            }
        };

        debug!("Transcript: '{}'", transcript);
        self.out.emit(ServerMessage::Stt {
            text: transcript.clone(),
            is_final: true,
        })?;
        Ok(Some(transcript))
    }

    /// Stage 2. Returns the concatenated reply after `llm_final` was queued.
    async fn generate(&self, prompt: &str) -> Result<String, Halt> {
        self.out.emit(ServerMessage::LlmStart)?;

        let generator = self
            .models
            .generator()
            .await
            .map_err(|error| Halt::Failed { stage: "generation", error })?;
        let mut fragments = generator
            .generate(prompt, self.out.token())
            .await
            .map_err(|error| Halt::Failed { stage: "generation", error })?;

        let mut reply = Vec::new();
        loop {
            // Checked before asking for the next fragment, not only before writing it.
            if self.out.is_cancelled() {
                return Err(Gate::Canceled.into());
            }
            match fragments.next().await {
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    self.out.emit(ServerMessage::Llm { text: fragment.clone() })?;
                    reply.push(fragment);
                }
                Some(Err(error)) => return Err(Halt::Failed { stage: "generation", error }),
                None => break,
            }
        }

        let text = reply.concat();
        debug!("Reply complete: {} fragments, {} chars", reply.len(), text.len());
        self.out.emit(ServerMessage::LlmFinal { text: text.clone() })?;
        Ok(text)
    }

    /// Stage 3. Missing audio is skipped, not an error.
    async fn synthesize(&self, text: &str) -> Result<(), Halt> {
        let synthesizer = self
            .models
            .synthesizer()
            .await
            .map_err(|error| Halt::Failed { stage: "synthesis", error })?;
        let audio = synthesizer
            .synthesize(text)
            .await
            .map_err(|error| Halt::Failed { stage: "synthesis", error })?;

        match audio {
            Some(pcm_bytes) if !pcm_bytes.is_empty() => {
                let wav = pcm::wav_from_pcm16(&pcm_bytes, SYNTH_SAMPLE_RATE);
                self.out.emit(ServerMessage::tts_audio(&wav))?;
            }
            _ => {
                // A cancel that landed during synthesis.
                if self.out.is_cancelled() {
                    return Err(Gate::Canceled.into());
                }
                debug!("Synthesis produced no audio");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::*;
    use crate::turn::Outbox;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn kinds(messages: &[ServerMessage]) -> Vec<&'static str> {
        messages.iter().map(|m| m.kind()).collect()
    }

    fn utterance() -> Utterance {
        use crate::audio::segmenter::MIN_UTTERANCE_BYTES;
        let vad = std::sync::Arc::new(ScriptedVad::always(false));
        let mut seg = crate::audio::UtteranceSegmenter::new(vad);
        seg.add_audio(&vec![0u8; MIN_UTTERANCE_BYTES]).unwrap()
    }

    async fn run(fakes: &Fakes, input: TurnInput) -> (TurnOutcome, Vec<ServerMessage>) {
        let (outbox, mut rx) = Outbox::channel();
        let out = TurnOutbox::new(outbox, CancellationToken::new());
        let outcome = TurnPipeline::new(1, fakes.provider(), out).run(input).await;
        (outcome, drain(&mut rx))
    }

    #[tokio::test]
    async fn test_audio_turn_emits_all_stages_in_order() {
        let fakes = Fakes::happy();
        let (outcome, messages) = run(&fakes, TurnInput::Utterance(utterance())).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(
            kinds(&messages),
            vec!["stt", "llm_start", "llm", "llm", "llm_final", "tts_audio"]
        );
        assert_eq!(messages[0], ServerMessage::Stt { text: "hello".into(), is_final: true });
        assert_eq!(messages[4], ServerMessage::LlmFinal { text: "Hi there.".into() });

        let expected_wav = pcm::wav_from_pcm16(&[1, 0, 2, 0], SYNTH_SAMPLE_RATE);
        assert_eq!(messages[5], ServerMessage::tts_audio(&expected_wav));
        assert_eq!(fakes.generator.prompts(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_prompt_turn_skips_transcription() {
        let fakes = Fakes::happy();
        let (outcome, messages) = run(&fakes, TurnInput::Prompt("tell me".into())).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(kinds(&messages), vec!["llm_start", "llm", "llm", "llm_final", "tts_audio"]);
        assert_eq!(fakes.transcriber.calls(), 0);
        assert_eq!(fakes.generator.prompts(), vec!["tell me"]);
    }

    #[tokio::test]
    async fn test_empty_transcript_aborts_silently() {
        for script in [TranscriptScript::Nothing, TranscriptScript::Fail, TranscriptScript::Text("  ".into())] {
            let fakes = Fakes::new(
                ScriptedVad::always(false),
                ScriptedTranscriber::new(script),
                ScriptedGenerator::new(&["x"]),
                ScriptedSynthesizer::new(SynthesisScript::Nothing),
            );
            let (outcome, messages) = run(&fakes, TurnInput::Utterance(utterance())).await;

            assert_eq!(outcome, TurnOutcome::Aborted);
            assert!(messages.is_empty());
            assert_eq!(fakes.generator.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_missing_audio_skips_tts() {
        let fakes = Fakes::new(
            ScriptedVad::always(false),
            ScriptedTranscriber::text("hi"),
            ScriptedGenerator::new(&["ok"]),
            ScriptedSynthesizer::new(SynthesisScript::Nothing),
        );
        let (outcome, messages) = run(&fakes, TurnInput::Prompt("hi".into())).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(kinds(&messages), vec!["llm_start", "llm", "llm_final"]);
    }

    #[tokio::test]
    async fn test_generation_failure_reports_error() {
        let fakes = Fakes::new(
            ScriptedVad::always(false),
            ScriptedTranscriber::text("hi"),
            ScriptedGenerator::failing(),
            ScriptedSynthesizer::new(SynthesisScript::Nothing),
        );
        let (outcome, messages) = run(&fakes, TurnInput::Prompt("hi".into())).await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(kinds(&messages), vec!["llm_start", "error"]);
        assert_eq!(fakes.synthesizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_reports_error_after_final() {
        let fakes = Fakes::new(
            ScriptedVad::always(false),
            ScriptedTranscriber::text("hi"),
            ScriptedGenerator::new(&["ok"]),
            ScriptedSynthesizer::new(SynthesisScript::Fail),
        );
        let (outcome, messages) = run(&fakes, TurnInput::Prompt("hi".into())).await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(kinds(&messages), vec!["llm_start", "llm", "llm_final", "error"]);
        match &messages[3] {
            ServerMessage::Error { message } => assert!(message.starts_with("synthesis failed")),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_turn_writes_nothing() {
        let fakes = Fakes::happy();
        let (outbox, mut rx) = Outbox::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = TurnPipeline::new(1, fakes.provider(), TurnOutbox::new(outbox, cancel))
            .run(TurnInput::Prompt("hi".into()))
            .await;

        assert_eq!(outcome, TurnOutcome::Canceled);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(fakes.generator.calls(), 0);
    }
}
