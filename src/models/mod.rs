//! # Model Collaborators
//!
//! The turn engine never talks to a model directly. It goes through four narrow
//! contracts, each backed by a process-wide client that is built on first use.
//!
//! ## Contracts:
//! - **VoiceActivityDetector**: `(frame, sample_rate) → is speech`, may fail
//! - **Transcriber**: normalized float samples → transcript or nothing
//! - **ReplyGenerator**: prompt + cancellation token → lazy stream of text fragments
//! - **SpeechSynthesizer**: text → raw 16-bit PCM at 22050Hz or nothing
//!
//! ## Lifetime:
//! One [`ModelProvider`] lives in the application state and is shared by every
//! connection. Each collaborator sits behind a once-only cell, so concurrent
//! sessions that hit a cold provider still construct exactly one client.

pub mod generator;
pub mod synthesizer;
pub mod transcriber;
pub mod vad;

#[cfg(test)]
pub mod testing;

use crate::config::{AppConfig, ModelsConfig};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use generator::OllamaGenerator;
pub use synthesizer::HttpSynthesizer;
pub use transcriber::HttpTranscriber;
pub use vad::{EnergyVad, VadThreshold};

/// Lazy, finite sequence of reply fragments.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Frame-level speech oracle.
pub trait VoiceActivityDetector: Send + Sync {
    fn is_speech(&self, frame: &[u8], sample_rate: u32) -> Result<bool>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns `None` when nothing intelligible was heard.
    async fn transcribe(&self, samples: &[f32]) -> Result<Option<String>>;
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Start generating a reply.
    ///
    /// Implementations must stop producing fragments promptly once `cancel`
    /// is triggered. The caller also checks the token between fragments.
    async fn generate(&self, prompt: &str, cancel: CancellationToken) -> Result<FragmentStream>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns raw mono 16-bit PCM, or `None` when there is nothing to play.
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>>;
}

/// Initialization status of each collaborator, for health reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProviderStatus {
    pub vad: bool,
    pub transcriber: bool,
    pub generator: bool,
    pub synthesizer: bool,
}

/// Shared source of model collaborators.
///
/// ## Initialization:
/// - Built from config: every cell starts empty and is filled on first use
/// - Built with `with_collaborators` (tests): cells start filled
pub struct ModelProvider {
    models: ModelsConfig,
    vad_threshold: VadThreshold,
    vad: OnceLock<Arc<dyn VoiceActivityDetector>>,
    transcriber: OnceCell<Arc<dyn Transcriber>>,
    generator: OnceCell<Arc<dyn ReplyGenerator>>,
    synthesizer: OnceCell<Arc<dyn SpeechSynthesizer>>,
}

impl ModelProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            models: config.models.clone(),
            vad_threshold: VadThreshold::new(config.vad.energy_threshold),
            vad: OnceLock::new(),
            transcriber: OnceCell::new(),
            generator: OnceCell::new(),
            synthesizer: OnceCell::new(),
        }
    }

    /// Provider with ready-made collaborators, nothing left to build lazily.
    #[cfg(test)]
    pub fn with_collaborators(
        vad: Arc<dyn VoiceActivityDetector>,
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let defaults = AppConfig::default();
        Self {
            models: defaults.models,
            vad_threshold: VadThreshold::new(defaults.vad.energy_threshold),
            vad: OnceLock::from(vad),
            transcriber: OnceCell::new_with(Some(transcriber)),
            generator: OnceCell::new_with(Some(generator)),
            synthesizer: OnceCell::new_with(Some(synthesizer)),
        }
    }

    pub fn vad(&self) -> Arc<dyn VoiceActivityDetector> {
        self.vad
            .get_or_init(|| {
                info!("Initializing energy VAD (threshold {})", self.vad_threshold.get());
                Arc::new(EnergyVad::new(self.vad_threshold.clone()))
            })
            .clone()
    }

    /// Takes effect on the next frame of every session, including ones already running.
    pub fn set_vad_threshold(&self, threshold: f32) {
        self.vad_threshold.set(threshold);
    }

    pub async fn transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        let transcriber = self
            .transcriber
            .get_or_try_init(|| async {
                info!("Initializing transcription client for {}", self.models.transcription_url);
                let client = HttpTranscriber::new(&self.models)?;
                Ok::<_, anyhow::Error>(Arc::new(client) as Arc<dyn Transcriber>)
            })
            .await?;
        Ok(transcriber.clone())
    }

    pub async fn generator(&self) -> Result<Arc<dyn ReplyGenerator>> {
        let generator = self
            .generator
            .get_or_try_init(|| async {
                info!(
                    "Initializing generation client for {} ({})",
                    self.models.llm_url, self.models.llm_model
                );
                let client = OllamaGenerator::new(&self.models)?;
                Ok::<_, anyhow::Error>(Arc::new(client) as Arc<dyn ReplyGenerator>)
            })
            .await?;
        Ok(generator.clone())
    }

    pub async fn synthesizer(&self) -> Result<Arc<dyn SpeechSynthesizer>> {
        let synthesizer = self
            .synthesizer
            .get_or_try_init(|| async {
                info!("Initializing synthesis client for {}", self.models.tts_url);
                let client = HttpSynthesizer::new(&self.models)?;
                Ok::<_, anyhow::Error>(Arc::new(client) as Arc<dyn SpeechSynthesizer>)
            })
            .await?;
        Ok(synthesizer.clone())
    }

    pub fn status(&self) -> ProviderStatus {
        ProviderStatus {
            vad: self.vad.get().is_some(),
            transcriber: self.transcriber.initialized(),
            generator: self.generator.initialized(),
            synthesizer: self.synthesizer.initialized(),
        }
    }
}
