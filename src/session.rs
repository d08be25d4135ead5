//! # Voice Session
//!
//! Transport-independent state of one client connection.
//!
//! ## Responsibilities:
//! - Feed binary audio into the segmenter and start a turn per utterance
//! - Route `interrupt` / `prompt` / `ping` control messages
//! - Own the sending side of the connection's outbound queue
//!
//! The turn controller runs as its own task and receives [`TurnCommand`]s in
//! arrival order, so the receive path never blocks on a cancellation.
//! `pong` bypasses the controller and is queued directly, which keeps it
//! prompt even while a turn is being replaced.

use crate::audio::UtteranceSegmenter;
use crate::models::ModelProvider;
use crate::protocol::{decode_client_message, ClientMessage, ServerMessage};
use crate::state::MetricsHandle;
use crate::turn::{Outbox, TurnCommand, TurnController, TurnInput};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct VoiceSession {
    id: String,
    segmenter: UtteranceSegmenter,
    commands: mpsc::UnboundedSender<TurnCommand>,
    outbox: Outbox,
    metrics: MetricsHandle,
    teardown: CancellationToken,
    controller: JoinHandle<()>,
}

impl VoiceSession {
    /// Open a session: queue `ready` and start the turn controller.
    ///
    /// The returned receiver is the connection's outbound queue; exactly one
    /// writer must drain it.
    pub fn start(
        models: Arc<ModelProvider>,
        metrics: MetricsHandle,
        session_id: String,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbox, outbound) = Outbox::channel();
        outbox.send(ServerMessage::Ready);

        let segmenter = UtteranceSegmenter::new(models.vad());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let teardown = CancellationToken::new();
        let controller = TurnController::new(
            session_id.clone(),
            models,
            outbox.clone(),
            metrics.clone(),
            teardown.clone(),
        );
        let controller = tokio::spawn(controller.run(command_rx));

        info!("Voice session {} opened", session_id);
        let session = Self {
            id: session_id,
            segmenter,
            commands,
            outbox,
            metrics,
            teardown,
            controller,
        };
        (session, outbound)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Binary frame: raw PCM16 mono 16kHz.
    pub fn handle_audio(&mut self, data: &[u8]) {
        if let Some(utterance) = self.segmenter.add_audio(data) {
            info!(
                "Session {}: utterance of {:.2}s detected ({} bytes)",
                self.id,
                utterance.duration_seconds(),
                utterance.len()
            );
            self.metrics.record_utterance();
            self.dispatch(TurnCommand::Start(TurnInput::Utterance(utterance)));
        }
    }

    /// Text frame: a JSON control message. Anything unparseable is dropped.
    pub fn handle_text(&mut self, text: &str) {
        let message = match decode_client_message(text) {
            Some(message) => message,
            None => {
                debug!("Session {}: ignoring unrecognized text frame", self.id);
                return;
            }
        };

        match message {
            ClientMessage::Interrupt => {
                info!("Session {}: interrupt", self.id);
                if !self.segmenter.is_empty() {
                    debug!(
                        "Session {}: discarding {} buffered audio bytes",
                        self.id,
                        self.segmenter.buffered_bytes()
                    );
                }
                self.segmenter.clear();
                self.metrics.record_interrupt();
                self.dispatch(TurnCommand::Interrupt);
            }
            ClientMessage::Prompt { text } => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("Session {}: ignoring empty prompt", self.id);
                    return;
                }
                self.dispatch(TurnCommand::Start(TurnInput::Prompt(text.to_string())));
            }
            ClientMessage::Ping { id } => {
                self.outbox.send(ServerMessage::Pong { id });
            }
        }
    }

    fn dispatch(&self, command: TurnCommand) {
        if self.commands.send(command).is_err() {
            warn!("Session {}: turn controller is gone", self.id);
        }
    }

    /// Tear down: cancel the active turn, drop queued commands and wait for the controller.
    pub async fn close(self) {
        let Self { id, commands, teardown, controller, .. } = self;
        teardown.cancel();
        drop(commands);
        if let Err(err) = controller.await {
            warn!("Session {}: turn controller ended abnormally: {}", id, err);
        }
        info!("Voice session {} closed", id);
    }
}
