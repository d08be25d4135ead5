//! # Turn Engine
//!
//! Runs one conversational turn at a time per connection:
//! transcript or prompt → streamed reply → synthesized audio.
//!
//! ## Key Components:
//! - **Outbox**: the connection's single ordered outbound queue
//! - **TurnOutbox**: a per-turn view of the outbox that goes silent once the
//!   turn is cancelled
//! - **TurnPipeline**: the three stages of one turn
//! - **TurnController**: owns the active turn; replacing it always waits for
//!   the previous one to finish unwinding
//!
//! ## Ordering guarantee:
//! A turn only writes through its `TurnOutbox`, which checks the turn's
//! cancellation token before every write. The controller acknowledges an
//! interrupt, or starts the next turn, only after the cancelled task has
//! terminated. Every write from the old turn is therefore already queued ahead
//! of whatever the controller sends next.

pub mod controller;
pub mod pipeline;

use crate::audio::Utterance;
use crate::protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use controller::{TurnCommand, TurnController};
pub use pipeline::TurnPipeline;

/// What started a turn.
#[derive(Debug)]
pub enum TurnInput {
    /// Audio closed by the segmenter; goes through transcription first.
    Utterance(Utterance),
    /// Text sent by the client; skips transcription.
    Prompt(String),
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// All stages ran to the end.
    Completed,
    /// Stopped by an interrupt, a newer turn, or a closed connection.
    Canceled,
    /// Nothing was transcribed; the turn ended without output.
    Aborted,
    /// A collaborator failed; the client received an `error` message.
    Failed,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::Canceled => "canceled",
            TurnOutcome::Aborted => "aborted",
            TurnOutcome::Failed => "failed",
        }
    }
}

/// Sending half of a connection's outbound message queue.
///
/// The receiving half is drained by exactly one writer, the WebSocket actor,
/// so messages reach the client in the order they were queued.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Returns `false` once the connection's writer is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Why a turn could not write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Canceled,
    Disconnected,
}

/// A turn's gated view of the outbox.
#[derive(Debug, Clone)]
pub struct TurnOutbox {
    outbox: Outbox,
    cancel: CancellationToken,
}

impl TurnOutbox {
    pub fn new(outbox: Outbox, cancel: CancellationToken) -> Self {
        Self { outbox, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a message unless the turn has been cancelled.
    pub fn emit(&self, message: ServerMessage) -> Result<(), Gate> {
        if self.cancel.is_cancelled() {
            return Err(Gate::Canceled);
        }
        if self.outbox.send(message) {
            Ok(())
        } else {
            Err(Gate::Disconnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_outbox_goes_silent_after_cancel() {
        let (outbox, mut rx) = Outbox::channel();
        let cancel = CancellationToken::new();
        let turn = TurnOutbox::new(outbox, cancel.clone());

        assert_eq!(turn.emit(ServerMessage::LlmStart), Ok(()));
        cancel.cancel();
        assert_eq!(turn.emit(ServerMessage::Llm { text: "late".into() }), Err(Gate::Canceled));

        assert_eq!(rx.try_recv().unwrap(), ServerMessage::LlmStart);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_turn_outbox_reports_disconnect() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        let turn = TurnOutbox::new(outbox, CancellationToken::new());
        assert_eq!(turn.emit(ServerMessage::LlmStart), Err(Gate::Disconnected));
    }
}
