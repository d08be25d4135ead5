//! # Turn Controller
//!
//! Owns the single active turn of a connection.
//!
//! ## State machine:
//! ```text
//! idle ──start──▶ pipeline-running ──natural end──▶ idle
//!                   │        ▲
//!        start/interrupt     │ start (after the old task terminated)
//!                   ▼        │
//!                 canceling ─┘──interrupt──▶ idle + interrupt_ack
//! ```
//!
//! Every transition goes through [`TurnController::replace_and_wait`]: cancel
//! the current task, await its termination, and only then start the next one.
//! Commands are processed one at a time by [`TurnController::run`], so two
//! turns never overlap.

use crate::models::ModelProvider;
use crate::protocol::ServerMessage;
use crate::state::MetricsHandle;
use crate::turn::{Outbox, TurnInput, TurnOutbox, TurnOutcome, TurnPipeline};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Requests from the connection's receive path.
#[derive(Debug)]
pub enum TurnCommand {
    /// Start a new turn, superseding any active one.
    Start(TurnInput),
    /// Cancel the active turn (if any) and acknowledge.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    PipelineRunning,
    Canceling,
}

/// Handle to one in-flight turn: its cancellation token and its task.
struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

impl ActiveTurn {
    fn is_terminated(&self) -> bool {
        self.task.is_finished()
    }

    /// Cooperative cancellation: signal, then wait for the task to unwind.
    ///
    /// A task that panicked never recorded its outcome, so it is counted here.
    async fn cancel_and_wait(self, metrics: &MetricsHandle) -> TurnOutcome {
        self.cancel.cancel();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Turn {} task ended abnormally: {}", self.id, err);
                metrics.record_turn_outcome(TurnOutcome::Failed);
                TurnOutcome::Failed
            }
        }
    }

    /// Hard cancellation for teardown: nobody is left to receive output.
    async fn abandon(self, metrics: &MetricsHandle) {
        self.cancel.cancel();
        self.task.abort();
        match self.task.await {
            // Finished before the abort landed; the task already counted itself.
            Ok(_) => {}
            Err(err) if err.is_cancelled() => metrics.record_turn_outcome(TurnOutcome::Canceled),
            Err(err) => {
                error!("Turn {} task ended abnormally: {}", self.id, err);
                metrics.record_turn_outcome(TurnOutcome::Failed);
            }
        }
    }
}

pub struct TurnController {
    session_id: String,
    models: Arc<ModelProvider>,
    outbox: Outbox,
    metrics: MetricsHandle,

    /// Cancelled when the connection goes away; every turn token is a child of it
    teardown: CancellationToken,

    active: Option<ActiveTurn>,
    canceling: bool,
    turns_started: u64,
}

impl TurnController {
    pub fn new(
        session_id: String,
        models: Arc<ModelProvider>,
        outbox: Outbox,
        metrics: MetricsHandle,
        teardown: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            models,
            outbox,
            metrics,
            teardown,
            active: None,
            canceling: false,
            turns_started: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        if self.canceling {
            return TurnState::Canceling;
        }
        match &self.active {
            Some(turn) if !turn.is_terminated() => TurnState::PipelineRunning,
            _ => TurnState::Idle,
        }
    }

    /// Process commands until teardown or until the receive path hangs up.
    ///
    /// Commands still queued at that point are discarded, not executed.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TurnCommand>) {
        let teardown = self.teardown.clone();
        loop {
            let command = tokio::select! {
                biased;
                _ = teardown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            debug!(state = ?self.state(), "Turn command received");
            match command {
                TurnCommand::Start(input) => self.start_turn(input).await,
                TurnCommand::Interrupt => self.interrupt().await,
            }
        }

        commands.close();
        let mut dropped = 0;
        while commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Discarded {} queued turn commands on teardown", dropped);
        }

        self.shutdown().await;
    }

    pub async fn start_turn(&mut self, input: TurnInput) {
        self.replace_and_wait(Some(input)).await;
    }

    /// Cancel the active turn, wait for it, then queue `interrupt_ack`.
    pub async fn interrupt(&mut self) {
        self.replace_and_wait(None).await;
        self.outbox.send(ServerMessage::InterruptAck);
    }

    /// The only way the active turn changes.
    ///
    /// Any current task is cancelled and awaited before `next` (if any) is spawned.
    pub async fn replace_and_wait(&mut self, next: Option<TurnInput>) {
        if let Some(previous) = self.active.take() {
            let id = previous.id;
            if !previous.is_terminated() {
                info!("Canceling turn {}", id);
                self.canceling = true;
            }
            let outcome = previous.cancel_and_wait(&self.metrics).await;
            self.canceling = false;
            debug!("Turn {} settled as {}", id, outcome.as_str());
        }

        if let Some(input) = next {
            self.active = Some(self.spawn_turn(input));
        }
    }

    /// Session teardown: abandon the active turn without waiting for it to unwind.
    pub async fn shutdown(&mut self) {
        self.teardown.cancel();
        if let Some(turn) = self.active.take() {
            info!("Abandoning turn {} on disconnect", turn.id);
            turn.abandon(&self.metrics).await;
        }
    }

    fn spawn_turn(&mut self, input: TurnInput) -> ActiveTurn {
        self.turns_started += 1;
        let id = self.turns_started;
        let cancel = self.teardown.child_token();

        let pipeline = TurnPipeline::new(
            id,
            self.models.clone(),
            TurnOutbox::new(self.outbox.clone(), cancel.clone()),
        );
        let metrics = self.metrics.clone();
        metrics.record_turn_started();

        let span = info_span!("turn", session_id = %self.session_id, turn_id = id);
        let task = tokio::spawn(
            async move {
                let outcome = pipeline.run(input).await;
                metrics.record_turn_outcome(outcome);
                outcome
            }
            .instrument(span),
        );

        ActiveTurn { id, cancel, task }
    }
}
