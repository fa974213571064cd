use std::sync::Arc;
use std::time::Duration;

use kestrel_core::ConsensusNodeState;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::event::ConsensusEvent;
use crate::interfaces::Transport;
use crate::message::ConsensusMessage;
use crate::pipeline::MessagePipeline;
use crate::state_machine::{Collaborators, ConsensusStateMachine};

#[cfg(any(test, feature = "debug-control"))]
use crate::debug::DebugCommand;

/// Cloneable handle posting events into a node's consensus worker
#[derive(Debug, Clone)]
pub struct ConsensusHandle {
    events: mpsc::Sender<ConsensusEvent>,
}

impl ConsensusHandle {
    pub async fn submit(&self, message: ConsensusMessage) -> Result<(), ConsensusError> {
        self.post(ConsensusEvent::Message(message)).await
    }

    /// Decode an envelope at the boundary and queue it
    pub async fn submit_bytes(&self, bytes: &[u8]) -> Result<(), ConsensusError> {
        let message = MessagePipeline::decode(bytes)?;
        self.submit(message).await
    }

    pub async fn trigger_next_view(&self) -> Result<(), ConsensusError> {
        self.post(ConsensusEvent::TriggerNextView).await
    }

    pub async fn force_timeout(&self) -> Result<(), ConsensusError> {
        self.post(ConsensusEvent::ForceTimeout).await
    }

    /// Snapshot taken after every previously queued event was processed
    pub async fn node_state(&self) -> Result<ConsensusNodeState, ConsensusError> {
        let (tx, rx) = oneshot::channel();
        self.post(ConsensusEvent::GetState(tx)).await?;
        rx.await.map_err(|_| ConsensusError::WorkerStopped)
    }

    pub async fn shutdown(&self) -> Result<(), ConsensusError> {
        self.post(ConsensusEvent::Shutdown).await
    }

    #[cfg(any(test, feature = "debug-control"))]
    pub async fn debug(&self, command: DebugCommand) -> Result<(), ConsensusError> {
        self.post(ConsensusEvent::Debug(command)).await
    }

    async fn post(&self, event: ConsensusEvent) -> Result<(), ConsensusError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConsensusError::WorkerStopped)
    }
}

/// The single serialized consumer of a node's event queue
struct ConsensusWorker {
    machine: ConsensusStateMachine,
    pipeline: MessagePipeline,
    events: mpsc::Receiver<ConsensusEvent>,
    inter_step_delay: Duration,
}

impl ConsensusWorker {
    async fn run(mut self) {
        info!(address = %self.machine.address(), view = %self.machine.view(), "Consensus worker started");
        self.machine.start();
        self.flush().await;

        while let Some(event) = self.events.recv().await {
            match event {
                ConsensusEvent::Message(message) => self.machine.handle_message(message),
                ConsensusEvent::Timeout {
                    height,
                    round,
                    generation,
                } => self.machine.handle_timeout(height, round, generation),
                ConsensusEvent::TriggerNextView => self.machine.trigger_next_view(),
                ConsensusEvent::ForceTimeout => self.machine.force_timeout(),
                ConsensusEvent::GetState(reply) => {
                    let _ = reply.send(self.machine.node_state());
                }
                #[cfg(any(test, feature = "debug-control"))]
                ConsensusEvent::Debug(command) => self.machine.apply_debug(command),
                ConsensusEvent::Shutdown => break,
            }
            self.flush().await;
        }

        self.machine.shutdown();
        info!(address = %self.machine.address(), "Consensus worker stopped");
    }

    /// Hand the outbox to the transport; never waits on delivery
    async fn flush(&mut self) {
        let outbox = self.machine.take_outbox();
        if outbox.is_empty() {
            return;
        }
        if !self.inter_step_delay.is_zero() {
            debug!(delay_ms = self.inter_step_delay.as_millis() as u64, "Pacing outbound messages");
            tokio::time::sleep(self.inter_step_delay).await;
        }
        self.pipeline.dispatch(outbox);
    }
}

/// Build the state machine for `start_height` and run it on its own task.
///
/// Startup failures (no validator set for the start height) are returned
/// here; once running the worker never fails on a message.
pub fn spawn_consensus(
    config: ConsensusConfig,
    collaborators: Collaborators,
    transport: Arc<dyn Transport>,
    start_height: u64,
) -> Result<(ConsensusHandle, JoinHandle<()>), ConsensusError> {
    let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let inter_step_delay = config.pacemaker.inter_step_delay();
    let machine = ConsensusStateMachine::new(config, collaborators, start_height, Some(tx.clone()))?;

    let worker = ConsensusWorker {
        machine,
        pipeline: MessagePipeline::new(transport),
        events: rx,
        inter_step_delay,
    };
    let task = tokio::spawn(worker.run());

    Ok((ConsensusHandle { events: tx }, task))
}
