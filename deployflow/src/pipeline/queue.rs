//! Trigger queue: turns trigger events into concurrent executions.
//!
//! Events are submitted over a bounded channel. A dispatcher task starts
//! one execution per event, holding a semaphore permit for its duration, so
//! at most `max_concurrent_executions` run at once and the rest wait in the
//! queue. Nothing in flight is ever cancelled.

use super::controller::PipelineController;
use super::execution::PipelineResult;
use crate::core::TriggerEvent;
use crate::errors::PipelineError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of executions allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 4;

/// Default number of events buffered before `submit` waits.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Executions allowed to run at once.
    pub max_concurrent_executions: usize,
    /// Events buffered in the channel.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl QueueConfig {
    /// Sets the concurrency limit (at least 1).
    #[must_use]
    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max.max(1);
        self
    }

    /// Sets the channel capacity (at least 1).
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[derive(Debug)]
struct QueuedTrigger {
    event: TriggerEvent,
    reply: oneshot::Sender<PipelineResult>,
}

/// A handle to the eventual result of a submitted event.
#[derive(Debug)]
pub struct ExecutionTicket {
    trigger_id: Uuid,
    receiver: oneshot::Receiver<PipelineResult>,
}

impl ExecutionTicket {
    /// Returns the id of the submitted trigger event.
    #[must_use]
    pub fn trigger_id(&self) -> Uuid {
        self.trigger_id
    }

    /// Waits for the execution to finish.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` if the execution task died without a result.
    pub async fn wait(self) -> Result<PipelineResult, PipelineError> {
        self.receiver.await.map_err(|_| {
            PipelineError::Internal(format!(
                "execution for trigger {} ended without a result",
                self.trigger_id
            ))
        })
    }
}

/// A cloneable handle for submitting events.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    sender: mpsc::Sender<QueuedTrigger>,
}

impl TriggerSender {
    /// Submits an event, waiting for channel capacity if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` if the queue has shut down.
    pub async fn submit(&self, event: TriggerEvent) -> Result<ExecutionTicket, PipelineError> {
        let (reply, receiver) = oneshot::channel();
        let trigger_id = event.id;
        debug!(trigger_id = %trigger_id, revision = %event.revision, "Trigger event queued");
        self.sender
            .send(QueuedTrigger { event, reply })
            .await
            .map_err(|_| PipelineError::Internal("trigger queue is closed".to_string()))?;
        Ok(ExecutionTicket {
            trigger_id,
            receiver,
        })
    }
}

/// The running trigger queue.
#[derive(Debug)]
pub struct TriggerQueue {
    sender: TriggerSender,
    dispatcher: JoinHandle<()>,
}

impl TriggerQueue {
    /// Starts the dispatcher for `controller`.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(controller: Arc<PipelineController>, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(controller, receiver, config));
        Self {
            sender: TriggerSender { sender },
            dispatcher,
        }
    }

    /// Returns a cloneable submission handle.
    #[must_use]
    pub fn sender(&self) -> TriggerSender {
        self.sender.clone()
    }

    /// Submits an event.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` if the queue has shut down.
    pub async fn submit(&self, event: TriggerEvent) -> Result<ExecutionTicket, PipelineError> {
        self.sender.submit(event).await
    }

    /// Stops accepting events from this handle and waits for every queued
    /// and running execution to finish.
    ///
    /// Cloned senders keep the queue open until they are dropped.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Trigger dispatcher ended abnormally");
        }
    }
}

async fn dispatch(
    controller: Arc<PipelineController>,
    mut receiver: mpsc::Receiver<QueuedTrigger>,
    config: QueueConfig,
) {
    let limit = config.max_concurrent_executions.max(1);
    let permits = Arc::new(Semaphore::new(limit));
    let mut running = JoinSet::new();
    info!(max_concurrent_executions = limit, "Trigger queue started");

    while let Some(queued) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            warn!("Execution semaphore closed");
            break;
        };
        let controller = Arc::clone(&controller);
        running.spawn(async move {
            let result = controller.run(queued.event).await;
            if queued.reply.send(result).is_err() {
                debug!("Execution result dropped; ticket was discarded");
            }
            drop(permit);
        });

        while let Some(finished) = running.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Execution task panicked");
            }
        }
    }

    while let Some(finished) = running.join_next().await {
        if let Err(e) = finished {
            warn!(error = %e, "Execution task panicked");
        }
    }
    info!("Trigger queue drained");
}
