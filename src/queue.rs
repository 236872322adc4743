//! Bounded task queue between the scheduler and the worker pool

use crate::error::{MapflowError, Result};
use crate::models::Step;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Destination for ready steps.
///
/// The scheduler only ever pushes through this capability, so tests can
/// observe or redirect dispatch with their own implementation.
#[async_trait]
pub trait StepSink: Send + Sync {
    /// Hand a ready step over; may wait while the destination is full.
    async fn enqueue(&self, step: Step) -> Result<()>;
}

/// Bounded FIFO channel of steps with many producers and many consumers.
///
/// Enqueue waits while the queue is full, dequeue waits while it is empty.
/// Consumers share the receiving half behind an async mutex.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<Step>,
    receiver: Arc<Mutex<mpsc::Receiver<Step>>>,
    capacity: usize,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` steps (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            capacity,
        }
    }

    /// Push a step, waiting for free capacity
    pub async fn enqueue(&self, step: Step) -> Result<()> {
        debug!("Enqueueing step {} ({})", step.id, step.name);
        self.sender
            .send(step)
            .await
            .map_err(|_| MapflowError::QueueClosed)
    }

    /// Pop the oldest step, waiting until one is available
    pub async fn dequeue(&self) -> Option<Step> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Number of queued steps
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl StepSink for TaskQueue {
    async fn enqueue(&self, step: Step) -> Result<()> {
        TaskQueue::enqueue(self, step).await
    }
}
