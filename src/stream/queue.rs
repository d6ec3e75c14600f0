//! Bounded hand-off between connection reassemblers and the parser pool.
//!
//! Producers await while the queue is full; nothing is ever dropped. The
//! receiving half is shared by every parser worker, so each frame is taken by
//! exactly one of them. Once every producer has gone the consumers drain what
//! is left and then see `None`.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::{LighthouseError, Result};
use crate::generic_types::Frame;

pub struct MessageQueue;

impl MessageQueue {
    pub fn bounded(capacity: usize) -> (QueueProducer, QueueConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (QueueProducer { tx }, QueueConsumer { rx: Arc::new(Mutex::new(rx)) })
    }
}

/// Cloned once per connection.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<Frame>,
}

impl QueueProducer {
    /// Waits for a free slot when the queue is at capacity.
    pub async fn enqueue(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| LighthouseError::QueueClosed)
    }

    /// Frames currently waiting for a worker.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Cloned once per parser worker.
#[derive(Clone)]
pub struct QueueConsumer {
    rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
}

impl QueueConsumer {
    /// Next frame, or `None` once all producers are dropped and the queue is empty.
    pub async fn dequeue(&self) -> Option<Frame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}
