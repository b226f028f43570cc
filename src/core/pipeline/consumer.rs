use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::pipeline::DecodedSample;
use crate::logging::Logger;

/// A sink for decoded samples, fed by the fan-out.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    /// Queues a sample without waiting. Returns `false` if it was dropped.
    fn accept(&self, sample: Arc<DecodedSample>) -> bool;

    /// Samples accepted but not yet processed.
    fn backlog(&self) -> usize;

    /// Processes queued samples until `drained` fires, then empties the queue and
    /// returns. An error is fatal for the session.
    async fn run(&self, drained: CancellationToken) -> Result<()>;
}

/// Private bounded input queue of a consumer.
pub struct ConsumerQueue {
    owner: String,
    tx: mpsc::Sender<Arc<DecodedSample>>,
    rx: Mutex<mpsc::Receiver<Arc<DecodedSample>>>,
    /// Samples refused since the queue last accepted one.
    dropped: AtomicUsize,
    log: Logger,
}

impl ConsumerQueue {
    pub fn new(owner: impl Into<String>, capacity: usize, log: Logger) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            owner: owner.into(),
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicUsize::new(0),
            log,
        }
    }

    pub fn offer(&self, sample: Arc<DecodedSample>) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => {
                let dropped = self.dropped.swap(0, Ordering::Relaxed);
                if dropped > 1 {
                    self.log.warn(format_args!(
                        "Consumer {} dropped {} items while its queue was full",
                        self.owner, dropped
                    ));
                }
                true
            }
            // Warn on the first refusal of a streak, report the total when it ends.
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    self.log
                        .warn(format_args!("Consumer {} did not accept data!", self.owner));
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Exclusive access to the receiving end, held by the consumer's run loop.
    pub async fn receiver(&self) -> MutexGuard<'_, mpsc::Receiver<Arc<DecodedSample>>> {
        self.rx.lock().await
    }
}

/// Next queued item. Once `drained` has fired, returns what is still queued and
/// then `None`.
pub async fn next_until_drained<T>(
    rx: &mut mpsc::Receiver<T>,
    drained: &CancellationToken,
) -> Option<T> {
    tokio::select! {
        biased;
        next = rx.recv() => next,
        _ = drained.cancelled() => rx.try_recv().ok(),
    }
}
