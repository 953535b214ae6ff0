//! Dispatch queue: bounded hand-off between the claiming jobs and the
//! delivery workers.
//!
//! The scanner and retry controller enqueue claimed rows; a fixed pool of
//! workers drains the queue, at most `concurrency` deliveries in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use textcast_core::error::{Result, TextcastError};
use tokio::sync::{Semaphore, mpsc};

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::message::MessageRef;

/// A claimed row waiting for a worker.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub message: MessageRef,
    pub queued_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
}

/// Producer side. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchJob>,
    counters: Arc<Counters>,
}

/// Consumer side, handed to [`run_workers`].
pub struct DispatchReceiver {
    rx: mpsc::Receiver<DispatchJob>,
    counters: Arc<Counters>,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub processed: u64,
}

/// Create a queue holding at most `capacity` waiting jobs.
pub fn channel(capacity: usize) -> (DispatchQueue, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(Counters::default());
    (
        DispatchQueue { tx, counters: counters.clone() },
        DispatchReceiver { rx, counters },
    )
}

impl DispatchQueue {
    /// Hand a claimed row to the workers. Never blocks; a full or closed
    /// queue is an [`TextcastError::Enqueue`] error.
    pub fn enqueue(&self, message: MessageRef) -> Result<()> {
        let job = DispatchJob { message, queued_at: Utc::now() };
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "dispatch queue full",
                    mpsc::error::TrySendError::Closed(_) => "dispatch queue closed",
                };
                Err(TextcastError::Enqueue(reason.into()))
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
        }
    }
}

/// Drain the queue until every producer is dropped, running up to
/// `concurrency` deliveries at once. Returns after in-flight jobs finish.
pub async fn run_workers(receiver: DispatchReceiver, dispatcher: Arc<Dispatcher>, concurrency: usize) {
    let DispatchReceiver { mut rx, counters } = receiver;
    let limit = concurrency.max(1);
    let slots = Arc::new(Semaphore::new(limit));
    tracing::info!("📤 Dispatch workers started ({limit} concurrent)");

    while let Some(job) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let dispatcher = dispatcher.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let waited = Utc::now() - job.queued_at;
            tracing::debug!("📥 Dispatching {} (queued {}ms)", job.message, waited.num_milliseconds());
            match dispatcher.dispatch(&job.message).await {
                Ok(DispatchOutcome::Sent) | Ok(DispatchOutcome::Skipped) => {}
                Ok(DispatchOutcome::Failed(reason)) => {
                    tracing::debug!("Dispatch of {} failed ({reason})", job.message);
                }
                Err(e) => tracing::warn!("⚠️ Dispatch of {} errored: {e}", job.message),
            }
            counters.processed.fetch_add(1, Ordering::Relaxed);
        });
    }

    // wait for in-flight deliveries
    let _ = slots.acquire_many(limit as u32).await;
    tracing::info!("📤 Dispatch workers stopped");
}
