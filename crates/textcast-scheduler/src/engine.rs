//! Scheduler engine: wires the store, dispatch queue, and workers together
//! and runs the scanner and retry controller on tokio intervals.
//!
//! Each loop tick first takes the job's watermark in the store, so several
//! processes sharing one database do not run the same job back to back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use textcast_channels::SmsTransport;
use textcast_core::config::{RetryConfig, SchedulerConfig};
use textcast_core::error::Result;
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::message::MessageKind;
use crate::persistence::{ClaimOptions, MessageDb};
use crate::queue::{self, DispatchQueue, QueueStats};
use crate::retry::{RetryPolicy, RetryReport, run_retry};
use crate::scanner::{ScanReport, run_scan};

pub const SCAN_JOB: &str = "scan";
pub const RETRY_JOB: &str = "retry";

/// Runs the periodic delivery jobs.
pub struct SchedulerEngine {
    db: Arc<MessageDb>,
    queue: DispatchQueue,
    config: SchedulerConfig,
    retry_interval_secs: u64,
    policy: RetryPolicy,
}

impl SchedulerEngine {
    pub fn new(
        db: Arc<MessageDb>,
        queue: DispatchQueue,
        config: SchedulerConfig,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            db,
            queue,
            config,
            retry_interval_secs: retry.interval_secs,
            policy: RetryPolicy::from_config(retry),
        }
    }

    /// Build the engine with its dispatch queue and start the delivery
    /// workers. The workers stop once the engine is dropped.
    pub fn start(
        db: Arc<MessageDb>,
        transport: Arc<dyn SmsTransport>,
        config: SchedulerConfig,
        retry: &RetryConfig,
        default_country_code: &str,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (queue, receiver) = queue::channel(config.dispatch_queue_capacity);
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), transport, default_country_code));
        let workers = tokio::spawn(queue::run_workers(
            receiver,
            dispatcher,
            config.dispatch_concurrency,
        ));
        let engine = Arc::new(Self::new(db, queue, config, retry));
        (engine, workers)
    }

    /// Families delivered from this process.
    pub fn pushed_kinds(&self) -> Vec<MessageKind> {
        let mut kinds = Vec::new();
        if self.config.push_manual {
            kinds.push(MessageKind::Scheduled);
        }
        if self.config.push_study {
            kinds.push(MessageKind::Study);
        }
        kinds
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn claim_options(&self) -> ClaimOptions {
        ClaimOptions {
            batch_size: self.config.scan_batch_size,
            claim_timeout: Duration::seconds(self.config.claim_timeout_secs as i64),
            kinds: self.pushed_kinds(),
        }
    }

    /// One scanner pass. `None` when another run holds a recent watermark.
    pub fn scan_once(&self, now: DateTime<Utc>) -> Result<Option<ScanReport>> {
        let kinds = self.pushed_kinds();
        if kinds.is_empty() {
            return Ok(None);
        }
        if !self.db.try_begin_job(SCAN_JOB, now, min_gap(self.config.scan_interval_secs))? {
            tracing::debug!("Scan skipped: ran less than an interval ago");
            return Ok(None);
        }
        let report = run_scan(&self.db, &self.queue, &self.claim_options(), now)?;
        self.db.finish_job(SCAN_JOB, report.claimed as u64)?;
        Ok(Some(report))
    }

    /// One retry pass. `None` when another run holds a recent watermark.
    pub fn retry_once(&self, now: DateTime<Utc>) -> Result<Option<RetryReport>> {
        if !self.db.try_begin_job(RETRY_JOB, now, min_gap(self.retry_interval_secs))? {
            tracing::debug!("Retry skipped: ran less than an interval ago");
            return Ok(None);
        }
        let report = run_retry(&self.db, &self.queue, &self.policy, &self.pushed_kinds(), now)?;
        self.db.finish_job(RETRY_JOB, report.requeued as u64)?;
        Ok(Some(report))
    }

    /// Spawn the scanner and retry loops.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(spawn_scanner(self.clone())),
            tokio::spawn(spawn_retry(self.clone())),
        ]
    }
}

/// Smallest gap between two runs of a job: 90% of its interval, so a tick
/// that fires slightly early still runs.
fn min_gap(interval_secs: u64) -> Duration {
    Duration::milliseconds((interval_secs as i64) * 900)
}

/// Scanner loop.
pub async fn spawn_scanner(engine: Arc<SchedulerEngine>) {
    let secs = engine.config.scan_interval_secs.max(1);
    tracing::info!("⏰ Scanner started (every {secs}s, pushing {:?})", engine.pushed_kinds());
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));

    loop {
        interval.tick().await;
        if let Err(e) = engine.scan_once(Utc::now()) {
            tracing::warn!("⚠️ Scan failed: {e}");
        }
    }
}

/// Retry controller loop.
pub async fn spawn_retry(engine: Arc<SchedulerEngine>) {
    let secs = engine.retry_interval_secs.max(1);
    tracing::info!("⏰ Retry controller started (every {secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));

    loop {
        interval.tick().await;
        if let Err(e) = engine.retry_once(Utc::now()) {
            tracing::warn!("⚠️ Retry pass failed: {e}");
        }
    }
}
