//! Due-message scanner: one pass claims due rows and hands them to the
//! dispatch queue.

use chrono::{DateTime, Utc};
use textcast_core::error::Result;

use crate::message::{Actor, FailureReason};
use crate::persistence::{ClaimOptions, MessageDb};
use crate::queue::DispatchQueue;

/// Recorded on rows the queue refused.
pub const ENQUEUE_FAILED: &str = "failed to enqueue";

/// Counts from one scanner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanReport {
    pub claimed: usize,
    pub enqueued: usize,
    pub enqueue_failed: usize,
}

/// Claim up to `opts.batch_size` due rows and enqueue each one. A row the
/// queue refuses is failed with [`FailureReason::Enqueue`] so it does not
/// sit in `pending` until the claim timeout.
pub fn run_scan(
    db: &MessageDb,
    queue: &DispatchQueue,
    opts: &ClaimOptions,
    now: DateTime<Utc>,
) -> Result<ScanReport> {
    let claimed = db.claim_due(now, opts)?;
    let mut report = ScanReport { claimed: claimed.len(), ..Default::default() };

    for r in claimed {
        match queue.enqueue(r.clone()) {
            Ok(()) => report.enqueued += 1,
            Err(e) => {
                tracing::warn!("⚠️ Could not enqueue {r}: {e}");
                db.mark_failed(&Actor::System, &r, FailureReason::Enqueue, ENQUEUE_FAILED, now)?;
                report.enqueue_failed += 1;
            }
        }
    }

    if report.claimed > 0 {
        tracing::info!(
            "🔎 Scan: {} claimed, {} enqueued, {} enqueue failures",
            report.claimed,
            report.enqueued,
            report.enqueue_failed
        );
    }
    Ok(report)
}
