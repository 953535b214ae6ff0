//! Retry controller: periodically puts transport failures back in front of
//! the dispatcher, within a bounded window and attempt limit.

use chrono::{DateTime, Duration, Utc};
use textcast_core::config::RetryConfig;
use textcast_core::error::Result;

use crate::message::{Actor, Delivery, DeliveryStatus, FailureReason, MessageKind};
use crate::persistence::MessageDb;
use crate::queue::DispatchQueue;
use crate::scanner::ENQUEUE_FAILED;

/// Which failed rows are retried.
///
/// A row qualifies when its last failure was a transport failure, it has
/// fewer than `max_attempts` attempts, and its last attempt lies in
/// `(now - max_staleness, now - min_cooldown]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_cooldown: Duration,
    pub max_staleness: Duration,
    pub batch_size: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_cooldown: Duration::seconds(config.min_cooldown_secs as i64),
            max_staleness: Duration::seconds(config.max_staleness_secs as i64),
            batch_size: config.batch_size,
        }
    }

    /// `(oldest, newest)` bounds on `last_attempt_at`; oldest is exclusive.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - self.max_staleness, now - self.min_cooldown)
    }

    pub fn is_eligible(&self, d: &Delivery, now: DateTime<Utc>) -> bool {
        if d.status != DeliveryStatus::Failed
            || d.failure_reason != Some(FailureReason::Transport)
            || d.attempts >= self.max_attempts
        {
            return false;
        }
        let (oldest, newest) = self.window(now);
        d.last_attempt_at.is_some_and(|at| at > oldest && at <= newest)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Counts from one retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RetryReport {
    /// Rows moved back to `pending`.
    pub requeued: usize,
    /// Of those, rows handed to the in-process dispatcher.
    pub enqueued: usize,
    /// Rows the dispatch queue refused, failed with [`FailureReason::Enqueue`].
    pub enqueue_failed: usize,
    /// Transport failures past the window or the attempt cap.
    pub abandoned: u64,
}

/// Requeue eligible failures of every family. Rows of `pushed` families go
/// to the dispatch queue; the others wait in `pending` for the delivery
/// agent's next poll.
pub fn run_retry(
    db: &MessageDb,
    queue: &DispatchQueue,
    policy: &RetryPolicy,
    pushed: &[MessageKind],
    now: DateTime<Utc>,
) -> Result<RetryReport> {
    let refs = db.claim_retries(now, policy, &[MessageKind::Scheduled, MessageKind::Study])?;
    let mut report = RetryReport { requeued: refs.len(), ..Default::default() };

    for r in refs.into_iter().filter(|r| pushed.contains(&r.kind)) {
        match queue.enqueue(r.clone()) {
            Ok(()) => report.enqueued += 1,
            Err(e) => {
                tracing::warn!("⚠️ Could not enqueue retry of {r}: {e}");
                db.mark_failed(&Actor::System, &r, FailureReason::Enqueue, ENQUEUE_FAILED, now)?;
                report.enqueue_failed += 1;
            }
        }
    }

    report.abandoned = db.count_abandoned(now, policy)?;
    if report.requeued > 0 || report.abandoned > 0 {
        tracing::info!(
            "🔁 Retry: {} requeued ({} to dispatcher, {} enqueue failures), {} abandoned",
            report.requeued,
            report.enqueued,
            report.enqueue_failed,
            report.abandoned
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Actor, MessageRef};
    use crate::queue;

    #[test]
    fn test_eligibility_window() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let failed = |attempts: u32, ago: Duration| Delivery {
            status: DeliveryStatus::Failed,
            attempts,
            last_attempt_at: Some(now - ago),
            error: Some("timeout".into()),
            failure_reason: Some(FailureReason::Transport),
            ..Delivery::default()
        };

        assert!(policy.is_eligible(&failed(1, Duration::hours(2)), now));
        assert!(policy.is_eligible(&failed(1, Duration::hours(1)), now));
        assert!(!policy.is_eligible(&failed(1, Duration::minutes(30)), now));
        assert!(!policy.is_eligible(&failed(1, Duration::hours(24)), now));
        assert!(!policy.is_eligible(&failed(3, Duration::hours(2)), now));

        let mut excluded = failed(1, Duration::hours(2));
        excluded.failure_reason = Some(FailureReason::MembershipExcluded);
        assert!(!policy.is_eligible(&excluded, now));
    }

    #[test]
    fn test_pull_family_is_requeued_but_not_enqueued() {
        let db = MessageDb::open_in_memory().unwrap();
        let c = db.add_contact("u1", "A", "+15550000001").unwrap();
        let now = Utc::now();
        let m = db
            .schedule_message("u1", &c.id, "Hi", now - Duration::hours(3), None, None)
            .unwrap();
        let r = MessageRef::scheduled(&m.id);
        db.mark_failed(&Actor::System, &r, FailureReason::Transport, "timeout", now - Duration::hours(2))
            .unwrap();
        let (queue, _rx) = queue::channel(8);

        let report = run_retry(&db, &queue, &RetryPolicy::default(), &[MessageKind::Study], now).unwrap();
        assert_eq!(report, RetryReport { requeued: 1, ..Default::default() });
        let d = db.get_delivery(&r).unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.attempts, 2);
        assert_eq!(queue.stats().enqueued, 0);
    }

    #[test]
    fn test_pushed_family_is_enqueued() {
        let db = MessageDb::open_in_memory().unwrap();
        let c = db.add_contact("u1", "A", "+15550000001").unwrap();
        let now = Utc::now();
        let m = db
            .schedule_message("u1", &c.id, "Hi", now - Duration::hours(3), None, None)
            .unwrap();
        let r = MessageRef::scheduled(&m.id);
        db.mark_failed(&Actor::System, &r, FailureReason::Transport, "timeout", now - Duration::hours(2))
            .unwrap();
        let (queue, _rx) = queue::channel(8);

        let report = run_retry(&db, &queue, &RetryPolicy::default(), &[MessageKind::Scheduled], now).unwrap();
        assert_eq!(report.enqueued, 1);
    }

    #[test]
    fn test_refused_retry_is_failed_as_enqueue() {
        let db = MessageDb::open_in_memory().unwrap();
        let c = db.add_contact("u1", "A", "+15550000001").unwrap();
        let now = Utc::now();
        for text in ["one", "two"] {
            let m = db
                .schedule_message("u1", &c.id, text, now - Duration::hours(3), None, None)
                .unwrap();
            db.mark_failed(
                &Actor::System,
                &MessageRef::scheduled(&m.id),
                FailureReason::Transport,
                "timeout",
                now - Duration::hours(2),
            )
            .unwrap();
        }
        let (queue, _rx) = queue::channel(1);

        let report = run_retry(&db, &queue, &RetryPolicy::default(), &[MessageKind::Scheduled], now).unwrap();
        assert_eq!(report.requeued, 2);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.enqueue_failed, 1);

        let failed = db.failed_messages(Some("u1"), now, &RetryPolicy::default()).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].delivery.failure_reason, Some(FailureReason::Enqueue));
        assert_eq!(failed[0].delivery.attempts, 2);
        assert!(!failed[0].retry_eligible);
    }
}
