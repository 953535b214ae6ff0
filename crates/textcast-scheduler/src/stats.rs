//! Delivery statistics.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use textcast_core::error::{Result, TextcastError};

use crate::message::{DeliveryStatus, FailureReason};

/// Row counts per delivery state for one owner and family.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub total: u64,
    pub unscheduled: u64,
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Failed rows excluded by a group membership change (subset of `failed`).
    pub excluded: u64,
    /// Sum of attempts across all rows.
    pub attempts: u64,
}

impl DeliveryStats {
    pub(crate) fn add(
        &mut self,
        status: DeliveryStatus,
        reason: Option<FailureReason>,
        count: u64,
        attempts: u64,
    ) {
        self.total += count;
        self.attempts += attempts;
        match status {
            DeliveryStatus::Unscheduled => self.unscheduled += count,
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Sent => self.sent += count,
            DeliveryStatus::Cancelled => self.cancelled += count,
            DeliveryStatus::Failed => {
                self.failed += count;
                if reason == Some(FailureReason::MembershipExcluded) {
                    self.excluded += count;
                }
            }
        }
    }

    /// Percentage of finished deliveries that succeeded, ignoring
    /// membership exclusions. `None` before anything finished.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.sent + self.failed - self.excluded;
        if finished == 0 {
            return None;
        }
        Some(self.sent as f64 * 100.0 / finished as f64)
    }
}

/// Reporting window accepted by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRange {
    Day,
    #[default]
    Week,
    Month,
    All,
}

impl TimeRange {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "24h" | "1d" => Ok(TimeRange::Day),
            "7d" => Ok(TimeRange::Week),
            "30d" => Ok(TimeRange::Month),
            "all" => Ok(TimeRange::All),
            other => Err(TextcastError::InvalidInput(format!(
                "unknown time range '{other}' (expected 24h, 7d, 30d or all)"
            ))),
        }
    }

    /// Lower bound on `scheduled_at`, if any.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeRange::Day => Some(now - Duration::hours(24)),
            TimeRange::Week => Some(now - Duration::days(7)),
            TimeRange::Month => Some(now - Duration::days(30)),
            TimeRange::All => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_ignores_exclusions() {
        let mut s = DeliveryStats::default();
        assert_eq!(s.success_rate(), None);
        s.add(DeliveryStatus::Sent, None, 3, 3);
        s.add(DeliveryStatus::Failed, Some(FailureReason::Transport), 1, 3);
        s.add(DeliveryStatus::Failed, Some(FailureReason::MembershipExcluded), 2, 2);
        assert_eq!(s.total, 6);
        assert_eq!(s.failed, 3);
        assert_eq!(s.success_rate(), Some(75.0));
    }

    #[test]
    fn test_time_range() {
        let now = Utc::now();
        assert_eq!(TimeRange::parse("24h").unwrap().since(now), Some(now - Duration::hours(24)));
        assert_eq!(TimeRange::parse("all").unwrap().since(now), None);
        assert!(TimeRange::parse("1y").is_err());
    }
}
