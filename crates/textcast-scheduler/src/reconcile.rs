//! Group membership reconciliation.
//!
//! A broadcast is not stored as such; it is the set of per-recipient rows
//! sharing a [`BroadcastKey`]. Before a bucket is reported as due it is
//! brought in line with live membership: late joiners get a row, rows of
//! contacts who left are failed with [`FailureReason::MembershipExcluded`].
//!
//! The functions here are pure; the store applies the resulting plan inside
//! its transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::message::{DeliveryStatus, FailureReason, ScheduledMessage};

/// Note recorded on rows excluded because the contact left the group.
pub const REMOVED_FROM_GROUP: &str = "removed from group";

/// Derived identity of one logical group send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BroadcastKey {
    pub group_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub message: String,
}

impl BroadcastKey {
    /// Key of a row, if it belongs to a group.
    pub fn of(msg: &ScheduledMessage) -> Option<Self> {
        msg.group_id.as_ref().map(|group_id| Self {
            group_id: group_id.clone(),
            scheduled_at: msg.scheduled_at,
            message: msg.message.clone(),
        })
    }

    /// Stable display id for the aggregated view: group, time, and a
    /// truncated SHA-256 over the full key tuple. Not a security boundary.
    pub fn synthetic_id(&self) -> String {
        let ms = self.scheduled_at.timestamp_millis();
        let hash = short_hash(&[
            self.group_id.as_bytes(),
            &ms.to_be_bytes(),
            self.message.as_bytes(),
        ]);
        format!("group_{}_{}_{}", self.group_id, ms, hash)
    }
}

/// First 16 hex chars of SHA-256 over NUL-separated parts.
pub(crate) fn short_hash(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Split rows into individually addressed singles and broadcast buckets.
pub fn partition(
    rows: Vec<ScheduledMessage>,
) -> (Vec<ScheduledMessage>, BTreeMap<BroadcastKey, Vec<ScheduledMessage>>) {
    let mut singles = Vec::new();
    let mut buckets: BTreeMap<BroadcastKey, Vec<ScheduledMessage>> = BTreeMap::new();
    for row in rows {
        match BroadcastKey::of(&row) {
            Some(key) => buckets.entry(key).or_default().push(row),
            None => singles.push(row),
        }
    }
    (singles, buckets)
}

/// What it takes to make a bucket match membership.
#[derive(Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Members with no live row in the bucket.
    pub missing_contacts: Vec<String>,
    /// Rows whose contact is no longer a member.
    pub excluded_rows: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.missing_contacts.is_empty() && self.excluded_rows.is_empty()
    }
}

fn is_excluded(row: &ScheduledMessage) -> bool {
    row.delivery.status == DeliveryStatus::Failed
        && row.delivery.failure_reason == Some(FailureReason::MembershipExcluded)
}

/// Compute the plan for one bucket. `rows` must be every row under the key,
/// whatever its status, so already-sent or cancelled recipients are not
/// given a second row.
pub fn plan(rows: &[ScheduledMessage], members: &BTreeSet<String>) -> ReconcilePlan {
    let covered: HashSet<&str> = rows
        .iter()
        .filter(|r| !is_excluded(r))
        .map(|r| r.contact_id.as_str())
        .collect();

    let missing_contacts = members
        .iter()
        .filter(|c| !covered.contains(c.as_str()))
        .cloned()
        .collect();

    let excluded_rows = rows
        .iter()
        .filter(|r| !r.delivery.status.is_terminal() && !is_excluded(r))
        .filter(|r| !members.contains(&r.contact_id))
        .map(|r| r.id.clone())
        .collect();

    ReconcilePlan { missing_contacts, excluded_rows }
}

/// Aggregated due-work view of one reconciled bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedBroadcast {
    pub id: String,
    pub key: BroadcastKey,
    /// Deduplicated recipient phone numbers, in row order.
    pub recipients: Vec<String>,
    /// Row ids to report back against.
    pub message_ids: Vec<String>,
    pub category: Option<String>,
}

/// Build the aggregated view from the deliverable rows of a reconciled
/// bucket, each paired with its contact's phone number.
pub fn aggregate(key: &BroadcastKey, rows: &[(ScheduledMessage, String)]) -> AggregatedBroadcast {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    let mut message_ids = Vec::with_capacity(rows.len());
    for (row, phone) in rows {
        message_ids.push(row.id.clone());
        if seen.insert(phone.clone()) {
            recipients.push(phone.clone());
        }
    }
    AggregatedBroadcast {
        id: key.synthetic_id(),
        key: key.clone(),
        recipients,
        message_ids,
        category: rows.iter().find_map(|(r, _)| r.category.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Delivery;
    use chrono::TimeZone;

    fn row(id: &str, contact: &str, status: DeliveryStatus) -> ScheduledMessage {
        ScheduledMessage {
            id: id.into(),
            owner_id: "owner".into(),
            contact_id: contact.into(),
            group_id: Some("g1".into()),
            message: "Hi".into(),
            scheduled_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            category: Some("reminder".into()),
            notes: None,
            created_at: Utc::now(),
            delivery: Delivery { status, ..Delivery::default() },
        }
    }

    fn members(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_late_joiner_and_leaver() {
        let rows = vec![
            row("r-a", "A", DeliveryStatus::Unscheduled),
            row("r-b", "B", DeliveryStatus::Unscheduled),
        ];
        let plan = plan(&rows, &members(&["A", "C"]));
        assert_eq!(plan.missing_contacts, vec!["C".to_string()]);
        assert_eq!(plan.excluded_rows, vec!["r-b".to_string()]);
    }

    #[test]
    fn test_sent_rows_are_neither_recreated_nor_excluded() {
        let rows = vec![row("r-a", "A", DeliveryStatus::Sent)];
        assert!(plan(&rows, &members(&["A"])).is_empty());
        // A left after receiving it: nothing to undo
        assert!(plan(&rows, &members(&[])).is_empty());
    }

    #[test]
    fn test_rejoined_member_gets_a_new_row() {
        let mut excluded = row("r-a", "A", DeliveryStatus::Failed);
        excluded.delivery.failure_reason = Some(FailureReason::MembershipExcluded);
        excluded.delivery.attempts = 1;
        let plan = plan(&[excluded], &members(&["A"]));
        assert_eq!(plan.missing_contacts, vec!["A".to_string()]);
        assert!(plan.excluded_rows.is_empty());
    }

    #[test]
    fn test_partition_and_synthetic_id() {
        let mut single = row("s1", "A", DeliveryStatus::Unscheduled);
        single.group_id = None;
        let (singles, buckets) = partition(vec![
            single,
            row("r-a", "A", DeliveryStatus::Unscheduled),
            row("r-b", "B", DeliveryStatus::Unscheduled),
        ]);
        assert_eq!(singles.len(), 1);
        assert_eq!(buckets.len(), 1);

        let key = buckets.keys().next().unwrap().clone();
        assert_eq!(key.synthetic_id(), key.clone().synthetic_id());
        let mut other = key.clone();
        other.message = "Hi!".into();
        assert_ne!(key.synthetic_id(), other.synthetic_id());
        assert!(key.synthetic_id().starts_with("group_g1_"));
    }

    #[test]
    fn test_aggregate_dedups_phones() {
        let key = BroadcastKey::of(&row("r-a", "A", DeliveryStatus::Unscheduled)).unwrap();
        let view = aggregate(
            &key,
            &[
                (row("r-a", "A", DeliveryStatus::Unscheduled), "+15550000001".into()),
                (row("r-b", "B", DeliveryStatus::Unscheduled), "+15550000001".into()),
                (row("r-c", "C", DeliveryStatus::Pending), "+15550000003".into()),
            ],
        );
        assert_eq!(view.recipients, vec!["+15550000001", "+15550000003"]);
        assert_eq!(view.message_ids.len(), 3);
        assert_eq!(view.category.as_deref(), Some("reminder"));
    }
}
