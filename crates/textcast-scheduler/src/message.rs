//! Message definitions and the delivery state machine.
//!
//! Both message families (manually scheduled messages and study-program
//! selections) carry the same [`Delivery`] record, so one set of
//! transitions governs every row:
//!
//! ```text
//! unscheduled ──claim──▶ pending ──▶ sent
//!      ▲                    │
//!      │                    └──────▶ failed ──retry──▶ pending
//!      └──── reschedule ◀──────────────┘
//!
//! any state except sent ──cancel──▶ cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use textcast_core::error::{Result, TextcastError};

/// Delivery status of a single message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, nothing attempted yet.
    Unscheduled,
    /// Claimed for delivery and in flight.
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Unscheduled => "unscheduled",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unscheduled" => Some(DeliveryStatus::Unscheduled),
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "cancelled" => Some(DeliveryStatus::Cancelled),
            _ => None,
        }
    }

    /// No automatic transition ever leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Cancelled)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a row is `failed`. Only transport failures are retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The SMS provider rejected the send or the call errored.
    Transport,
    /// Recipient phone or message content could not be resolved.
    Validation,
    /// The recipient left the group before the broadcast went out.
    MembershipExcluded,
    /// The scanner could not hand the row to the dispatch queue.
    Enqueue,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Transport => "transport",
            FailureReason::Validation => "validation",
            FailureReason::MembershipExcluded => "membership_excluded",
            FailureReason::Enqueue => "enqueue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transport" => Some(FailureReason::Transport),
            "validation" => Some(FailureReason::Validation),
            "membership_excluded" => Some(FailureReason::MembershipExcluded),
            "enqueue" => Some(FailureReason::Enqueue),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Transport)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a transition changed the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The row was already past this point; nothing was written.
    Unchanged,
}

/// Delivery tracking fields shared by both message families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Provider message id reported on success.
    pub external_id: Option<String>,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            status: DeliveryStatus::Unscheduled,
            attempts: 0,
            last_attempt_at: None,
            error: None,
            failure_reason: None,
            delivered_at: None,
            external_id: None,
        }
    }
}

impl Delivery {
    /// Claim the row for a delivery attempt (scanner pick-up or retry requeue).
    /// Counts the attempt up front.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Outcome {
        if self.status.is_terminal() {
            return Outcome::Unchanged;
        }
        self.status = DeliveryStatus::Pending;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.error = None;
        self.failure_reason = None;
        Outcome::Applied
    }

    /// Record a successful delivery. A second report for an already sent
    /// row keeps the first timestamp.
    pub fn mark_sent(&mut self, at: DateTime<Utc>, external_id: Option<String>) -> Outcome {
        if self.status.is_terminal() {
            return Outcome::Unchanged;
        }
        if self.status != DeliveryStatus::Pending {
            // delivered without a claim (reported by an external agent)
            self.attempts += 1;
            self.last_attempt_at = Some(at);
        }
        self.status = DeliveryStatus::Sent;
        self.delivered_at = Some(at);
        self.error = None;
        self.failure_reason = None;
        if external_id.is_some() {
            self.external_id = external_id;
        }
        Outcome::Applied
    }

    /// Record a failed attempt. A claimed row already counted its attempt;
    /// an unclaimed one counts one now. On an already failed row a repeated
    /// transport report changes nothing, a non-retryable reason replaces a
    /// transport one without counting, and a non-retryable reason is final.
    pub fn mark_failed(&mut self, reason: FailureReason, error: &str, at: DateTime<Utc>) -> Outcome {
        if self.status.is_terminal() {
            return Outcome::Unchanged;
        }
        if self.status == DeliveryStatus::Failed {
            let current_retryable = self.failure_reason.is_none_or(|r| r.is_retryable());
            if !current_retryable || reason.is_retryable() {
                return Outcome::Unchanged;
            }
        } else if self.status != DeliveryStatus::Pending {
            self.attempts += 1;
        }
        self.status = DeliveryStatus::Failed;
        self.last_attempt_at = Some(at);
        self.error = Some(if error.trim().is_empty() {
            format!("{} failure", reason.as_str())
        } else {
            error.to_string()
        });
        self.failure_reason = Some(reason);
        self.delivered_at = None;
        Outcome::Applied
    }

    /// Admin cancel. Allowed from every state except `sent`.
    pub fn cancel(&mut self) -> Result<Outcome> {
        match self.status {
            DeliveryStatus::Sent => Err(TextcastError::Conflict(
                "message was already sent and cannot be cancelled".into(),
            )),
            DeliveryStatus::Cancelled => Ok(Outcome::Unchanged),
            _ => {
                self.status = DeliveryStatus::Cancelled;
                Ok(Outcome::Applied)
            }
        }
    }

    /// Return the row to its initial state, clearing the attempt history.
    pub fn reschedule(&mut self) -> Result<()> {
        match self.status {
            DeliveryStatus::Unscheduled | DeliveryStatus::Failed => {
                *self = Delivery::default();
                Ok(())
            }
            other => Err(TextcastError::Conflict(format!(
                "cannot reschedule a message that is {other}"
            ))),
        }
    }

    /// The per-row invariants every write must preserve.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            DeliveryStatus::Sent => self.delivered_at.is_some() && self.error.is_none(),
            DeliveryStatus::Failed => {
                self.attempts >= 1 && self.error.is_some() && self.failure_reason.is_some()
            }
            DeliveryStatus::Pending => self.attempts >= 1 && self.last_attempt_at.is_some(),
            _ => true,
        }
    }
}

/// The two message families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Manually scheduled per-contact / per-group messages.
    Scheduled,
    /// Study-program message selections.
    Study,
}

impl MessageKind {
    pub fn table(&self) -> &'static str {
        match self {
            MessageKind::Scheduled => "scheduled_messages",
            MessageKind::Study => "message_selections",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Scheduled => "scheduled",
            MessageKind::Study => "study",
        }
    }
}

/// Address of one message row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub kind: MessageKind,
    pub id: String,
}

impl MessageRef {
    pub fn scheduled(id: &str) -> Self {
        Self { kind: MessageKind::Scheduled, id: id.to_string() }
    }

    pub fn study(id: &str) -> Self {
        Self { kind: MessageKind::Study, id: id.to_string() }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Who is performing a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Scanner, dispatcher, retry controller. Skips owner checks.
    System,
    /// An authenticated owner; may only touch their own rows.
    Owner(String),
}

/// A manually scheduled message to one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub owner_id: String,
    pub contact_id: String,
    /// Set when this row is one recipient of a group broadcast.
    pub group_id: Option<String>,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub category: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

/// Where a study message's text comes from. Exactly one source per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum StudySource {
    Predefined(String),
    Custom(String),
}

/// A study-program message picked for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSelection {
    pub id: String,
    pub owner_id: String,
    pub lesson_id: String,
    pub source: StudySource,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

/// Contact record (owned by the external contact service).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub phone_number: String,
}

/// Group record (owned by the external contact service).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub color: Option<String>,
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
