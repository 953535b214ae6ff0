//! # Textcast Scheduler
//!
//! Scheduled SMS delivery engine: holds scheduled and study messages, moves
//! them through the delivery state machine, and delivers them.
//!
//! ## Design Principles
//! - SQLite persistence: every status write is one forward-only transition
//! - Tokio timers only, zero overhead when idle
//! - Claims are atomic, so overlapping scanners never double-send a row
//! - Broadcasts follow live group membership up to the moment they go out
//!
//! ## Architecture
//! ```text
//! Scanner (tokio interval)                 Delivery agent (HTTP pull)
//!   ├── reconcile due broadcasts              ├── GET  pending work
//!   ├── claim due rows → pending              └── POST sent / failed reports
//!   └── DispatchQueue ─▶ workers ─▶ Dispatcher ─▶ SmsTransport
//!                                      │
//! Retry controller (tokio interval)    └── mark sent / failed
//!   └── failed (transport, in window) → pending → DispatchQueue
//! ```

pub mod dispatch;
pub mod engine;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod scanner;
pub mod stats;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::SchedulerEngine;
pub use message::{
    Actor, Contact, Delivery, DeliveryStatus, FailureReason, Group, MessageKind, MessageRef,
    MessageSelection, Outcome, ScheduledMessage, StudySource,
};
pub use persistence::{
    BulkMode, BulkReport, DueItem, FailedMessage, MessageDb, PendingFilter, StudyDueItem,
};
pub use queue::{DispatchQueue, QueueStats};
pub use reconcile::BroadcastKey;
pub use retry::RetryPolicy;
pub use stats::{DeliveryStats, TimeRange};
