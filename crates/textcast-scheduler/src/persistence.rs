//! SQLite-backed message store.
//!
//! Holds both message families, the collaborator tables they reference
//! (owners, contacts, groups, lessons, message content), and the job
//! watermarks. Every status write goes through [`transition`], the single
//! ownership-gated, forward-only write primitive shared by the jobs and the
//! HTTP boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use textcast_core::error::{Result, TextcastError};
use textcast_core::time::from_millis_lossy;

use crate::message::{
    Actor, Contact, Delivery, DeliveryStatus, FailureReason, Group, MessageKind, MessageRef,
    MessageSelection, Outcome, ScheduledMessage, StudySource, new_id,
};
use crate::reconcile::{self, BroadcastKey, REMOVED_FROM_GROUP};
use crate::retry::RetryPolicy;
use crate::stats::DeliveryStats;

/// SQLite-backed store for all delivery engine data.
pub struct MessageDb {
    conn: Mutex<Connection>,
}

/// How a bulk status write treats a bad id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkMode {
    /// Write ids in order; the first bad id aborts the rest and earlier
    /// writes stay applied.
    #[default]
    PartialApply,
    /// Check every id for existence and ownership before writing any.
    ValidateFirst,
}

/// Result of a bulk status write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub applied: usize,
    /// Ids already past the reported state (duplicate or stale reports).
    pub unchanged: usize,
}

/// Options for one scanner claim pass.
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    pub batch_size: usize,
    /// Pending rows whose attempt is older than this are claimed again.
    pub claim_timeout: Duration,
    /// Families the in-process dispatcher delivers.
    pub kinds: Vec<MessageKind>,
}

/// Filters for the manual-family due-work query.
#[derive(Debug, Clone, Default)]
pub struct PendingFilter {
    pub category: Option<String>,
    /// Only messages scheduled at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub group_only: bool,
}

/// One entry of manual-family due work, either a single message or an
/// aggregated broadcast.
#[derive(Debug, Clone)]
pub struct DueItem {
    pub id: String,
    pub message: String,
    /// Contact name, or the group name for broadcasts.
    pub contact_name: String,
    /// Contact phone, or all recipients comma-joined for broadcasts.
    pub phone_number: String,
    pub recipients: Vec<String>,
    pub group: Option<Group>,
    pub scheduled_at: DateTime<Utc>,
    pub category: Option<String>,
    pub message_ids: Vec<String>,
}

/// Study-family due work, grouped by (lesson, time, content).
#[derive(Debug, Clone)]
pub struct StudyDueItem {
    pub id: String,
    pub lesson_id: String,
    pub lesson_title: Option<String>,
    pub message: String,
    pub phone_number: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub message_ids: Vec<String>,
}

/// What the dispatcher needs to deliver one row.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub owner_id: String,
    pub status: DeliveryStatus,
    pub phone: Option<String>,
    pub text: Option<String>,
}

/// A failed row as shown in the admin failed-messages view.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub message: MessageRef,
    pub owner_id: String,
    pub summary: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub delivery: Delivery,
    /// Whether the retry controller will still pick it up.
    pub retry_eligible: bool,
}

/// Persisted state of a periodic job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub last_run_at: DateTime<Utc>,
    pub last_count: u64,
}

const SCHEDULED_SELECT: &str = "SELECT m.id, m.owner_id, m.contact_id, m.group_id, m.message, \
     m.scheduled_at, m.category, m.notes, m.created_at, m.status, m.attempts, m.last_attempt_at, \
     m.error, m.failure_reason, m.delivered_at, m.external_id FROM scheduled_messages m";

const SELECTION_SELECT: &str = "SELECT s.id, s.owner_id, s.lesson_id, s.predefined_message_id, \
     s.custom_message_id, s.scheduled_at, s.is_scheduled, s.created_at, s.status, s.attempts, \
     s.last_attempt_at, s.error, s.failure_reason, s.delivered_at, s.external_id \
     FROM message_selections s";

/// Status filter for rows the scanner may claim. `:stale` is the claim
/// timeout cutoff; pending rows older than it were abandoned mid-flight.
const DUE_STATUS: &str = "(status = 'unscheduled' OR (status = 'pending' \
     AND (last_attempt_at IS NULL OR last_attempt_at <= :stale)))";

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn opt_ms(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(ms)
}

fn sql_err(ctx: &'static str) -> impl Fn(rusqlite::Error) -> TextcastError {
    move |e| TextcastError::Database(format!("{ctx}: {e}"))
}

fn read_delivery(row: &rusqlite::Row, base: usize) -> rusqlite::Result<Delivery> {
    let status: String = row.get(base)?;
    let reason: Option<String> = row.get(base + 4)?;
    Ok(Delivery {
        status: DeliveryStatus::parse(&status).unwrap_or_else(|| {
            tracing::warn!("Unknown delivery status '{status}' in store");
            DeliveryStatus::Unscheduled
        }),
        attempts: row.get(base + 1)?,
        last_attempt_at: row.get::<_, Option<i64>>(base + 2)?.map(from_millis_lossy),
        error: row.get(base + 3)?,
        failure_reason: reason.as_deref().and_then(FailureReason::parse),
        delivered_at: row.get::<_, Option<i64>>(base + 5)?.map(from_millis_lossy),
        external_id: row.get(base + 6)?,
    })
}

fn row_to_scheduled(row: &rusqlite::Row) -> rusqlite::Result<ScheduledMessage> {
    Ok(ScheduledMessage {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        contact_id: row.get(2)?,
        group_id: row.get(3)?,
        message: row.get(4)?,
        scheduled_at: from_millis_lossy(row.get(5)?),
        category: row.get(6)?,
        notes: row.get(7)?,
        created_at: from_millis_lossy(row.get(8)?),
        delivery: read_delivery(row, 9)?,
    })
}

fn row_to_selection(row: &rusqlite::Row) -> rusqlite::Result<MessageSelection> {
    let predefined: Option<String> = row.get(3)?;
    let custom: Option<String> = row.get(4)?;
    let source = match (predefined, custom) {
        (Some(p), _) => StudySource::Predefined(p),
        (None, Some(c)) => StudySource::Custom(c),
        (None, None) => {
            return Err(rusqlite::Error::InvalidColumnType(
                3,
                "predefined_message_id".into(),
                rusqlite::types::Type::Null,
            ));
        }
    };
    Ok(MessageSelection {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        lesson_id: row.get(2)?,
        source,
        scheduled_at: row.get::<_, Option<i64>>(5)?.map(from_millis_lossy),
        is_scheduled: row.get::<_, i32>(6)? != 0,
        created_at: from_millis_lossy(row.get(7)?),
        delivery: read_delivery(row, 8)?,
    })
}

fn load_delivery(conn: &Connection, r: &MessageRef) -> Result<Option<(String, Delivery)>> {
    let sql = format!(
        "SELECT owner_id, status, attempts, last_attempt_at, error, failure_reason, \
         delivered_at, external_id FROM {} WHERE id = ?1",
        r.kind.table()
    );
    conn.query_row(&sql, [&r.id], |row| Ok((row.get(0)?, read_delivery(row, 1)?)))
        .optional()
        .map_err(sql_err("Load delivery"))
}

fn write_delivery(conn: &Connection, r: &MessageRef, d: &Delivery) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = ?1, attempts = ?2, last_attempt_at = ?3, error = ?4, \
         failure_reason = ?5, delivered_at = ?6, external_id = ?7 WHERE id = ?8",
        r.kind.table()
    );
    conn.execute(
        &sql,
        params![
            d.status.as_str(),
            d.attempts,
            opt_ms(d.last_attempt_at),
            d.error,
            d.failure_reason.map(|f| f.as_str()),
            opt_ms(d.delivered_at),
            d.external_id,
            r.id,
        ],
    )
    .map_err(sql_err("Write delivery"))?;
    Ok(())
}

fn check_owner(actor: &Actor, owner_id: &str, r: &MessageRef) -> Result<()> {
    if let Actor::Owner(caller) = actor
        && caller != owner_id
    {
        return Err(TextcastError::Forbidden(format!(
            "message {} belongs to another owner",
            r.id
        )));
    }
    Ok(())
}

/// Load a row's delivery record, check the actor may write it, apply `f`,
/// and persist the result if anything changed.
fn transition<F>(conn: &Connection, actor: &Actor, r: &MessageRef, f: F) -> Result<Outcome>
where
    F: FnOnce(&mut Delivery) -> Result<Outcome>,
{
    let (owner_id, mut delivery) = load_delivery(conn, r)?
        .ok_or_else(|| TextcastError::NotFound(format!("message {}", r.id)))?;
    check_owner(actor, &owner_id, r)?;
    let outcome = f(&mut delivery)?;
    if outcome == Outcome::Applied {
        write_delivery(conn, r, &delivery)?;
    }
    Ok(outcome)
}

/// Attach bulk progress to an error that aborted a partial-apply write.
fn with_progress(err: TextcastError, applied: usize, total: usize) -> TextcastError {
    let note = |m: String| format!("{m} ({applied} of {total} writes applied before abort)");
    match err {
        TextcastError::Forbidden(m) => TextcastError::Forbidden(note(m)),
        TextcastError::NotFound(m) => TextcastError::NotFound(note(m)),
        TextcastError::Conflict(m) => TextcastError::Conflict(note(m)),
        other => other,
    }
}

impl MessageDb {
    /// Open or create the message database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err("DB open"))?;
        // WAL lets the gateway's key store share the file
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .ok();
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err("DB open"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TextcastError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            -- Collaborator data (owned by external services, mirrored here)
            CREATE TABLE IF NOT EXISTS owners (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                phone_number TEXT                -- study messages go here
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                phone_number TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contact_groups (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                color TEXT
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, contact_id)
            );

            CREATE TABLE IF NOT EXISTS lessons (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS predefined_messages (
                id TEXT PRIMARY KEY,
                lesson_id TEXT NOT NULL,
                content TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS custom_messages (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                lesson_id TEXT NOT NULL,
                content TEXT NOT NULL
            );

            -- Manual family: one row per recipient
            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                group_id TEXT,
                message TEXT NOT NULL,
                scheduled_at INTEGER NOT NULL,   -- epoch ms
                category TEXT,
                notes TEXT,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'unscheduled',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                error TEXT,
                failure_reason TEXT,             -- transport, validation, membership_excluded, enqueue
                delivered_at INTEGER,
                external_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_messages(status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_scheduled_broadcast
                ON scheduled_messages(group_id, scheduled_at);

            -- Study family
            CREATE TABLE IF NOT EXISTS message_selections (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                lesson_id TEXT NOT NULL,
                predefined_message_id TEXT,
                custom_message_id TEXT,
                scheduled_at INTEGER,
                is_scheduled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'unscheduled',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                error TEXT,
                failure_reason TEXT,
                delivered_at INTEGER,
                external_id TEXT,
                CHECK ((predefined_message_id IS NULL) <> (custom_message_id IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_selection_due ON message_selections(status, scheduled_at);

            -- Periodic job watermarks
            CREATE TABLE IF NOT EXISTS job_runs (
                job TEXT PRIMARY KEY,
                last_run_at INTEGER NOT NULL,
                last_count INTEGER NOT NULL DEFAULT 0
            );
         ",
            )
            .map_err(sql_err("Migration"))?;
        Ok(())
    }

    // ─── Collaborator records ─────────────────────────────────

    /// Insert or update an owner profile.
    pub fn upsert_owner(&self, id: &str, name: &str, phone_number: Option<&str>) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO owners (id, name, phone_number) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, phone_number = excluded.phone_number",
                params![id, name, phone_number],
            )
            .map_err(sql_err("Upsert owner"))?;
        Ok(())
    }

    pub fn add_contact(&self, owner_id: &str, name: &str, phone_number: &str) -> Result<Contact> {
        let contact = Contact {
            id: new_id(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            phone_number: phone_number.to_string(),
        };
        self.lock()?
            .execute(
                "INSERT INTO contacts (id, owner_id, name, phone_number) VALUES (?1, ?2, ?3, ?4)",
                params![contact.id, contact.owner_id, contact.name, contact.phone_number],
            )
            .map_err(sql_err("Add contact"))?;
        Ok(contact)
    }

    pub fn create_group(&self, owner_id: &str, name: &str, color: Option<&str>) -> Result<Group> {
        let group = Group {
            id: new_id(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            color: color.map(String::from),
        };
        self.lock()?
            .execute(
                "INSERT INTO contact_groups (id, owner_id, name, color) VALUES (?1, ?2, ?3, ?4)",
                params![group.id, group.owner_id, group.name, group.color],
            )
            .map_err(sql_err("Create group"))?;
        Ok(group)
    }

    pub fn add_group_member(&self, group_id: &str, contact_id: &str) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO group_members (group_id, contact_id, added_at) VALUES (?1, ?2, ?3)",
                params![group_id, contact_id, ms(Utc::now())],
            )
            .map_err(sql_err("Add group member"))?;
        Ok(())
    }

    pub fn remove_group_member(&self, group_id: &str, contact_id: &str) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND contact_id = ?2",
                params![group_id, contact_id],
            )
            .map_err(sql_err("Remove group member"))?;
        Ok(())
    }

    pub fn add_lesson(&self, title: &str) -> Result<String> {
        let id = new_id();
        self.lock()?
            .execute("INSERT INTO lessons (id, title) VALUES (?1, ?2)", params![id, title])
            .map_err(sql_err("Add lesson"))?;
        Ok(id)
    }

    pub fn add_predefined_message(&self, lesson_id: &str, content: &str) -> Result<String> {
        let id = new_id();
        self.lock()?
            .execute(
                "INSERT INTO predefined_messages (id, lesson_id, content) VALUES (?1, ?2, ?3)",
                params![id, lesson_id, content],
            )
            .map_err(sql_err("Add predefined message"))?;
        Ok(id)
    }

    pub fn add_custom_message(&self, owner_id: &str, lesson_id: &str, content: &str) -> Result<String> {
        let id = new_id();
        self.lock()?
            .execute(
                "INSERT INTO custom_messages (id, owner_id, lesson_id, content) VALUES (?1, ?2, ?3, ?4)",
                params![id, owner_id, lesson_id, content],
            )
            .map_err(sql_err("Add custom message"))?;
        Ok(id)
    }

    // ─── Scheduling ───────────────────────────────────────────

    /// Schedule a message to one of the owner's contacts.
    pub fn schedule_message(
        &self,
        owner_id: &str,
        contact_id: &str,
        message: &str,
        at: DateTime<Utc>,
        category: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ScheduledMessage> {
        if message.trim().is_empty() {
            return Err(TextcastError::InvalidInput("message text is empty".into()));
        }
        let conn = self.lock()?;
        let contact_owner: Option<String> = conn
            .query_row("SELECT owner_id FROM contacts WHERE id = ?1", [contact_id], |r| r.get(0))
            .optional()
            .map_err(sql_err("Load contact"))?;
        match contact_owner {
            None => return Err(TextcastError::NotFound(format!("contact {contact_id}"))),
            Some(o) if o != owner_id => {
                return Err(TextcastError::Forbidden(format!(
                    "contact {contact_id} belongs to another owner"
                )));
            }
            Some(_) => {}
        }
        let msg = new_scheduled(owner_id, contact_id, None, message, at, category, notes);
        insert_scheduled(&conn, &msg)?;
        tracing::info!("📅 Message scheduled: {} → contact {} at {}", msg.id, contact_id, at);
        Ok(msg)
    }

    /// Fan a broadcast out to every current member of the group.
    pub fn schedule_broadcast(
        &self,
        owner_id: &str,
        group_id: &str,
        message: &str,
        at: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<ScheduledMessage>> {
        if message.trim().is_empty() {
            return Err(TextcastError::InvalidInput("message text is empty".into()));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;
        let group = load_group(&tx, group_id)?
            .ok_or_else(|| TextcastError::NotFound(format!("group {group_id}")))?;
        if group.owner_id != owner_id {
            return Err(TextcastError::Forbidden(format!(
                "group {group_id} belongs to another owner"
            )));
        }
        let members = group_member_ids(&tx, group_id)?;
        if members.is_empty() {
            return Err(TextcastError::InvalidInput(format!("group {group_id} has no members")));
        }
        let mut rows = Vec::with_capacity(members.len());
        for contact_id in &members {
            let msg = new_scheduled(owner_id, contact_id, Some(group_id), message, at, category, None);
            insert_scheduled(&tx, &msg)?;
            rows.push(msg);
        }
        tx.commit().map_err(sql_err("Commit"))?;
        tracing::info!(
            "📅 Broadcast scheduled: group '{}' ({} recipients) at {}",
            group.name,
            rows.len(),
            at
        );
        Ok(rows)
    }

    /// Pick a study message for delivery. `at = None` stores the selection
    /// without scheduling it.
    pub fn select_study_message(
        &self,
        owner_id: &str,
        lesson_id: &str,
        source: StudySource,
        at: Option<DateTime<Utc>>,
    ) -> Result<MessageSelection> {
        let conn = self.lock()?;
        match &source {
            StudySource::Predefined(id) => {
                let exists: Option<String> = conn
                    .query_row("SELECT id FROM predefined_messages WHERE id = ?1", [id], |r| r.get(0))
                    .optional()
                    .map_err(sql_err("Load predefined message"))?;
                if exists.is_none() {
                    return Err(TextcastError::NotFound(format!("predefined message {id}")));
                }
            }
            StudySource::Custom(id) => {
                let owner: Option<String> = conn
                    .query_row("SELECT owner_id FROM custom_messages WHERE id = ?1", [id], |r| r.get(0))
                    .optional()
                    .map_err(sql_err("Load custom message"))?;
                match owner {
                    None => return Err(TextcastError::NotFound(format!("custom message {id}"))),
                    Some(o) if o != owner_id => {
                        return Err(TextcastError::Forbidden(format!(
                            "custom message {id} belongs to another owner"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let selection = MessageSelection {
            id: new_id(),
            owner_id: owner_id.to_string(),
            lesson_id: lesson_id.to_string(),
            source,
            scheduled_at: at,
            is_scheduled: at.is_some(),
            created_at: Utc::now(),
            delivery: Delivery::default(),
        };
        let (predefined, custom) = match &selection.source {
            StudySource::Predefined(id) => (Some(id.as_str()), None),
            StudySource::Custom(id) => (None, Some(id.as_str())),
        };
        conn.execute(
            "INSERT INTO message_selections
             (id, owner_id, lesson_id, predefined_message_id, custom_message_id, scheduled_at,
              is_scheduled, created_at, status, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'unscheduled', 0)",
            params![
                selection.id,
                selection.owner_id,
                selection.lesson_id,
                predefined,
                custom,
                opt_ms(selection.scheduled_at),
                selection.is_scheduled as i32,
                ms(selection.created_at),
            ],
        )
        .map_err(sql_err("Insert selection"))?;
        Ok(selection)
    }

    // ─── Reads ────────────────────────────────────────────────

    pub fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        let conn = self.lock()?;
        conn.query_row(&format!("{SCHEDULED_SELECT} WHERE m.id = ?1"), [id], row_to_scheduled)
            .optional()
            .map_err(sql_err("Get message"))
    }

    pub fn get_selection(&self, id: &str) -> Result<Option<MessageSelection>> {
        let conn = self.lock()?;
        conn.query_row(&format!("{SELECTION_SELECT} WHERE s.id = ?1"), [id], row_to_selection)
            .optional()
            .map_err(sql_err("Get selection"))
    }

    /// Delivery record of any row.
    pub fn get_delivery(&self, r: &MessageRef) -> Result<Option<Delivery>> {
        let conn = self.lock()?;
        Ok(load_delivery(&conn, r)?.map(|(_, d)| d))
    }

    /// Every row of one broadcast, any status.
    pub fn broadcast_rows(&self, key: &BroadcastKey) -> Result<Vec<ScheduledMessage>> {
        let conn = self.lock()?;
        bucket_rows(&conn, key)
    }

    /// What the dispatcher needs to deliver one row.
    pub fn dispatch_target(&self, r: &MessageRef) -> Result<DispatchTarget> {
        let conn = self.lock()?;
        let sql = match r.kind {
            MessageKind::Scheduled => {
                "SELECT m.owner_id, m.status, c.phone_number, m.message
                 FROM scheduled_messages m
                 LEFT JOIN contacts c ON c.id = m.contact_id
                 WHERE m.id = ?1"
            }
            MessageKind::Study => {
                "SELECT s.owner_id, s.status, o.phone_number, COALESCE(p.content, cm.content)
                 FROM message_selections s
                 LEFT JOIN owners o ON o.id = s.owner_id
                 LEFT JOIN predefined_messages p ON p.id = s.predefined_message_id
                 LEFT JOIN custom_messages cm ON cm.id = s.custom_message_id
                 WHERE s.id = ?1"
            }
        };
        conn.query_row(sql, [&r.id], |row| {
            let status: String = row.get(1)?;
            Ok(DispatchTarget {
                owner_id: row.get(0)?,
                status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Unscheduled),
                phone: row.get(2)?,
                text: row.get(3)?,
            })
        })
        .optional()
        .map_err(sql_err("Load dispatch target"))?
        .ok_or_else(|| TextcastError::NotFound(format!("message {r}")))
    }

    // ─── Status writes ────────────────────────────────────────

    pub fn mark_sent(
        &self,
        actor: &Actor,
        r: &MessageRef,
        at: DateTime<Utc>,
        external_id: Option<String>,
    ) -> Result<Outcome> {
        let conn = self.lock()?;
        transition(&conn, actor, r, |d| Ok(d.mark_sent(at, external_id)))
    }

    pub fn mark_failed(
        &self,
        actor: &Actor,
        r: &MessageRef,
        reason: FailureReason,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<Outcome> {
        let conn = self.lock()?;
        transition(&conn, actor, r, |d| Ok(d.mark_failed(reason, error, at)))
    }

    /// Apply one status write to several rows of the same family on behalf
    /// of an owner.
    pub fn bulk_update<F>(
        &self,
        owner_id: &str,
        kind: MessageKind,
        ids: &[String],
        mode: BulkMode,
        apply: F,
    ) -> Result<BulkReport>
    where
        F: Fn(&mut Delivery) -> Outcome,
    {
        let actor = Actor::Owner(owner_id.to_string());
        let mut conn = self.lock()?;
        let mut report = BulkReport::default();

        match mode {
            BulkMode::ValidateFirst => {
                let tx = conn.transaction().map_err(sql_err("Begin"))?;
                for id in ids {
                    let r = MessageRef { kind, id: id.clone() };
                    let (owner, _) = load_delivery(&tx, &r)?
                        .ok_or_else(|| TextcastError::NotFound(format!("message {id}")))?;
                    check_owner(&actor, &owner, &r)?;
                }
                for id in ids {
                    let r = MessageRef { kind, id: id.clone() };
                    match transition(&tx, &actor, &r, |d| Ok(apply(d)))? {
                        Outcome::Applied => report.applied += 1,
                        Outcome::Unchanged => report.unchanged += 1,
                    }
                }
                tx.commit().map_err(sql_err("Commit"))?;
            }
            BulkMode::PartialApply => {
                for id in ids {
                    let r = MessageRef { kind, id: id.clone() };
                    match transition(&conn, &actor, &r, |d| Ok(apply(d))) {
                        Ok(Outcome::Applied) => report.applied += 1,
                        Ok(Outcome::Unchanged) => report.unchanged += 1,
                        Err(e) => {
                            tracing::warn!(
                                "Bulk write aborted at {} after {} applied: {e}",
                                r,
                                report.applied
                            );
                            if ids.len() == 1 {
                                return Err(e);
                            }
                            return Err(with_progress(e, report.applied + report.unchanged, ids.len()));
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Admin cancel of any non-sent row.
    pub fn cancel(&self, actor: &Actor, r: &MessageRef) -> Result<Outcome> {
        let conn = self.lock()?;
        let outcome = transition(&conn, actor, r, |d| d.cancel())?;
        if outcome == Outcome::Applied {
            tracing::info!("🚫 Message cancelled: {r}");
        }
        Ok(outcome)
    }

    /// Move a row to a new time and back to its initial state.
    pub fn reschedule(&self, actor: &Actor, r: &MessageRef, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;
        transition(&tx, actor, r, |d| {
            d.reschedule()?;
            Ok(Outcome::Applied)
        })?;
        let sql = match r.kind {
            MessageKind::Scheduled => "UPDATE scheduled_messages SET scheduled_at = ?1 WHERE id = ?2",
            MessageKind::Study => {
                "UPDATE message_selections SET scheduled_at = ?1, is_scheduled = 1 WHERE id = ?2"
            }
        };
        tx.execute(sql, params![ms(at), r.id])
            .map_err(sql_err("Reschedule"))?;
        tx.commit().map_err(sql_err("Commit"))?;
        tracing::info!("🔁 Message rescheduled: {r} → {at}");
        Ok(())
    }

    /// Hard-delete a manual-family row. Rows in flight cannot be deleted.
    pub fn delete_scheduled(&self, actor: &Actor, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let r = MessageRef::scheduled(id);
        let (owner, delivery) = load_delivery(&conn, &r)?
            .ok_or_else(|| TextcastError::NotFound(format!("message {id}")))?;
        check_owner(actor, &owner, &r)?;
        if delivery.status == DeliveryStatus::Pending {
            return Err(TextcastError::Conflict(format!(
                "message {id} is being delivered and cannot be deleted"
            )));
        }
        conn.execute("DELETE FROM scheduled_messages WHERE id = ?1", [id])
            .map_err(sql_err("Delete message"))?;
        Ok(())
    }

    // ─── Scanner / retry claims ───────────────────────────────

    /// Reconcile due broadcasts and claim up to `batch_size` due rows, all in
    /// one transaction. Returns the claimed rows for dispatch.
    pub fn claim_due(&self, now: DateTime<Utc>, opts: &ClaimOptions) -> Result<Vec<MessageRef>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;
        let stale = ms(now - opts.claim_timeout);
        let mut refs: Vec<MessageRef> = Vec::new();

        for kind in &opts.kinds {
            let remaining = opts.batch_size.saturating_sub(refs.len());
            if remaining == 0 {
                break;
            }
            let ids: Vec<String> = match kind {
                MessageKind::Scheduled => {
                    // Every broadcast the selection touches is reconciled
                    // before any of its rows is claimed. Reconciling can
                    // exclude selected rows, so select again until the
                    // selection holds no unreconciled key.
                    let mut reconciled: BTreeSet<BroadcastKey> = BTreeSet::new();
                    loop {
                        let due = select_due_scheduled(&tx, now, stale, remaining)?;
                        let fresh: BTreeSet<BroadcastKey> = due
                            .iter()
                            .filter_map(|(_, key)| key.clone())
                            .filter(|key| !reconciled.contains(key))
                            .collect();
                        if fresh.is_empty() {
                            break due.into_iter().map(|(id, _)| id).collect();
                        }
                        for key in fresh {
                            reconcile_bucket(&tx, &key, now)?;
                            reconciled.insert(key);
                        }
                    }
                }
                MessageKind::Study => select_ids(
                    &tx,
                    &format!(
                        "SELECT id FROM message_selections
                         WHERE is_scheduled = 1 AND scheduled_at IS NOT NULL
                           AND scheduled_at <= :now AND {DUE_STATUS}
                         ORDER BY scheduled_at, id LIMIT :limit"
                    ),
                    now,
                    stale,
                    remaining,
                )?,
            };
            for id in ids {
                let r = MessageRef { kind: *kind, id };
                let claimed = transition(&tx, &Actor::System, &r, |d| {
                    Ok(match d.status {
                        DeliveryStatus::Unscheduled | DeliveryStatus::Pending => d.claim(now),
                        _ => Outcome::Unchanged,
                    })
                })?;
                if claimed == Outcome::Applied {
                    refs.push(r);
                }
            }
        }

        tx.commit().map_err(sql_err("Commit"))?;
        Ok(refs)
    }

    /// Move retry-eligible failures back to `pending`, in one transaction.
    /// Broadcast candidates have their bucket reconciled first, so a row of
    /// a contact who left the group is excluded instead of retried.
    pub fn claim_retries(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
        kinds: &[MessageKind],
    ) -> Result<Vec<MessageRef>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;
        let (oldest, newest) = policy.window(now);
        let mut refs = Vec::new();

        for kind in kinds {
            let remaining = policy.batch_size.saturating_sub(refs.len());
            if remaining == 0 {
                break;
            }
            let columns = match kind {
                MessageKind::Scheduled => "id, group_id, scheduled_at, message",
                MessageKind::Study => "id, NULL, NULL, NULL",
            };
            let sql = format!(
                "SELECT {columns} FROM {} WHERE status = 'failed' AND failure_reason = 'transport'
                   AND attempts < ?1 AND last_attempt_at > ?2 AND last_attempt_at <= ?3
                 ORDER BY last_attempt_at, id LIMIT ?4",
                kind.table()
            );
            let candidates: Vec<(String, Option<BroadcastKey>)> = {
                let mut stmt = tx.prepare(&sql).map_err(sql_err("Prepare retry"))?;
                stmt.query_map(
                    params![policy.max_attempts, ms(oldest), ms(newest), remaining as i64],
                    due_row,
                )
                .map_err(sql_err("Select retry"))?
                .collect::<rusqlite::Result<_>>()
                .map_err(sql_err("Read retry"))?
            };
            let keys: BTreeSet<&BroadcastKey> = candidates.iter().filter_map(|(_, k)| k.as_ref()).collect();
            for key in keys {
                reconcile_bucket(&tx, key, now)?;
            }
            for (id, _) in candidates {
                let r = MessageRef { kind: *kind, id };
                let claimed = transition(&tx, &Actor::System, &r, |d| {
                    let retryable = d.status == DeliveryStatus::Failed
                        && d.failure_reason == Some(FailureReason::Transport);
                    Ok(if retryable { d.claim(now) } else { Outcome::Unchanged })
                })?;
                if claimed == Outcome::Applied {
                    refs.push(r);
                }
            }
        }

        tx.commit().map_err(sql_err("Commit"))?;
        Ok(refs)
    }

    /// Transport failures that fell out of the retry window or hit the
    /// attempt cap and now need a human.
    pub fn count_abandoned(&self, now: DateTime<Utc>, policy: &RetryPolicy) -> Result<u64> {
        let conn = self.lock()?;
        let (oldest, _) = policy.window(now);
        let mut total = 0u64;
        for kind in [MessageKind::Scheduled, MessageKind::Study] {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE status = 'failed' AND failure_reason = 'transport'
                   AND (attempts >= ?1 OR last_attempt_at <= ?2)",
                kind.table()
            );
            let n: i64 = conn
                .query_row(&sql, params![policy.max_attempts, ms(oldest)], |r| r.get(0))
                .map_err(sql_err("Count abandoned"))?;
            total += n as u64;
        }
        Ok(total)
    }

    // ─── Boundary API views ───────────────────────────────────

    /// Manual-family due work for one owner. Reconciles every due broadcast
    /// first, then returns singles and aggregated broadcasts ordered by time.
    pub fn pending_work(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
        filter: &PendingFilter,
    ) -> Result<Vec<DueItem>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;

        let rows = {
            let mut sql = format!(
                "{SCHEDULED_SELECT} WHERE m.owner_id = :owner AND m.scheduled_at <= :now
                   AND m.status IN ('unscheduled', 'pending')"
            );
            if filter.category.is_some() {
                sql.push_str(" AND m.category = :category");
            }
            if filter.since.is_some() {
                sql.push_str(" AND m.scheduled_at >= :since");
            }
            sql.push_str(" ORDER BY m.scheduled_at");
            let mut stmt = tx.prepare(&sql).map_err(sql_err("Prepare pending"))?;
            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            let now_ms = ms(now);
            let since_ms = opt_ms(filter.since);
            named.push((":owner", &owner_id));
            named.push((":now", &now_ms));
            if let Some(category) = &filter.category {
                named.push((":category", category));
            }
            if let Some(since) = &since_ms {
                named.push((":since", since));
            }
            stmt.query_map(named.as_slice(), row_to_scheduled)
                .map_err(sql_err("Select pending"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(sql_err("Read pending"))?
        };

        let (singles, buckets) = reconcile::partition(rows);
        let mut items = Vec::new();

        for key in buckets.keys() {
            reconcile_bucket(&tx, key, now)?;
            let deliverable: Vec<(ScheduledMessage, String)> = bucket_rows_with_phones(&tx, key)?
                .into_iter()
                .filter(|(m, _)| {
                    matches!(m.delivery.status, DeliveryStatus::Unscheduled | DeliveryStatus::Pending)
                })
                .collect();
            if deliverable.is_empty() {
                continue;
            }
            let view = reconcile::aggregate(key, &deliverable);
            let group = load_group(&tx, &key.group_id)?;
            items.push(DueItem {
                id: view.id,
                message: key.message.clone(),
                contact_name: group.as_ref().map(|g| g.name.clone()).unwrap_or_default(),
                phone_number: view.recipients.join(","),
                recipients: view.recipients,
                group,
                scheduled_at: key.scheduled_at,
                category: view.category,
                message_ids: view.message_ids,
            });
        }

        if !filter.group_only {
            for msg in singles {
                match load_contact(&tx, &msg.contact_id)? {
                    Some(contact) => items.push(DueItem {
                        id: msg.id.clone(),
                        message: msg.message.clone(),
                        contact_name: contact.name,
                        phone_number: contact.phone_number.clone(),
                        recipients: vec![contact.phone_number],
                        group: None,
                        scheduled_at: msg.scheduled_at,
                        category: msg.category.clone(),
                        message_ids: vec![msg.id.clone()],
                    }),
                    None => {
                        let r = MessageRef::scheduled(&msg.id);
                        transition(&tx, &Actor::System, &r, |d| {
                            Ok(d.mark_failed(FailureReason::Validation, "contact not found", now))
                        })?;
                        tracing::warn!("Message {} has no contact, failed as validation", msg.id);
                    }
                }
            }
        }

        tx.commit().map_err(sql_err("Commit"))?;
        items.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Study-family due work for one owner, grouped by (lesson, time, content).
    pub fn study_pending(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StudyDueItem>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;

        let rows: Vec<(MessageSelection, Option<String>, Option<String>, Option<String>)> = {
            let mut stmt = tx
                .prepare(&format!(
                    "{SELECTION_SELECT_JOINED} WHERE s.owner_id = ?1 AND s.is_scheduled = 1
                       AND s.scheduled_at IS NOT NULL AND s.scheduled_at <= ?2
                       AND s.scheduled_at >= ?3
                       AND s.status IN ('unscheduled', 'pending')
                     ORDER BY s.scheduled_at LIMIT ?4"
                ))
                .map_err(sql_err("Prepare study pending"))?;
            stmt.query_map(
                params![owner_id, ms(now), opt_ms(since).unwrap_or(i64::MIN), limit as i64],
                |row| Ok((row_to_selection(row)?, row.get(15)?, row.get(16)?, row.get(17)?)),
            )
            .map_err(sql_err("Select study pending"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err("Read study pending"))?
        };

        let mut groups: BTreeMap<(i64, String, String), StudyDueItem> = BTreeMap::new();
        for (sel, content, title, phone) in rows {
            let Some(content) = content else {
                let r = MessageRef::study(&sel.id);
                transition(&tx, &Actor::System, &r, |d| {
                    Ok(d.mark_failed(FailureReason::Validation, "message content not found", now))
                })?;
                tracing::warn!("Study message {} has no content, failed as validation", sel.id);
                continue;
            };
            let Some(at) = sel.scheduled_at else { continue };
            let key = (ms(at), sel.lesson_id.clone(), content.clone());
            groups
                .entry(key)
                .or_insert_with(|| StudyDueItem {
                    id: format!(
                        "study_{}_{}_{}",
                        sel.lesson_id,
                        ms(at),
                        reconcile::short_hash(&[
                            sel.lesson_id.as_bytes(),
                            &ms(at).to_be_bytes(),
                            content.as_bytes(),
                        ])
                    ),
                    lesson_id: sel.lesson_id.clone(),
                    lesson_title: title,
                    message: content,
                    phone_number: phone,
                    scheduled_at: at,
                    message_ids: Vec::new(),
                })
                .message_ids
                .push(sel.id);
        }

        tx.commit().map_err(sql_err("Commit"))?;
        Ok(groups.into_values().collect())
    }

    /// Failed rows across both families, newest attempt first.
    pub fn failed_messages(
        &self,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<FailedMessage>> {
        let conn = self.lock()?;
        let mut out = Vec::new();

        let owner_clause = if owner_id.is_some() { " AND m.owner_id = ?1" } else { "" };
        let mut stmt = conn
            .prepare(&format!(
                "{SCHEDULED_SELECT} WHERE m.status = 'failed'{owner_clause}"
            ))
            .map_err(sql_err("Prepare failed"))?;
        let rows = match owner_id {
            Some(o) => stmt.query_map([o], row_to_scheduled),
            None => stmt.query_map([], row_to_scheduled),
        }
        .map_err(sql_err("Select failed"))?;
        for row in rows {
            let m = row.map_err(sql_err("Read failed"))?;
            out.push(FailedMessage {
                retry_eligible: policy.is_eligible(&m.delivery, now),
                message: MessageRef::scheduled(&m.id),
                owner_id: m.owner_id,
                summary: m.message,
                scheduled_at: Some(m.scheduled_at),
                delivery: m.delivery,
            });
        }

        let owner_clause = if owner_id.is_some() { " AND s.owner_id = ?1" } else { "" };
        let mut stmt = conn
            .prepare(&format!(
                "{SELECTION_SELECT_JOINED} WHERE s.status = 'failed'{owner_clause}"
            ))
            .map_err(sql_err("Prepare failed"))?;
        let map = |row: &rusqlite::Row| -> rusqlite::Result<(MessageSelection, Option<String>)> {
            Ok((row_to_selection(row)?, row.get(15)?))
        };
        let rows = match owner_id {
            Some(o) => stmt.query_map([o], map),
            None => stmt.query_map([], map),
        }
        .map_err(sql_err("Select failed"))?;
        for row in rows {
            let (s, content) = row.map_err(sql_err("Read failed"))?;
            out.push(FailedMessage {
                retry_eligible: policy.is_eligible(&s.delivery, now),
                message: MessageRef::study(&s.id),
                owner_id: s.owner_id,
                summary: content.unwrap_or_default(),
                scheduled_at: s.scheduled_at,
                delivery: s.delivery,
            });
        }

        out.sort_by(|a, b| b.delivery.last_attempt_at.cmp(&a.delivery.last_attempt_at));
        Ok(out)
    }

    /// Delivery statistics for one owner's rows of one family, optionally
    /// limited to rows scheduled since `since`.
    pub fn stats(
        &self,
        owner_id: &str,
        kind: MessageKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<DeliveryStats> {
        let conn = self.lock()?;
        let scope = match kind {
            MessageKind::Scheduled => "",
            MessageKind::Study => " AND is_scheduled = 1",
        };
        let sql = format!(
            "SELECT status, failure_reason, COUNT(*), COALESCE(SUM(attempts), 0) FROM {}
             WHERE owner_id = ?1 AND (?2 IS NULL OR scheduled_at >= ?2){scope}
             GROUP BY status, failure_reason",
            kind.table()
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err("Prepare stats"))?;
        let rows = stmt
            .query_map(params![owner_id, opt_ms(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(sql_err("Select stats"))?;

        let mut stats = DeliveryStats::default();
        for row in rows {
            let (status, reason, count, attempts) = row.map_err(sql_err("Read stats"))?;
            let Some(status) = DeliveryStatus::parse(&status) else { continue };
            stats.add(status, reason.as_deref().and_then(FailureReason::parse), count as u64, attempts as u64);
        }
        Ok(stats)
    }

    // ─── Job watermarks ───────────────────────────────────────

    /// Start a job invocation unless another instance ran it less than
    /// `min_interval` ago. Records `now` as the new watermark on success.
    pub fn try_begin_job(&self, job: &str, now: DateTime<Utc>, min_interval: Duration) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err("Begin"))?;
        let last: Option<i64> = tx
            .query_row("SELECT last_run_at FROM job_runs WHERE job = ?1", [job], |r| r.get(0))
            .optional()
            .map_err(sql_err("Load job run"))?;
        if let Some(last) = last
            && ms(now) - last < min_interval.num_milliseconds()
        {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO job_runs (job, last_run_at, last_count) VALUES (?1, ?2, 0)
             ON CONFLICT(job) DO UPDATE SET last_run_at = excluded.last_run_at, last_count = 0",
            params![job, ms(now)],
        )
        .map_err(sql_err("Record job run"))?;
        tx.commit().map_err(sql_err("Commit"))?;
        Ok(true)
    }

    /// Record how many rows the current invocation handled.
    pub fn finish_job(&self, job: &str, count: u64) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE job_runs SET last_count = ?1 WHERE job = ?2",
                params![count as i64, job],
            )
            .map_err(sql_err("Finish job run"))?;
        Ok(())
    }

    pub fn job_run(&self, job: &str) -> Result<Option<JobRun>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT last_run_at, last_count FROM job_runs WHERE job = ?1",
            [job],
            |r| {
                Ok(JobRun {
                    last_run_at: from_millis_lossy(r.get(0)?),
                    last_count: r.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()
        .map_err(sql_err("Load job run"))
    }
}

/// Selection columns plus resolved content (15), lesson title (16), and the
/// owner's phone (17).
const SELECTION_SELECT_JOINED: &str = "SELECT s.id, s.owner_id, s.lesson_id, \
     s.predefined_message_id, s.custom_message_id, s.scheduled_at, s.is_scheduled, s.created_at, \
     s.status, s.attempts, s.last_attempt_at, s.error, s.failure_reason, s.delivered_at, \
     s.external_id, COALESCE(p.content, cm.content), l.title, o.phone_number \
     FROM message_selections s \
     LEFT JOIN predefined_messages p ON p.id = s.predefined_message_id \
     LEFT JOIN custom_messages cm ON cm.id = s.custom_message_id \
     LEFT JOIN lessons l ON l.id = s.lesson_id \
     LEFT JOIN owners o ON o.id = s.owner_id";

fn new_scheduled(
    owner_id: &str,
    contact_id: &str,
    group_id: Option<&str>,
    message: &str,
    at: DateTime<Utc>,
    category: Option<&str>,
    notes: Option<&str>,
) -> ScheduledMessage {
    ScheduledMessage {
        id: new_id(),
        owner_id: owner_id.to_string(),
        contact_id: contact_id.to_string(),
        group_id: group_id.map(String::from),
        message: message.to_string(),
        scheduled_at: at,
        category: category.map(String::from),
        notes: notes.map(String::from),
        created_at: Utc::now(),
        delivery: Delivery::default(),
    }
}

fn insert_scheduled(conn: &Connection, m: &ScheduledMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduled_messages
         (id, owner_id, contact_id, group_id, message, scheduled_at, category, notes, created_at,
          status, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            m.id,
            m.owner_id,
            m.contact_id,
            m.group_id,
            m.message,
            ms(m.scheduled_at),
            m.category,
            m.notes,
            ms(m.created_at),
            m.delivery.status.as_str(),
            m.delivery.attempts,
        ],
    )
    .map_err(sql_err("Insert message"))?;
    Ok(())
}

fn load_group(conn: &Connection, group_id: &str) -> Result<Option<Group>> {
    conn.query_row(
        "SELECT id, owner_id, name, color FROM contact_groups WHERE id = ?1",
        [group_id],
        |r| {
            Ok(Group {
                id: r.get(0)?,
                owner_id: r.get(1)?,
                name: r.get(2)?,
                color: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(sql_err("Load group"))
}

fn load_contact(conn: &Connection, contact_id: &str) -> Result<Option<Contact>> {
    conn.query_row(
        "SELECT id, owner_id, name, phone_number FROM contacts WHERE id = ?1",
        [contact_id],
        |r| {
            Ok(Contact {
                id: r.get(0)?,
                owner_id: r.get(1)?,
                name: r.get(2)?,
                phone_number: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(sql_err("Load contact"))
}

/// Current members of a group that still exist as contacts.
fn group_member_ids(conn: &Connection, group_id: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT gm.contact_id FROM group_members gm
             JOIN contacts c ON c.id = gm.contact_id
             WHERE gm.group_id = ?1",
        )
        .map_err(sql_err("Prepare members"))?;
    stmt.query_map([group_id], |r| r.get(0))
        .map_err(sql_err("Select members"))?
        .collect::<rusqlite::Result<_>>()
        .map_err(sql_err("Read members"))
}

fn bucket_rows(conn: &Connection, key: &BroadcastKey) -> Result<Vec<ScheduledMessage>> {
    let mut stmt = conn
        .prepare(&format!(
            "{SCHEDULED_SELECT} WHERE m.group_id = ?1 AND m.scheduled_at = ?2 AND m.message = ?3
             ORDER BY m.created_at, m.id"
        ))
        .map_err(sql_err("Prepare bucket"))?;
    stmt.query_map(params![key.group_id, ms(key.scheduled_at), key.message], row_to_scheduled)
        .map_err(sql_err("Select bucket"))?
        .collect::<rusqlite::Result<_>>()
        .map_err(sql_err("Read bucket"))
}

fn bucket_rows_with_phones(conn: &Connection, key: &BroadcastKey) -> Result<Vec<(ScheduledMessage, String)>> {
    let mut stmt = conn
        .prepare(&format!(
            "{SCHEDULED_SELECT_WITH_PHONE} WHERE m.group_id = ?1 AND m.scheduled_at = ?2
               AND m.message = ?3
             ORDER BY m.created_at, m.id"
        ))
        .map_err(sql_err("Prepare bucket"))?;
    stmt.query_map(params![key.group_id, ms(key.scheduled_at), key.message], |row| {
        Ok((row_to_scheduled(row)?, row.get(16)?))
    })
    .map_err(sql_err("Select bucket"))?
    .collect::<rusqlite::Result<_>>()
    .map_err(sql_err("Read bucket"))
}

const SCHEDULED_SELECT_WITH_PHONE: &str = "SELECT m.id, m.owner_id, m.contact_id, m.group_id, \
     m.message, m.scheduled_at, m.category, m.notes, m.created_at, m.status, m.attempts, \
     m.last_attempt_at, m.error, m.failure_reason, m.delivered_at, m.external_id, c.phone_number \
     FROM scheduled_messages m JOIN contacts c ON c.id = m.contact_id";

/// Row id plus its broadcast key, from `id, group_id, scheduled_at, message`.
fn due_row(r: &rusqlite::Row) -> rusqlite::Result<(String, Option<BroadcastKey>)> {
    let group_id: Option<String> = r.get(1)?;
    let at: Option<i64> = r.get(2)?;
    let message: Option<String> = r.get(3)?;
    let key = match (group_id, at, message) {
        (Some(group_id), Some(at), Some(message)) => Some(BroadcastKey {
            group_id,
            scheduled_at: from_millis_lossy(at),
            message,
        }),
        _ => None,
    };
    Ok((r.get(0)?, key))
}

/// Due manual-family rows, oldest first.
fn select_due_scheduled(
    conn: &Connection,
    now: DateTime<Utc>,
    stale: i64,
    limit: usize,
) -> Result<Vec<(String, Option<BroadcastKey>)>> {
    let sql = format!(
        "SELECT id, group_id, scheduled_at, message FROM scheduled_messages
         WHERE scheduled_at <= :now AND {DUE_STATUS}
         ORDER BY scheduled_at, id LIMIT :limit"
    );
    let mut stmt = conn.prepare(&sql).map_err(sql_err("Prepare due"))?;
    stmt.query_map(
        rusqlite::named_params! { ":now": ms(now), ":stale": stale, ":limit": limit as i64 },
        due_row,
    )
    .map_err(sql_err("Select due"))?
    .collect::<rusqlite::Result<_>>()
    .map_err(sql_err("Read due"))
}

fn select_ids(conn: &Connection, sql: &str, now: DateTime<Utc>, stale: i64, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(sql_err("Prepare due"))?;
    stmt.query_map(
        rusqlite::named_params! { ":now": ms(now), ":stale": stale, ":limit": limit as i64 },
        |r| r.get(0),
    )
    .map_err(sql_err("Select due"))?
    .collect::<rusqlite::Result<_>>()
    .map_err(sql_err("Read due"))
}

/// Make one broadcast bucket match current membership.
/// Returns (rows created, rows excluded).
fn reconcile_bucket(conn: &Connection, key: &BroadcastKey, now: DateTime<Utc>) -> Result<(usize, usize)> {
    let rows = bucket_rows(conn, key)?;
    let Some(template) = rows.first() else {
        return Ok((0, 0));
    };
    let members = group_member_ids(conn, &key.group_id)?;
    let plan = reconcile::plan(&rows, &members);
    if plan.is_empty() {
        return Ok((0, 0));
    }

    for contact_id in &plan.missing_contacts {
        let msg = new_scheduled(
            &template.owner_id,
            contact_id,
            Some(&key.group_id),
            &key.message,
            key.scheduled_at,
            template.category.as_deref(),
            template.notes.as_deref(),
        );
        insert_scheduled(conn, &msg)?;
    }
    for id in &plan.excluded_rows {
        let r = MessageRef::scheduled(id);
        transition(conn, &Actor::System, &r, |d| {
            Ok(d.mark_failed(FailureReason::MembershipExcluded, REMOVED_FROM_GROUP, now))
        })?;
    }

    tracing::info!(
        "👥 Reconciled broadcast {}: +{} joined, -{} removed",
        key.synthetic_id(),
        plan.missing_contacts.len(),
        plan.excluded_rows.len()
    );
    Ok((plan.missing_contacts.len(), plan.excluded_rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            min_cooldown: Duration::hours(1),
            max_staleness: Duration::hours(24),
            batch_size: 25,
        }
    }

    fn claim_opts(kinds: &[MessageKind]) -> ClaimOptions {
        ClaimOptions {
            batch_size: 50,
            claim_timeout: Duration::minutes(15),
            kinds: kinds.to_vec(),
        }
    }

    fn owner(id: &str) -> Actor {
        Actor::Owner(id.to_string())
    }

    #[test]
    fn test_schedule_and_get() {
        let db = MessageDb::open_in_memory().unwrap();
        let c = db.add_contact("u1", "Ana", "+15550000001").unwrap();
        let m = db
            .schedule_message("u1", &c.id, "Hello", t(9, 0), Some("reminder"), None)
            .unwrap();
        let loaded = db.get_scheduled(&m.id).unwrap().unwrap();
        assert_eq!(loaded.message, "Hello");
        assert_eq!(loaded.scheduled_at, t(9, 0));
        assert_eq!(loaded.delivery.status, DeliveryStatus::Unscheduled);

        assert!(matches!(
            db.schedule_message("u2", &c.id, "Hello", t(9, 0), None, None),
            Err(TextcastError::Forbidden(_))
        ));
        assert!(matches!(
            db.schedule_message("u1", &c.id, "  ", t(9, 0), None, None),
            Err(TextcastError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_broadcast_follows_membership_changes() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let b = db.add_contact("u1", "B", "+15550000002").unwrap();
        let c = db.add_contact("u1", "C", "+15550000003").unwrap();
        let g = db.create_group("u1", "Team", Some("#ff0000")).unwrap();
        db.add_group_member(&g.id, &a.id).unwrap();
        db.add_group_member(&g.id, &b.id).unwrap();

        let rows = db.schedule_broadcast("u1", &g.id, "Standup", t(9, 0), None).unwrap();
        assert_eq!(rows.len(), 2);

        db.remove_group_member(&g.id, &b.id).unwrap();
        db.add_group_member(&g.id, &c.id).unwrap();

        let due = db.pending_work("u1", t(9, 1), &PendingFilter::default()).unwrap();
        assert_eq!(due.len(), 1);
        let item = &due[0];
        assert!(item.id.starts_with(&format!("group_{}_", g.id)));
        assert_eq!(item.contact_name, "Team");
        let mut recipients = item.recipients.clone();
        recipients.sort();
        assert_eq!(recipients, vec!["+15550000001", "+15550000003"]);
        assert_eq!(item.phone_number, item.recipients.join(","));
        assert_eq!(item.message_ids.len(), 2);

        let key = BroadcastKey::of(&rows[0]).unwrap();
        let all = db.broadcast_rows(&key).unwrap();
        assert_eq!(all.len(), 3);
        let b_row = all.iter().find(|m| m.contact_id == b.id).unwrap();
        assert_eq!(b_row.delivery.status, DeliveryStatus::Failed);
        assert_eq!(b_row.delivery.failure_reason, Some(FailureReason::MembershipExcluded));
        assert_eq!(b_row.delivery.error.as_deref(), Some(REMOVED_FROM_GROUP));
        assert!(b_row.delivery.is_consistent());

        // a second pass is a no-op
        let again = db.pending_work("u1", t(9, 2), &PendingFilter::default()).unwrap();
        assert_eq!(again[0].id, item.id);
        assert_eq!(db.broadcast_rows(&key).unwrap().len(), 3);
    }

    #[test]
    fn test_pending_work_filters() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        db.schedule_message("u1", &a.id, "early", t(8, 0), Some("bill"), None).unwrap();
        db.schedule_message("u1", &a.id, "later", t(10, 0), Some("promo"), None).unwrap();
        db.schedule_message("u1", &a.id, "future", t(23, 0), None, None).unwrap();

        let all = db.pending_work("u1", t(12, 0), &PendingFilter::default()).unwrap();
        assert_eq!(all.iter().map(|i| i.message.as_str()).collect::<Vec<_>>(), vec!["early", "later"]);

        let promo = PendingFilter { category: Some("promo".into()), ..Default::default() };
        assert_eq!(db.pending_work("u1", t(12, 0), &promo).unwrap().len(), 1);

        let since = PendingFilter { since: Some(t(9, 0)), ..Default::default() };
        assert_eq!(db.pending_work("u1", t(12, 0), &since).unwrap()[0].message, "later");

        let groups = PendingFilter { group_only: true, ..Default::default() };
        assert!(db.pending_work("u1", t(12, 0), &groups).unwrap().is_empty());

        assert!(db.pending_work("u2", t(12, 0), &PendingFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_transport_failures_exhaust_retries() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m = db.schedule_message("u1", &a.id, "Hi", t(9, 0), None, None).unwrap();
        let r = MessageRef::scheduled(&m.id);
        let p = policy();

        let claimed = db.claim_due(t(9, 0), &claim_opts(&[MessageKind::Scheduled])).unwrap();
        assert_eq!(claimed, vec![r.clone()]);
        db.mark_failed(&Actor::System, &r, FailureReason::Transport, "timeout", t(9, 0)).unwrap();

        // cooldown not elapsed
        assert!(db.claim_retries(t(9, 30), &p, &[MessageKind::Scheduled]).unwrap().is_empty());

        let mut now = t(9, 0);
        for attempt in 2..=3 {
            now += Duration::hours(1);
            let retried = db.claim_retries(now, &p, &[MessageKind::Scheduled]).unwrap();
            assert_eq!(retried, vec![r.clone()]);
            assert_eq!(db.get_delivery(&r).unwrap().unwrap().attempts, attempt);
            db.mark_failed(&Actor::System, &r, FailureReason::Transport, "timeout", now).unwrap();
        }

        now += Duration::hours(1);
        assert!(db.claim_retries(now, &p, &[MessageKind::Scheduled]).unwrap().is_empty());
        assert_eq!(db.count_abandoned(now, &p).unwrap(), 1);

        let failed = db.failed_messages(Some("u1"), now, &p).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].delivery.attempts, 3);
        assert!(!failed[0].retry_eligible);
        assert!(db.failed_messages(Some("u2"), now, &p).unwrap().is_empty());
    }

    #[test]
    fn test_stale_failures_and_exclusions_are_not_retried() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m1 = db.schedule_message("u1", &a.id, "one", t(9, 0), None, None).unwrap();
        let m2 = db.schedule_message("u1", &a.id, "two", t(9, 0), None, None).unwrap();
        let r1 = MessageRef::scheduled(&m1.id);
        let r2 = MessageRef::scheduled(&m2.id);
        db.mark_failed(&Actor::System, &r1, FailureReason::Transport, "x", t(9, 0)).unwrap();
        db.mark_failed(&Actor::System, &r2, FailureReason::Validation, "bad phone", t(9, 0)).unwrap();

        let p = policy();
        assert!(db.claim_retries(t(9, 0) + Duration::hours(25), &p, &[MessageKind::Scheduled]).unwrap().is_empty());
        let ok = db.claim_retries(t(11, 0), &p, &[MessageKind::Scheduled]).unwrap();
        assert_eq!(ok, vec![r1]);
    }

    #[test]
    fn test_claim_due_reconciles_every_claimed_broadcast() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let b = db.add_contact("u1", "B", "+15550000002").unwrap();
        let c = db.add_contact("u1", "C", "+15550000003").unwrap();
        let g1 = db.create_group("u1", "One", None).unwrap();
        let g2 = db.create_group("u1", "Two", None).unwrap();
        let g3 = db.create_group("u1", "Three", None).unwrap();
        db.add_group_member(&g1.id, &a.id).unwrap();
        db.add_group_member(&g2.id, &b.id).unwrap();
        db.add_group_member(&g3.id, &c.id).unwrap();
        let r1 = db.schedule_broadcast("u1", &g1.id, "Standup", t(9, 0), None).unwrap();
        let r2 = db.schedule_broadcast("u1", &g2.id, "Standup", t(9, 0), None).unwrap();
        let r3 = db.schedule_broadcast("u1", &g3.id, "Standup", t(9, 0), None).unwrap();
        db.remove_group_member(&g1.id, &a.id).unwrap();
        db.remove_group_member(&g2.id, &b.id).unwrap();

        let mut opts = claim_opts(&[MessageKind::Scheduled]);
        opts.batch_size = 1;
        let claimed = db.claim_due(t(9, 1), &opts).unwrap();
        assert_eq!(claimed, vec![MessageRef::scheduled(&r3[0].id)]);
        assert!(db.claim_due(t(9, 2), &opts).unwrap().is_empty());

        for row in r1.iter().chain(&r2) {
            let d = db.get_delivery(&MessageRef::scheduled(&row.id)).unwrap().unwrap();
            assert_eq!(d.status, DeliveryStatus::Failed);
            assert_eq!(d.failure_reason, Some(FailureReason::MembershipExcluded));
        }
    }

    #[test]
    fn test_agent_failure_report_keeps_exclusion() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let b = db.add_contact("u1", "B", "+15550000002").unwrap();
        let g = db.create_group("u1", "Team", None).unwrap();
        db.add_group_member(&g.id, &a.id).unwrap();
        db.add_group_member(&g.id, &b.id).unwrap();
        let rows = db.schedule_broadcast("u1", &g.id, "Standup", t(9, 0), None).unwrap();
        let a_row = rows.iter().find(|m| m.contact_id == a.id).unwrap();
        let b_row = rows.iter().find(|m| m.contact_id == b.id).unwrap();

        let handed = db.pending_work("u1", t(9, 1), &PendingFilter::default()).unwrap();
        let ids = handed[0].message_ids.clone();
        assert_eq!(ids.len(), 2);
        db.remove_group_member(&g.id, &b.id).unwrap();
        db.pending_work("u1", t(9, 2), &PendingFilter::default()).unwrap();

        let report = db
            .bulk_update("u1", MessageKind::Scheduled, &ids, BulkMode::PartialApply, |d| {
                d.mark_failed(FailureReason::Transport, "no signal", t(9, 3))
            })
            .unwrap();
        assert_eq!(report, BulkReport { applied: 1, unchanged: 1 });

        let b_ref = MessageRef::scheduled(&b_row.id);
        let d = db.get_delivery(&b_ref).unwrap().unwrap();
        assert_eq!(d.failure_reason, Some(FailureReason::MembershipExcluded));

        let retried = db.claim_retries(t(11, 3), &policy(), &[MessageKind::Scheduled]).unwrap();
        assert_eq!(retried, vec![MessageRef::scheduled(&a_row.id)]);
    }

    #[test]
    fn test_retry_excludes_contacts_who_left_the_group() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let b = db.add_contact("u1", "B", "+15550000002").unwrap();
        let g = db.create_group("u1", "Team", None).unwrap();
        db.add_group_member(&g.id, &a.id).unwrap();
        db.add_group_member(&g.id, &b.id).unwrap();
        let rows = db.schedule_broadcast("u1", &g.id, "Standup", t(9, 0), None).unwrap();

        let claimed = db.claim_due(t(9, 0), &claim_opts(&[MessageKind::Scheduled])).unwrap();
        assert_eq!(claimed.len(), 2);
        for r in &claimed {
            db.mark_failed(&Actor::System, r, FailureReason::Transport, "timeout", t(9, 0)).unwrap();
        }
        db.remove_group_member(&g.id, &b.id).unwrap();

        let retried = db.claim_retries(t(11, 0), &policy(), &[MessageKind::Scheduled]).unwrap();
        let a_row = rows.iter().find(|m| m.contact_id == a.id).unwrap();
        let b_row = rows.iter().find(|m| m.contact_id == b.id).unwrap();
        assert_eq!(retried, vec![MessageRef::scheduled(&a_row.id)]);

        let d = db.get_delivery(&MessageRef::scheduled(&b_row.id)).unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.failure_reason, Some(FailureReason::MembershipExcluded));
        assert_eq!(d.attempts, 1);
    }

    #[test]
    fn test_stale_claims_are_recovered() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m = db.schedule_message("u1", &a.id, "Hi", t(9, 0), None, None).unwrap();
        let opts = claim_opts(&[MessageKind::Scheduled]);

        assert_eq!(db.claim_due(t(9, 0), &opts).unwrap().len(), 1);
        // in flight
        assert!(db.claim_due(t(9, 5), &opts).unwrap().is_empty());
        // abandoned past the claim timeout
        assert_eq!(db.claim_due(t(9, 20), &opts).unwrap().len(), 1);
        let d = db.get_delivery(&MessageRef::scheduled(&m.id)).unwrap().unwrap();
        assert_eq!(d.attempts, 2);
        assert_eq!(d.last_attempt_at, Some(t(9, 20)));
    }

    #[test]
    fn test_claim_due_respects_kinds_and_batch() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        for i in 0..3 {
            db.schedule_message("u1", &a.id, &format!("m{i}"), t(9, i), None, None).unwrap();
        }
        let lesson = db.add_lesson("Week 1").unwrap();
        let pm = db.add_predefined_message(&lesson, "Read chapter 1").unwrap();
        db.select_study_message("u1", &lesson, StudySource::Predefined(pm.clone()), Some(t(9, 0)))
            .unwrap();
        db.select_study_message("u1", &lesson, StudySource::Predefined(pm), None).unwrap();

        let study_only = db.claim_due(t(10, 0), &claim_opts(&[MessageKind::Study])).unwrap();
        assert_eq!(study_only.len(), 1);
        assert_eq!(study_only[0].kind, MessageKind::Study);

        let mut opts = claim_opts(&[MessageKind::Scheduled]);
        opts.batch_size = 2;
        assert_eq!(db.claim_due(t(10, 0), &opts).unwrap().len(), 2);
        assert_eq!(db.claim_due(t(10, 0), &opts).unwrap().len(), 1);
    }

    #[test]
    fn test_sent_reports_are_idempotent() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m = db.schedule_message("u1", &a.id, "Hi", t(9, 0), None, None).unwrap();
        let r = MessageRef::scheduled(&m.id);

        assert_eq!(db.mark_sent(&owner("u1"), &r, t(9, 1), None).unwrap(), Outcome::Applied);
        assert_eq!(db.mark_sent(&owner("u1"), &r, t(9, 5), None).unwrap(), Outcome::Unchanged);
        assert_eq!(
            db.mark_failed(&owner("u1"), &r, FailureReason::Transport, "late", t(9, 6)).unwrap(),
            Outcome::Unchanged
        );
        let d = db.get_delivery(&r).unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Sent);
        assert_eq!(d.delivered_at, Some(t(9, 1)));
        assert_eq!(d.attempts, 1);
    }

    #[test]
    fn test_owner_checks() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m = db.schedule_message("u1", &a.id, "Hi", t(9, 0), None, None).unwrap();
        let r = MessageRef::scheduled(&m.id);

        assert!(matches!(
            db.mark_sent(&owner("u2"), &r, t(9, 1), None),
            Err(TextcastError::Forbidden(_))
        ));
        assert!(matches!(
            db.mark_sent(&owner("u1"), &MessageRef::scheduled("nope"), t(9, 1), None),
            Err(TextcastError::NotFound(_))
        ));
        assert_eq!(db.get_delivery(&r).unwrap().unwrap().status, DeliveryStatus::Unscheduled);
    }

    #[test]
    fn test_bulk_partial_apply_keeps_earlier_writes() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m1 = db.schedule_message("u1", &a.id, "one", t(9, 0), None, None).unwrap();
        let m2 = db.schedule_message("u1", &a.id, "two", t(9, 0), None, None).unwrap();
        let ids = vec![m1.id.clone(), "missing".to_string(), m2.id.clone()];

        let err = db
            .bulk_update("u1", MessageKind::Scheduled, &ids, BulkMode::PartialApply, |d| {
                d.mark_sent(t(9, 1), None)
            })
            .unwrap_err();
        assert!(err.to_string().contains("1 of 3 writes applied"));
        let sent = |id: &str| db.get_scheduled(id).unwrap().unwrap().delivery.status;
        assert_eq!(sent(&m1.id), DeliveryStatus::Sent);
        assert_eq!(sent(&m2.id), DeliveryStatus::Unscheduled);
    }

    #[test]
    fn test_bulk_validate_first_writes_nothing_on_error() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let other = db.add_contact("u2", "B", "+15550000002").unwrap();
        let m1 = db.schedule_message("u1", &a.id, "one", t(9, 0), None, None).unwrap();
        let m2 = db.schedule_message("u2", &other.id, "two", t(9, 0), None, None).unwrap();
        let ids = vec![m1.id.clone(), m2.id.clone()];

        let err = db
            .bulk_update("u1", MessageKind::Scheduled, &ids, BulkMode::ValidateFirst, |d| {
                d.mark_failed(FailureReason::Transport, "x", t(9, 1))
            })
            .unwrap_err();
        assert!(matches!(err, TextcastError::Forbidden(_)));
        assert_eq!(
            db.get_scheduled(&m1.id).unwrap().unwrap().delivery.status,
            DeliveryStatus::Unscheduled
        );

        let report = db
            .bulk_update("u1", MessageKind::Scheduled, &ids[..1], BulkMode::ValidateFirst, |d| {
                d.mark_failed(FailureReason::Transport, "x", t(9, 1))
            })
            .unwrap();
        assert_eq!(report, BulkReport { applied: 1, unchanged: 0 });
    }

    #[test]
    fn test_cancel_reschedule_delete() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m = db.schedule_message("u1", &a.id, "Hi", t(9, 0), None, None).unwrap();
        let r = MessageRef::scheduled(&m.id);

        db.claim_due(t(9, 0), &claim_opts(&[MessageKind::Scheduled])).unwrap();
        assert!(matches!(db.delete_scheduled(&owner("u1"), &m.id), Err(TextcastError::Conflict(_))));
        assert!(matches!(db.reschedule(&owner("u1"), &r, t(12, 0)), Err(TextcastError::Conflict(_))));

        db.mark_failed(&Actor::System, &r, FailureReason::Transport, "x", t(9, 1)).unwrap();
        db.reschedule(&owner("u1"), &r, t(12, 0)).unwrap();
        let m2 = db.get_scheduled(&m.id).unwrap().unwrap();
        assert_eq!(m2.scheduled_at, t(12, 0));
        assert_eq!(m2.delivery, Delivery::default());

        assert_eq!(db.cancel(&owner("u1"), &r).unwrap(), Outcome::Applied);
        assert!(db.claim_due(t(13, 0), &claim_opts(&[MessageKind::Scheduled])).unwrap().is_empty());

        db.delete_scheduled(&owner("u1"), &m.id).unwrap();
        assert!(db.get_scheduled(&m.id).unwrap().is_none());
    }

    #[test]
    fn test_study_pending_groups_and_resolves_content() {
        let db = MessageDb::open_in_memory().unwrap();
        db.upsert_owner("u1", "Ana", Some("+15550000009")).unwrap();
        let lesson = db.add_lesson("Week 1").unwrap();
        let pm = db.add_predefined_message(&lesson, "Read chapter 1").unwrap();
        let cm = db.add_custom_message("u1", &lesson, "Pray for Bob").unwrap();
        db.select_study_message("u1", &lesson, StudySource::Predefined(pm.clone()), Some(t(9, 0)))
            .unwrap();
        db.select_study_message("u1", &lesson, StudySource::Predefined(pm), Some(t(9, 0)))
            .unwrap();
        let orphan = db
            .select_study_message("u1", &lesson, StudySource::Custom(cm.clone()), Some(t(9, 0)))
            .unwrap();
        db.lock()
            .unwrap()
            .execute("DELETE FROM custom_messages WHERE id = ?1", [&cm])
            .unwrap();

        let due = db.study_pending("u1", t(10, 0), None, 100).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message, "Read chapter 1");
        assert_eq!(due[0].message_ids.len(), 2);
        assert_eq!(due[0].lesson_title.as_deref(), Some("Week 1"));
        assert_eq!(due[0].phone_number.as_deref(), Some("+15550000009"));
        assert!(due[0].id.starts_with(&format!("study_{lesson}_")));

        let d = db.get_delivery(&MessageRef::study(&orphan.id)).unwrap().unwrap();
        assert_eq!(d.failure_reason, Some(FailureReason::Validation));
    }

    #[test]
    fn test_custom_message_ownership() {
        let db = MessageDb::open_in_memory().unwrap();
        let lesson = db.add_lesson("Week 1").unwrap();
        let cm = db.add_custom_message("u1", &lesson, "mine").unwrap();
        assert!(matches!(
            db.select_study_message("u2", &lesson, StudySource::Custom(cm), None),
            Err(TextcastError::Forbidden(_))
        ));
    }

    #[test]
    fn test_stats_counts_by_status() {
        let db = MessageDb::open_in_memory().unwrap();
        let a = db.add_contact("u1", "A", "+15550000001").unwrap();
        let m1 = db.schedule_message("u1", &a.id, "one", t(9, 0), None, None).unwrap();
        let m2 = db.schedule_message("u1", &a.id, "two", t(9, 0), None, None).unwrap();
        db.schedule_message("u1", &a.id, "three", t(9, 0), None, None).unwrap();
        db.mark_sent(&Actor::System, &MessageRef::scheduled(&m1.id), t(9, 1), None).unwrap();
        db.mark_failed(&Actor::System, &MessageRef::scheduled(&m2.id), FailureReason::Transport, "x", t(9, 1))
            .unwrap();

        let stats = db.stats("u1", MessageKind::Scheduled, None).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unscheduled, 1);
        assert_eq!(stats.success_rate(), Some(50.0));
        assert_eq!(db.stats("u1", MessageKind::Scheduled, Some(t(10, 0))).unwrap().total, 0);
    }

    #[test]
    fn test_job_watermarks() {
        let db = MessageDb::open_in_memory().unwrap();
        let every = Duration::minutes(54);
        assert!(db.try_begin_job("retry", t(9, 0), every).unwrap());
        assert!(!db.try_begin_job("retry", t(9, 30), every).unwrap());
        db.finish_job("retry", 4).unwrap();
        assert_eq!(
            db.job_run("retry").unwrap(),
            Some(JobRun { last_run_at: t(9, 0), last_count: 4 })
        );
        assert!(db.try_begin_job("retry", t(10, 0), every).unwrap());
        assert!(db.job_run("scan").unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk() {
        let path = std::env::temp_dir().join(format!("textcast-test-{}.db", uuid::Uuid::new_v4()));
        {
            let db = MessageDb::open(&path).unwrap();
            db.add_contact("u1", "A", "+15550000001").unwrap();
        }
        let db = MessageDb::open(&path).unwrap();
        assert!(db.pending_work("u1", Utc::now(), &PendingFilter::default()).unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
