//! API key store.
//!
//! Keys are opaque bearer tokens resolved to an owner. Only the SHA-256 of a
//! key is stored; the plaintext is returned once, when the key is issued.
//! Expiry and rotation grace are checked when a key is presented, so an
//! unused expired key simply stays in the table until someone looks.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use textcast_core::error::{Result, TextcastError};
use textcast_core::time::from_millis_lossy;

const KEY_PREFIX: &str = "tc_";

/// API key database.
pub struct ApiKeyDb {
    conn: Mutex<Connection>,
}

/// Stored key metadata. Never holds the plaintext.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub owner_id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set on rotation: the old key keeps working until then.
    pub grace_until: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Whether the key may authenticate a request at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        match self.expires_at {
            Some(exp) if exp <= now => self.grace_until.is_some_and(|g| g > now),
            _ => true,
        }
    }
}

/// A freshly issued key. `key` is the only copy of the plaintext.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub id: String,
    pub key: String,
}

fn hash_key(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

fn db_err(ctx: &'static str) -> impl Fn(rusqlite::Error) -> TextcastError {
    move |e| TextcastError::Database(format!("{ctx}: {e}"))
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ApiKeyRecord> {
    let opt = |i: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        Ok(row.get::<_, Option<i64>>(i)?.map(from_millis_lossy))
    };
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        label: row.get(2)?,
        created_at: from_millis_lossy(row.get(3)?),
        expires_at: opt(4)?,
        grace_until: opt(5)?,
        revoked: row.get::<_, i32>(6)? != 0,
        verified_at: opt(7)?,
        last_used_at: opt(8)?,
    })
}

const KEY_COLUMNS: &str = "id, owner_id, label, created_at, expires_at, grace_until, revoked, \
     verified_at, last_used_at";

impl ApiKeyDb {
    /// Open or create the key store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("Key DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Key DB open"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TextcastError::Database(format!("Lock: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                grace_until INTEGER,
                revoked INTEGER NOT NULL DEFAULT 0,
                verified_at INTEGER,
                last_used_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_owner ON api_keys(owner_id);
        ",
            )
            .map_err(db_err("Key DB migration"))?;
        Ok(())
    }

    /// Issue a new key for an owner.
    pub fn issue_key(
        &self,
        owner_id: &str,
        label: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey> {
        if owner_id.trim().is_empty() {
            return Err(TextcastError::InvalidInput("owner id is empty".into()));
        }
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes));
        let id = uuid::Uuid::new_v4().to_string();

        self.lock()?
            .execute(
                "INSERT INTO api_keys (id, owner_id, key_hash, label, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    owner_id,
                    hash_key(&key),
                    label,
                    Utc::now().timestamp_millis(),
                    expires_at.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(db_err("Issue key"))?;
        tracing::info!("🔑 API key {id} issued for owner {owner_id}");
        Ok(IssuedKey { id, key })
    }

    /// Resolve a presented key. Unknown, revoked, and expired keys are all
    /// `Unauthorized`; the message does not say which.
    pub fn validate(&self, raw: &str, now: DateTime<Utc>) -> Result<ApiKeyRecord> {
        let unauthorized = || TextcastError::Unauthorized("invalid or missing API key".into());
        if !raw.starts_with(KEY_PREFIX) {
            return Err(unauthorized());
        }
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE key_hash = ?1"),
                [hash_key(raw)],
                row_to_record,
            )
            .optional()
            .map_err(db_err("Validate key"))?
            .ok_or_else(unauthorized)?;
        if !record.is_usable(now) {
            tracing::debug!("Rejected unusable API key {}", record.id);
            return Err(unauthorized());
        }
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![now.timestamp_millis(), record.id],
        )
        .map_err(db_err("Touch key"))?;
        Ok(ApiKeyRecord { last_used_at: Some(now), ..record })
    }

    /// Record the first successful verification of a key. Returns the
    /// verification time and whether this call set it.
    pub fn mark_verified(&self, id: &str, now: DateTime<Utc>) -> Result<(DateTime<Utc>, bool)> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE api_keys SET verified_at = ?1 WHERE id = ?2 AND verified_at IS NULL",
                params![now.timestamp_millis(), id],
            )
            .map_err(db_err("Verify key"))?;
        let at: Option<i64> = conn
            .query_row("SELECT verified_at FROM api_keys WHERE id = ?1", [id], |r| r.get(0))
            .optional()
            .map_err(db_err("Verify key"))?
            .flatten();
        let at = at.ok_or_else(|| TextcastError::NotFound(format!("API key {id}")))?;
        Ok((from_millis_lossy(at), changed > 0))
    }

    /// Replace a key. The old one keeps working for `grace`.
    pub fn rotate(&self, id: &str, grace: Duration, now: DateTime<Utc>) -> Result<IssuedKey> {
        let old = self
            .get(id)?
            .ok_or_else(|| TextcastError::NotFound(format!("API key {id}")))?;
        if old.revoked {
            return Err(TextcastError::Conflict(format!("API key {id} is revoked")));
        }
        let issued = self.issue_key(&old.owner_id, &old.label, old.expires_at.filter(|e| *e > now))?;
        self.lock()?
            .execute(
                "UPDATE api_keys SET expires_at = ?1, grace_until = ?2 WHERE id = ?3",
                params![now.timestamp_millis(), (now + grace).timestamp_millis(), id],
            )
            .map_err(db_err("Rotate key"))?;
        tracing::info!("🔑 API key {id} rotated to {}", issued.id);
        Ok(issued)
    }

    pub fn revoke(&self, id: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("UPDATE api_keys SET revoked = 1 WHERE id = ?1", [id])
            .map_err(db_err("Revoke key"))?;
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<ApiKeyRecord>> {
        self.lock()?
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?1"),
                [id],
                row_to_record,
            )
            .optional()
            .map_err(db_err("Get key"))
    }

    pub fn list_for_owner(&self, owner_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {KEY_COLUMNS} FROM api_keys WHERE owner_id = ?1 ORDER BY created_at"
            ))
            .map_err(db_err("List keys"))?;
        stmt.query_map([owner_id], row_to_record)
            .map_err(db_err("List keys"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("List keys"))
    }
}
