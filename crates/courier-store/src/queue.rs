use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use courier_core::clock::format_ts;
use courier_core::ids::QueueEntryId;
use courier_core::{ConversationChannelKey, MessageKind, Payload};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub key: ConversationChannelKey,
    pub recipient: String,
    pub kind: MessageKind,
    pub payload: Payload,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub sent: u64,
    pub failed: u64,
}

const QUEUE_COLUMNS: &str = "id, conversation_id, channel_type, recipient, kind, payload, status, \
     attempts, max_attempts, last_error, claimed_until, created_at, last_attempt_at, updated_at";

pub struct QueueRepo {
    db: Database,
}

impl QueueRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new `Waiting` entry with zero attempts.
    #[instrument(skip(self, payload), fields(key = %key, kind = %payload.kind()))]
    pub fn insert(
        &self,
        key: &ConversationChannelKey,
        recipient: &str,
        payload: &Payload,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        let id = QueueEntryId::new();
        let payload_json = serde_json::to_string(payload)?;
        let created = format_ts(now);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_entries (id, conversation_id, channel_type, recipient, kind, payload,
                                            status, attempts, max_attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'waiting', 0, ?7, ?8, ?8)",
                rusqlite::params![
                    id.as_str(),
                    key.conversation_id,
                    key.channel_type.as_str(),
                    recipient,
                    payload.kind().to_string(),
                    payload_json,
                    max_attempts,
                    created,
                ],
            )?;
            Ok(())
        })?;

        Ok(QueueEntry {
            id,
            key: key.clone(),
            recipient: recipient.to_string(),
            kind: payload.kind(),
            payload: payload.clone(),
            status: QueueStatus::Waiting,
            attempts: 0,
            max_attempts,
            last_error: None,
            claimed_until: None,
            created_at: now,
            last_attempt_at: None,
            updated_at: now,
        })
    }

    #[instrument(skip(self), fields(entry_id = %id))]
    pub fn get(&self, id: &QueueEntryId) -> Result<QueueEntry, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_entry(row),
                None => Err(StoreError::NotFound(format!("queue entry {id}"))),
            }
        })
    }

    /// `Waiting` entries for a key in conversational (FIFO) order.
    #[instrument(skip(self), fields(key = %key))]
    pub fn waiting_for_key(
        &self,
        key: &ConversationChannelKey,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queue_entries
                 WHERE conversation_id = ?1 AND channel_type = ?2 AND status = 'waiting'
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows =
                stmt.query(rusqlite::params![key.conversation_id, key.channel_type.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Every key holding at least one `Waiting` entry, oldest backlog first.
    pub fn keys_with_waiting(&self) -> Result<Vec<ConversationChannelKey>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, channel_type, MIN(created_at) AS oldest
                 FROM queue_entries WHERE status = 'waiting'
                 GROUP BY conversation_id, channel_type
                 ORDER BY oldest ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                let channel: String = row_helpers::get(row, 1, "queue_entries", "channel_type")?;
                keys.push(ConversationChannelKey {
                    conversation_id: row_helpers::get(row, 0, "queue_entries", "conversation_id")?,
                    channel_type: row_helpers::parse_enum(&channel, "queue_entries", "channel_type")?,
                });
            }
            Ok(keys)
        })
    }

    /// Take a time-boxed lease on a `Waiting` entry.
    ///
    /// Returns `false` when the entry is terminal or another worker holds
    /// an unexpired lease.
    #[instrument(skip(self), fields(entry_id = %id))]
    pub fn claim(
        &self,
        id: &QueueEntryId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let now_s = format_ts(now);
        let until = format_ts(now + lease);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE queue_entries SET claimed_until = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'waiting'
                   AND (claimed_until IS NULL OR claimed_until < ?2)",
                rusqlite::params![until, now_s, id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Drop a lease without counting an attempt.
    pub fn release(&self, id: &QueueEntryId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_entries SET claimed_until = NULL
                 WHERE id = ?1 AND status = 'waiting'",
                [id.as_str()],
            )?;
            Ok(())
        })
    }

    /// `Waiting` → `Sent`. Fails with `Conflict` if the entry already left `Waiting`.
    #[instrument(skip(self), fields(entry_id = %id))]
    pub fn mark_sent(&self, id: &QueueEntryId, now: DateTime<Utc>) -> Result<QueueEntry, StoreError> {
        let now_s = format_ts(now);
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_entries
                 SET status = 'sent', last_attempt_at = ?1, updated_at = ?1,
                     claimed_until = NULL, last_error = NULL
                 WHERE id = ?2 AND status = 'waiting'",
                rusqlite::params![now_s, id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("queue entry {id} is not waiting")));
        }
        self.get(id)
    }

    /// Count one failed attempt; the entry becomes `Failed` once
    /// `attempts` reaches `max_attempts`.
    #[instrument(skip(self, error), fields(entry_id = %id))]
    pub fn record_failure(
        &self,
        id: &QueueEntryId,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<QueueEntry, StoreError> {
        let now_s = format_ts(now);
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_entries
                 SET attempts = attempts + 1,
                     status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'waiting' END,
                     last_attempt_at = ?1, updated_at = ?1,
                     last_error = ?2, claimed_until = NULL
                 WHERE id = ?3 AND status = 'waiting'",
                rusqlite::params![now_s, error, id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("queue entry {id} is not waiting")));
        }
        self.get(id)
    }

    /// Delete terminal entries created before `cutoff`. `Waiting` rows are never touched.
    #[instrument(skip(self), fields(cutoff = %cutoff))]
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_s = format_ts(cutoff);
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM queue_entries
                 WHERE status IN ('sent', 'failed') AND created_at < ?1",
                [cutoff_s],
            )?)
        })
    }

    /// Newest first; `status = None` lists everything.
    pub fn list(
        &self,
        status: Option<QueueStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queue_entries
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![
                status.map(|s| s.to_string()),
                limit,
                offset
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    pub fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")?;
            let mut rows = stmt.query([])?;
            let mut counts = QueueCounts::default();
            while let Some(row) = rows.next()? {
                let status: String = row_helpers::get(row, 0, "queue_entries", "status")?;
                let n: i64 = row_helpers::get(row, 1, "queue_entries", "count")?;
                match row_helpers::parse_enum(&status, "queue_entries", "status")? {
                    QueueStatus::Waiting => counts.waiting = n as u64,
                    QueueStatus::Sent => counts.sent = n as u64,
                    QueueStatus::Failed => counts.failed = n as u64,
                }
            }
            Ok(counts)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<QueueEntry, StoreError> {
    let channel: String = row_helpers::get(row, 2, "queue_entries", "channel_type")?;
    let kind: String = row_helpers::get(row, 4, "queue_entries", "kind")?;
    let payload: String = row_helpers::get(row, 5, "queue_entries", "payload")?;
    let status: String = row_helpers::get(row, 6, "queue_entries", "status")?;

    Ok(QueueEntry {
        id: QueueEntryId::from_raw(row_helpers::get::<String>(row, 0, "queue_entries", "id")?),
        key: ConversationChannelKey {
            conversation_id: row_helpers::get(row, 1, "queue_entries", "conversation_id")?,
            channel_type: row_helpers::parse_enum(&channel, "queue_entries", "channel_type")?,
        },
        recipient: row_helpers::get(row, 3, "queue_entries", "recipient")?,
        kind: row_helpers::parse_enum(&kind, "queue_entries", "kind")?,
        payload: row_helpers::parse_json(&payload, "queue_entries", "payload")?,
        status: row_helpers::parse_enum(&status, "queue_entries", "status")?,
        attempts: row_helpers::get(row, 7, "queue_entries", "attempts")?,
        max_attempts: row_helpers::get(row, 8, "queue_entries", "max_attempts")?,
        last_error: row_helpers::get_opt(row, 9, "queue_entries", "last_error")?,
        claimed_until: row_helpers::get_ts_opt(row, 10, "queue_entries", "claimed_until")?,
        created_at: row_helpers::get_ts(row, 11, "queue_entries", "created_at")?,
        last_attempt_at: row_helpers::get_ts_opt(row, 12, "queue_entries", "last_attempt_at")?,
        updated_at: row_helpers::get_ts(row, 13, "queue_entries", "updated_at")?,
    })
}
