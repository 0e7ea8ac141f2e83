use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use courier_core::clock::format_ts;
use courier_core::ConversationChannelKey;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Cached projection of a window's state. Only sweeps move it to `Expired`;
/// allow/deny decisions recompute from `window_expires_at`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Open,
    Expired,
}

impl std::fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for WindowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown window status: {other}")),
        }
    }
}

/// Owner/contact metadata carried alongside a window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMeta {
    pub contact_id: Option<String>,
    pub owner_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRow {
    pub key: ConversationChannelKey,
    pub contact_id: Option<String>,
    pub owner_id: Option<String>,
    pub last_customer_message_at: DateTime<Utc>,
    pub window_expires_at: DateTime<Utc>,
    pub status: WindowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WindowRow {
    /// Authoritative openness at `now`, independent of the cached status.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.window_expires_at
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.window_expires_at - now).max(Duration::zero())
    }
}

const WINDOW_COLUMNS: &str = "conversation_id, channel_type, contact_id, owner_id, \
     last_customer_message_at, window_expires_at, status, created_at, updated_at";

pub struct WindowRepo {
    db: Database,
}

impl WindowRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(key = %key))]
    pub fn get(&self, key: &ConversationChannelKey) -> Result<Option<WindowRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WINDOW_COLUMNS} FROM windows WHERE conversation_id = ?1 AND channel_type = ?2"
            ))?;
            let mut rows =
                stmt.query(rusqlite::params![key.conversation_id, key.channel_type.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_window(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Upsert the window for an inbound customer message.
    ///
    /// Both timestamps only move forward, so a late-arriving message can
    /// never shorten a window that is already open. `recorded_at` stamps
    /// the audit columns.
    #[instrument(skip(self, meta), fields(key = %key, now = %now))]
    pub fn renew(
        &self,
        key: &ConversationChannelKey,
        now: DateTime<Utc>,
        window: Duration,
        meta: &ContactMeta,
        recorded_at: DateTime<Utc>,
    ) -> Result<WindowRow, StoreError> {
        let received = format_ts(now);
        let expires = format_ts(now + window);
        let updated = format_ts(recorded_at);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO windows (conversation_id, channel_type, contact_id, owner_id,
                                      last_customer_message_at, window_expires_at, status,
                                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?7)
                 ON CONFLICT (conversation_id, channel_type) DO UPDATE SET
                    last_customer_message_at = MAX(last_customer_message_at, excluded.last_customer_message_at),
                    window_expires_at = MAX(window_expires_at, excluded.window_expires_at),
                    status = 'open',
                    contact_id = COALESCE(excluded.contact_id, contact_id),
                    owner_id = COALESCE(excluded.owner_id, owner_id),
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    key.conversation_id,
                    key.channel_type.as_str(),
                    meta.contact_id,
                    meta.owner_id,
                    received,
                    expires,
                    updated,
                ],
            )?;

            let row = conn
                .query_row(
                    &format!(
                        "SELECT {WINDOW_COLUMNS} FROM windows
                         WHERE conversation_id = ?1 AND channel_type = ?2"
                    ),
                    rusqlite::params![key.conversation_id, key.channel_type.as_str()],
                    |row| Ok(row_to_window(row)),
                )
                .optional()?;
            row.ok_or_else(|| StoreError::NotFound(format!("window {key}")))?
        })
    }

    /// Flip every open window whose expiry is strictly before `now`.
    #[instrument(skip(self), fields(now = %now))]
    pub fn mark_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_s = format_ts(now);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE windows SET status = 'expired', updated_at = ?1
                 WHERE status = 'open' AND window_expires_at < ?1",
                [now_s],
            )?;
            Ok(changed)
        })
    }

    /// Windows that are open at `now`, soonest expiry first.
    pub fn list_open(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>, StoreError> {
        self.list_expiring_between(now, None)
    }

    /// Open windows whose expiry falls within `within` of `now`.
    pub fn list_expiring(
        &self,
        now: DateTime<Utc>,
        within: Duration,
    ) -> Result<Vec<WindowRow>, StoreError> {
        self.list_expiring_between(now, Some(now + within))
    }

    fn list_expiring_between(
        &self,
        now: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<WindowRow>, StoreError> {
        let from = format_ts(now);
        // '~' sorts after every digit, so it bounds nothing.
        let until = until.map_or_else(|| "~".to_string(), format_ts);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WINDOW_COLUMNS} FROM windows
                 WHERE window_expires_at >= ?1 AND window_expires_at <= ?2
                 ORDER BY window_expires_at ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![from, until])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_window(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_window(row: &rusqlite::Row<'_>) -> Result<WindowRow, StoreError> {
    let channel: String = row_helpers::get(row, 1, "windows", "channel_type")?;
    let status: String = row_helpers::get(row, 6, "windows", "status")?;

    Ok(WindowRow {
        key: ConversationChannelKey {
            conversation_id: row_helpers::get(row, 0, "windows", "conversation_id")?,
            channel_type: row_helpers::parse_enum(&channel, "windows", "channel_type")?,
        },
        contact_id: row_helpers::get_opt(row, 2, "windows", "contact_id")?,
        owner_id: row_helpers::get_opt(row, 3, "windows", "owner_id")?,
        last_customer_message_at: row_helpers::get_ts(row, 4, "windows", "last_customer_message_at")?,
        window_expires_at: row_helpers::get_ts(row, 5, "windows", "window_expires_at")?,
        status: row_helpers::parse_enum(&status, "windows", "status")?,
        created_at: row_helpers::get_ts(row, 7, "windows", "created_at")?,
        updated_at: row_helpers::get_ts(row, 8, "windows", "updated_at")?,
    })
}
