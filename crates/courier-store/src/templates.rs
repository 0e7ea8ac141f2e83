use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use courier_core::clock::format_ts;
use courier_core::ids::TemplateId;
use courier_core::{ChannelType, MessageKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Provider review state of a template. Only `Approved` may be sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Approved,
    Pending,
    Rejected,
    Paused,
}

impl std::fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Pending => write!(f, "pending"),
            Self::Rejected => write!(f, "rejected"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for TemplateStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "pending" => Ok(Self::Pending),
            "rejected" => Ok(Self::Rejected),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown template status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRow {
    pub id: TemplateId,
    pub channel_type: ChannelType,
    pub name: String,
    pub language: String,
    /// Which kind of queued message this template may stand in for.
    pub kind: MessageKind,
    pub status: TemplateStatus,
    /// Body with `{{slot}}` placeholders.
    pub body: String,
    /// Slot names in positional order.
    pub parameter_slots: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

/// Template as delivered by the external sync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplate {
    pub channel_type: ChannelType,
    pub name: String,
    pub language: String,
    pub kind: MessageKind,
    pub status: TemplateStatus,
    pub body: String,
    #[serde(default)]
    pub parameter_slots: Vec<String>,
}

const TEMPLATE_COLUMNS: &str =
    "id, channel_type, name, language, kind, status, body, parameter_slots, synced_at";

/// Reference data written only by the sync collaborator.
pub struct TemplateRepo {
    db: Database,
}

impl TemplateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a template identified by `(channel_type, name, language)`.
    #[instrument(skip(self, template), fields(channel = %template.channel_type, name = %template.name))]
    pub fn upsert(&self, template: &NewTemplate) -> Result<TemplateRow, StoreError> {
        let slots = serde_json::to_string(&template.parameter_slots)?;
        let synced = format_ts(Utc::now());
        let fresh_id = TemplateId::new();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO templates (id, channel_type, name, language, kind, status, body,
                                        parameter_slots, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (channel_type, name, language) DO UPDATE SET
                    kind = excluded.kind,
                    status = excluded.status,
                    body = excluded.body,
                    parameter_slots = excluded.parameter_slots,
                    synced_at = excluded.synced_at",
                rusqlite::params![
                    fresh_id.as_str(),
                    template.channel_type.as_str(),
                    template.name,
                    template.language,
                    template.kind.to_string(),
                    template.status.to_string(),
                    template.body,
                    slots,
                    synced,
                ],
            )?;
            Ok(())
        })?;

        self.find_named(template.channel_type, &template.name, &template.language)?
            .ok_or_else(|| StoreError::NotFound(format!("template {}", template.name)))
    }

    /// First approved template for `(channel_type, kind)`, by name then language.
    #[instrument(skip(self), fields(channel = %channel_type, kind = %kind))]
    pub fn find_approved(
        &self,
        channel_type: ChannelType,
        kind: MessageKind,
    ) -> Result<Option<TemplateRow>, StoreError> {
        self.query_one(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates
                 WHERE channel_type = ?1 AND kind = ?2 AND status = 'approved'
                 ORDER BY name ASC, language ASC LIMIT 1"
            ),
            &[&channel_type.as_str(), &kind.to_string()],
        )
    }

    /// Exact lookup regardless of status.
    pub fn find_named(
        &self,
        channel_type: ChannelType,
        name: &str,
        language: &str,
    ) -> Result<Option<TemplateRow>, StoreError> {
        self.query_one(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates
                 WHERE channel_type = ?1 AND name = ?2 AND language = ?3"
            ),
            &[&channel_type.as_str(), &name, &language],
        )
    }

    pub fn list(&self, channel_type: ChannelType) -> Result<Vec<TemplateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE channel_type = ?1
                 ORDER BY name ASC, language ASC"
            ))?;
            let mut rows = stmt.query([channel_type.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_template(row)?);
            }
            Ok(results)
        })
    }

    fn query_one(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Option<TemplateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_template(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_template(row: &rusqlite::Row<'_>) -> Result<TemplateRow, StoreError> {
    let channel: String = row_helpers::get(row, 1, "templates", "channel_type")?;
    let kind: String = row_helpers::get(row, 4, "templates", "kind")?;
    let status: String = row_helpers::get(row, 5, "templates", "status")?;
    let slots: String = row_helpers::get(row, 7, "templates", "parameter_slots")?;

    Ok(TemplateRow {
        id: TemplateId::from_raw(row_helpers::get::<String>(row, 0, "templates", "id")?),
        channel_type: row_helpers::parse_enum(&channel, "templates", "channel_type")?,
        name: row_helpers::get(row, 2, "templates", "name")?,
        language: row_helpers::get(row, 3, "templates", "language")?,
        kind: row_helpers::parse_enum(&kind, "templates", "kind")?,
        status: row_helpers::parse_enum(&status, "templates", "status")?,
        body: row_helpers::get(row, 6, "templates", "body")?,
        parameter_slots: row_helpers::parse_json(&slots, "templates", "parameter_slots")?,
        synced_at: row_helpers::get_ts(row, 8, "templates", "synced_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, kind: MessageKind, status: TemplateStatus) -> NewTemplate {
        NewTemplate {
            channel_type: ChannelType::Whatsapp,
            name: name.into(),
            language: "en".into(),
            kind,
            status,
            body: "Hi! {{body}}".into(),
            parameter_slots: vec!["body".into()],
        }
    }

    fn setup() -> TemplateRepo {
        TemplateRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn upsert_and_find_named() {
        let repo = setup();
        let row = repo
            .upsert(&template("follow_up", MessageKind::Text, TemplateStatus::Approved))
            .unwrap();
        assert!(row.id.as_str().starts_with("tpl_"));
        assert_eq!(row.parameter_slots, vec!["body"]);

        let found = repo.find_named(ChannelType::Whatsapp, "follow_up", "en").unwrap().unwrap();
        assert_eq!(found, row);
        assert!(repo.find_named(ChannelType::Instagram, "follow_up", "en").unwrap().is_none());
    }

    #[test]
    fn upsert_refreshes_status_and_keeps_id() {
        let repo = setup();
        let first = repo
            .upsert(&template("follow_up", MessageKind::Text, TemplateStatus::Pending))
            .unwrap();
        let second = repo
            .upsert(&template("follow_up", MessageKind::Text, TemplateStatus::Approved))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, TemplateStatus::Approved);
        assert_eq!(repo.list(ChannelType::Whatsapp).unwrap().len(), 1);
    }

    #[test]
    fn find_approved_filters_status_kind_and_channel() {
        let repo = setup();
        repo.upsert(&template("a_pending", MessageKind::Text, TemplateStatus::Pending)).unwrap();
        repo.upsert(&template("b_template", MessageKind::Template, TemplateStatus::Approved)).unwrap();
        assert!(repo.find_approved(ChannelType::Whatsapp, MessageKind::Text).unwrap().is_none());

        repo.upsert(&template("z_text", MessageKind::Text, TemplateStatus::Approved)).unwrap();
        repo.upsert(&template("c_text", MessageKind::Text, TemplateStatus::Approved)).unwrap();
        let found = repo.find_approved(ChannelType::Whatsapp, MessageKind::Text).unwrap().unwrap();
        assert_eq!(found.name, "c_text");

        assert!(repo.find_approved(ChannelType::Messenger, MessageKind::Text).unwrap().is_none());
    }
}
