use std::collections::BTreeMap;

use tracing::instrument;

use courier_core::{ChannelType, MessageKind, OutboundContent, Payload};
use courier_store::{Database, TemplateRepo, TemplateRow, TemplateStatus};

use crate::error::EngineError;

/// Read-only view over provider-approved templates.
///
/// Rows are written by an external sync job; this type never mutates them.
pub struct TemplateCatalog {
    templates: TemplateRepo,
}

impl TemplateCatalog {
    pub fn new(db: Database) -> Self {
        Self {
            templates: TemplateRepo::new(db),
        }
    }

    pub fn find_approved(
        &self,
        channel_type: ChannelType,
        kind: MessageKind,
    ) -> Result<Option<TemplateRow>, EngineError> {
        Ok(self.templates.find_approved(channel_type, kind)?)
    }

    /// Template to use for `payload` on `channel_type`.
    ///
    /// A template payload prefers its own named template when that one is
    /// approved; anything else falls back to the first approved template
    /// for the payload's kind.
    #[instrument(skip(self, payload), fields(channel = %channel_type, kind = %payload.kind()))]
    pub fn resolve(
        &self,
        channel_type: ChannelType,
        payload: &Payload,
    ) -> Result<Option<TemplateRow>, EngineError> {
        if let Payload::Template { name, language, .. } = payload {
            if let Some(named) = self.templates.find_named(channel_type, name, language)? {
                if named.status == TemplateStatus::Approved {
                    return Ok(Some(named));
                }
            }
        }
        self.find_approved(channel_type, payload.kind())
    }

    /// Fill every `{{slot}}` in the template body from `params`.
    pub fn render(
        template: &TemplateRow,
        params: &BTreeMap<String, String>,
    ) -> Result<OutboundContent, EngineError> {
        let mut rendered = String::with_capacity(template.body.len());
        let mut rest = template.body.as_str();

        while let Some(start) = rest.find("{{") {
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                return Err(EngineError::Render(format!(
                    "template {}: unterminated slot",
                    template.name
                )));
            };
            let slot = after_open[..end].trim();
            let value = params.get(slot).ok_or_else(|| {
                EngineError::Render(format!("template {}: missing slot '{slot}'", template.name))
            })?;
            rendered.push_str(&rest[..start]);
            rendered.push_str(value);
            rest = &after_open[end + 2..];
        }
        rendered.push_str(rest);

        let parameters = template
            .parameter_slots
            .iter()
            .map(|slot| {
                params.get(slot).cloned().ok_or_else(|| {
                    EngineError::Render(format!(
                        "template {}: missing slot '{slot}'",
                        template.name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(OutboundContent::Template {
            name: template.name.clone(),
            language: template.language.clone(),
            parameters,
            rendered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::NewTemplate;

    fn seed(db: &Database, name: &str, kind: MessageKind, status: TemplateStatus, body: &str, slots: &[&str]) -> TemplateRow {
        TemplateRepo::new(db.clone())
            .upsert(&NewTemplate {
                channel_type: ChannelType::Whatsapp,
                name: name.into(),
                language: "en".into(),
                kind,
                status,
                body: body.into(),
                parameter_slots: slots.iter().map(|s| s.to_string()).collect(),
            })
            .unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn find_approved_skips_other_statuses() {
        let db = Database::in_memory().unwrap();
        seed(&db, "a_pending", MessageKind::Text, TemplateStatus::Pending, "x", &[]);
        let catalog = TemplateCatalog::new(db.clone());
        assert!(catalog
            .find_approved(ChannelType::Whatsapp, MessageKind::Text)
            .unwrap()
            .is_none());

        seed(&db, "b_ok", MessageKind::Text, TemplateStatus::Approved, "x", &[]);
        let found = catalog
            .find_approved(ChannelType::Whatsapp, MessageKind::Text)
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "b_ok");
    }

    #[test]
    fn resolve_prefers_named_approved_template() {
        let db = Database::in_memory().unwrap();
        seed(&db, "aaa_generic", MessageKind::Template, TemplateStatus::Approved, "hi", &[]);
        seed(&db, "order_update", MessageKind::Template, TemplateStatus::Approved, "order {{id}}", &["id"]);
        let catalog = TemplateCatalog::new(db);

        let payload = Payload::Template {
            name: "order_update".into(),
            language: "en".into(),
            params: params(&[("id", "42")]),
        };
        let found = catalog.resolve(ChannelType::Whatsapp, &payload).unwrap().unwrap();
        assert_eq!(found.name, "order_update");
    }

    #[test]
    fn resolve_falls_back_when_named_not_approved() {
        let db = Database::in_memory().unwrap();
        seed(&db, "generic", MessageKind::Template, TemplateStatus::Approved, "hi", &[]);
        seed(&db, "order_update", MessageKind::Template, TemplateStatus::Paused, "x", &[]);
        let catalog = TemplateCatalog::new(db);

        let payload = Payload::Template {
            name: "order_update".into(),
            language: "en".into(),
            params: BTreeMap::new(),
        };
        let found = catalog.resolve(ChannelType::Whatsapp, &payload).unwrap().unwrap();
        assert_eq!(found.name, "generic");
    }

    #[test]
    fn resolve_text_uses_kind_lookup() {
        let db = Database::in_memory().unwrap();
        let catalog = TemplateCatalog::new(db.clone());
        assert!(catalog
            .resolve(ChannelType::Whatsapp, &Payload::text("hello"))
            .unwrap()
            .is_none());

        seed(&db, "reopen", MessageKind::Text, TemplateStatus::Approved, "{{body}}", &["body"]);
        assert!(catalog
            .resolve(ChannelType::Whatsapp, &Payload::text("hello"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn render_fills_slots_in_order() {
        let db = Database::in_memory().unwrap();
        let template = seed(
            &db,
            "shipping",
            MessageKind::Template,
            TemplateStatus::Approved,
            "Hi {{ name }}, order {{order}} ships {{when}}.",
            &["name", "order", "when"],
        );
        let content = TemplateCatalog::render(
            &template,
            &params(&[("when", "today"), ("name", "Sam"), ("order", "A-1")]),
        )
        .unwrap();

        assert_eq!(
            content,
            OutboundContent::Template {
                name: "shipping".into(),
                language: "en".into(),
                parameters: vec!["Sam".into(), "A-1".into(), "today".into()],
                rendered: "Hi Sam, order A-1 ships today.".into(),
            }
        );
    }

    #[test]
    fn render_missing_slot_is_error() {
        let db = Database::in_memory().unwrap();
        let template = seed(&db, "t", MessageKind::Text, TemplateStatus::Approved, "{{body}} {{extra}}", &["body"]);
        let err = TemplateCatalog::render(&template, &params(&[("body", "x")])).unwrap_err();
        assert!(matches!(err, EngineError::Render(msg) if msg.contains("extra")));
    }

    #[test]
    fn render_unterminated_slot_is_error() {
        let db = Database::in_memory().unwrap();
        let template = seed(&db, "t", MessageKind::Text, TemplateStatus::Approved, "oops {{body", &[]);
        assert!(matches!(
            TemplateCatalog::render(&template, &BTreeMap::new()),
            Err(EngineError::Render(_))
        ));
    }

    #[test]
    fn render_without_slots_is_verbatim() {
        let db = Database::in_memory().unwrap();
        let template = seed(&db, "plain", MessageKind::Text, TemplateStatus::Approved, "We are back online.", &[]);
        let content = TemplateCatalog::render(&template, &BTreeMap::new()).unwrap();
        assert!(matches!(content, OutboundContent::Template { rendered, .. } if rendered == "We are back online."));
    }
}
