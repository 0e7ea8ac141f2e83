use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Template,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Template => write!(f, "template"),
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "template" => Ok(Self::Template),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// What the caller wanted to send, as persisted on a queue entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Text {
        body: String,
    },
    Template {
        name: String,
        language: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl Payload {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Template { .. } => MessageKind::Template,
        }
    }

    /// Values available to fill template slots.
    ///
    /// Free text is exposed under the `body` slot.
    pub fn template_params(&self) -> BTreeMap<String, String> {
        match self {
            Self::Text { body } => BTreeMap::from([("body".to_string(), body.clone())]),
            Self::Template { params, .. } => params.clone(),
        }
    }
}

/// What actually goes over the wire to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Template {
        name: String,
        language: String,
        /// Positional values in the template's slot order.
        parameters: Vec<String>,
        /// Body with slots filled in, for audit and logs.
        rendered: String,
    },
}

impl OutboundContent {
    pub fn is_template(&self) -> bool {
        matches!(self, Self::Template { .. })
    }
}
