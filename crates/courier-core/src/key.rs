use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Messaging platform a conversation lives on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Whatsapp,
    Instagram,
    Messenger,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Instagram => "instagram",
            Self::Messenger => "messenger",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::Whatsapp),
            "instagram" => Ok(Self::Instagram),
            "messenger" => Ok(Self::Messenger),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

/// Identity every window and queue entry is scoped by.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationChannelKey {
    pub conversation_id: String,
    pub channel_type: ChannelType,
}

impl ConversationChannelKey {
    pub fn new(conversation_id: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            channel_type,
        }
    }
}

impl fmt::Display for ConversationChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conversation_id, self.channel_type)
    }
}
