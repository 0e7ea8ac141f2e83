use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SendError;
use crate::key::ChannelType;
use crate::message::OutboundContent;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub channel_type: ChannelType,
    pub recipient: String,
    pub content: OutboundContent,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
}

/// Opaque send capability supplied by the transport layer.
///
/// Implementations should not retry on their own; retry accounting
/// belongs to the delivery queue.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError>;
}
