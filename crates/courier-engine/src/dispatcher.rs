use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use courier_core::{ChannelType, Clock, ConversationChannelKey, Payload};
use courier_store::{ContactMeta, QueueEntry, WindowRow};

use crate::compliance::{ComplianceGate, DenyReason};
use crate::delivery::DeliveryQueue;
use crate::error::EngineError;

/// Notification that a customer wrote to a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub conversation_id: String,
    pub channel_type: ChannelType,
    /// Provider receive time; the engine clock is used when absent.
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl InboundMessage {
    pub fn key(&self) -> ConversationChannelKey {
        ConversationChannelKey::new(self.conversation_id.clone(), self.channel_type)
    }
}

/// Request to send something to a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundIntent {
    pub conversation_id: String,
    pub channel_type: ChannelType,
    pub recipient: String,
    pub payload: Payload,
}

impl OutboundIntent {
    pub fn key(&self) -> ConversationChannelKey {
        ConversationChannelKey::new(self.conversation_id.clone(), self.channel_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    #[serde(rename_all = "camelCase")]
    Sent { provider_message_id: Option<String> },
    Queued { reason: DenyReason, entry: QueueEntry },
}

/// Entry points for the inbound and outbound request paths.
///
/// Neither path waits on a reconciler sweep.
pub struct Dispatcher {
    gate: Arc<ComplianceGate>,
    delivery: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(gate: Arc<ComplianceGate>, delivery: Arc<DeliveryQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            gate,
            delivery,
            clock,
        }
    }

    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, channel = %message.channel_type))]
    pub fn record_inbound(&self, message: &InboundMessage) -> Result<WindowRow, EngineError> {
        let at = message.received_at.unwrap_or_else(|| self.clock.now());
        let meta = ContactMeta {
            contact_id: message.contact_id.clone(),
            owner_id: message.owner_id.clone(),
        };
        self.gate.renew_with(&message.key(), at, &meta)
    }

    /// Send now if the window allows it, otherwise queue.
    ///
    /// A failed direct send is returned to the caller, not queued.
    #[instrument(skip(self, intent), fields(conversation_id = %intent.conversation_id, channel = %intent.channel_type))]
    pub async fn dispatch(&self, intent: &OutboundIntent) -> Result<DispatchOutcome, EngineError> {
        let key = intent.key();
        let decision = self.gate.evaluate(&key, self.clock.now());

        match decision.reason {
            None => {
                let receipt = self
                    .delivery
                    .send_now(&key, &intent.recipient, &intent.payload)
                    .await?;
                info!(key = %key, "sent directly");
                Ok(DispatchOutcome::Sent {
                    provider_message_id: receipt.provider_message_id,
                })
            }
            Some(reason) => {
                let entry = self.delivery.enqueue(&key, &intent.recipient, &intent.payload)?;
                info!(key = %key, %reason, entry_id = %entry.id, "send blocked, queued");
                Ok(DispatchOutcome::Queued { reason, entry })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use courier_core::mock::MockTransport;
    use courier_core::{ManualClock, SendError};
    use courier_store::{Database, QueueStatus};

    use crate::catalog::TemplateCatalog;
    use crate::delivery::DeliveryConfig;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn build(transport: MockTransport) -> (Dispatcher, Arc<MockTransport>, Arc<ManualClock>) {
        let db = Database::in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let gate = Arc::new(ComplianceGate::new(db.clone(), chrono::Duration::hours(24)));
        let transport = Arc::new(transport);
        let delivery = Arc::new(DeliveryQueue::new(
            db.clone(),
            gate.clone(),
            Arc::new(TemplateCatalog::new(db)),
            transport.clone(),
            clock.clone(),
            DeliveryConfig::default(),
        ));
        (Dispatcher::new(gate, delivery, clock.clone()), transport, clock)
    }

    fn inbound() -> InboundMessage {
        InboundMessage {
            conversation_id: "C1".into(),
            channel_type: ChannelType::Whatsapp,
            received_at: None,
            contact_id: Some("contact-9".into()),
            owner_id: None,
        }
    }

    fn intent() -> OutboundIntent {
        OutboundIntent {
            conversation_id: "C1".into(),
            channel_type: ChannelType::Whatsapp,
            recipient: "+15550001".into(),
            payload: Payload::text("hello"),
        }
    }

    #[test]
    fn inbound_uses_clock_when_unstamped() {
        let (dispatcher, _, _) = build(MockTransport::always_deliver());
        let window = dispatcher.record_inbound(&inbound()).unwrap();
        assert_eq!(window.last_customer_message_at, t0());
        assert_eq!(window.contact_id.as_deref(), Some("contact-9"));
    }

    #[tokio::test]
    async fn dispatch_sends_inside_window() {
        let (dispatcher, transport, _) = build(MockTransport::always_deliver());
        dispatcher.record_inbound(&inbound()).unwrap();

        let outcome = dispatcher.dispatch(&intent()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sent { provider_message_id: Some(_) }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn dispatch_queues_outside_window() {
        let (dispatcher, transport, clock) = build(MockTransport::always_deliver());
        dispatcher.record_inbound(&inbound()).unwrap();
        clock.advance(chrono::Duration::hours(25));

        match dispatcher.dispatch(&intent()).await.unwrap() {
            DispatchOutcome::Queued { reason, entry } => {
                assert_eq!(reason, DenyReason::WindowExpired);
                assert_eq!(entry.status, QueueStatus::Waiting);
                assert_eq!(entry.attempts, 0);
            }
            other => panic!("expected queued, got {other:?}"),
        }
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_without_window_queues() {
        let (dispatcher, _, _) = build(MockTransport::always_deliver());
        let outcome = dispatcher.dispatch(&intent()).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Queued { reason: DenyReason::NoWindow, .. }
        ));
    }

    #[tokio::test]
    async fn direct_send_failure_propagates() {
        let (dispatcher, _, _) = build(MockTransport::always_fail());
        dispatcher.record_inbound(&inbound()).unwrap();
        assert!(matches!(
            dispatcher.dispatch(&intent()).await,
            Err(EngineError::Send(SendError::Network(_)))
        ));
    }

    #[test]
    fn outcome_wire_shape() {
        let sent = DispatchOutcome::Sent {
            provider_message_id: Some("wamid.1".into()),
        };
        let json = serde_json::to_value(&sent).unwrap();
        assert_eq!(json["outcome"], "sent");
        assert_eq!(json["providerMessageId"], "wamid.1");
    }

    #[test]
    fn intent_deserializes_from_camel_case() {
        let intent: OutboundIntent = serde_json::from_value(serde_json::json!({
            "conversationId": "C1",
            "channelType": "instagram",
            "recipient": "ig-user",
            "payload": {"type": "text", "body": "hey"}
        }))
        .unwrap();
        assert_eq!(intent.key(), ConversationChannelKey::new("C1", ChannelType::Instagram));
        assert_eq!(intent.payload, Payload::text("hey"));
    }
}
