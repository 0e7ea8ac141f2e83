use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument};

use courier_core::{MessageTransport, SendError, SendReceipt, SendRequest};
use courier_settings::TransportSettings;

/// Posts each send as JSON to a relay webhook that talks to the provider.
pub struct HttpTransport {
    client: Client,
    url: String,
    auth_token: Option<String>,
}

/// Optional fields the relay may echo back on success.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    #[serde(alias = "id", alias = "message_id")]
    message_id: Option<String>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            auth_token,
        }
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(channel = %request.channel_type, template = request.content.is_template()))]
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        let mut req = self.client.post(&self.url).json(request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::from_status(status, body));
        }

        // An empty or non-JSON success body is still a delivery.
        let body = resp.text().await.unwrap_or_default();
        let parsed: RelayResponse = serde_json::from_str(&body).unwrap_or_default();
        Ok(SendReceipt {
            provider_message_id: parsed.message_id,
        })
    }
}

/// Stand-in when no webhook is configured: logs the request and refuses it,
/// so queued entries are never marked sent without a real delivery.
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        info!(
            channel = %request.channel_type,
            recipient = %request.recipient,
            template = request.content.is_template(),
            "no webhook configured, dropping send attempt"
        );
        Err(SendError::Unavailable("no webhook configured".into()))
    }
}

/// Pick the transport for the configured webhook.
pub fn transport_from_settings(settings: &TransportSettings) -> Arc<dyn MessageTransport> {
    match &settings.webhook_url {
        Some(url) => Arc::new(HttpTransport::new(url.clone(), settings.auth_token.clone())),
        None => Arc::new(LogTransport),
    }
}
