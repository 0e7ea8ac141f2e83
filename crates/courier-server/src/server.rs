use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use courier_engine::CourierServices;
use courier_settings::ServerSettings;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: CourierServices,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/inbound", post(handlers::inbound))
        .route("/v1/outbound", post(handlers::outbound))
        .route(
            "/v1/compliance/{conversation_id}/{channel}",
            get(handlers::compliance),
        )
        .route("/v1/windows", get(handlers::windows))
        .route("/v1/queue", get(handlers::queue))
        .route("/v1/queue/counts", get(handlers::queue_counts))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `cancel` fires.
pub async fn start(
    config: ServerConfig,
    services: CourierServices,
    cancel: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { services });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "courier server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn into_join_handle(self) -> JoinHandle<()> {
        self.server
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, TimeZone, Utc};
    use tower::ServiceExt;

    use courier_core::mock::MockTransport;
    use courier_core::{ChannelType, ManualClock};
    use courier_settings::CourierSettings;
    use courier_store::Database;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Fixture {
        router: Router,
        clock: Arc<ManualClock>,
        transport: Arc<MockTransport>,
        services: CourierServices,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = Arc::new(MockTransport::always_deliver());
        let (services, _rx) = CourierServices::build(
            Database::in_memory().unwrap(),
            &CourierSettings::default(),
            transport.clone(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            router: build_router(AppState {
                services: services.clone(),
            }),
            clock,
            transport,
            services,
        }
    }

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn outbound_body() -> serde_json::Value {
        serde_json::json!({
            "conversationId": "C1",
            "channelType": "whatsapp",
            "recipient": "+15550001",
            "payload": {"type": "text", "body": "hello"}
        })
    }

    #[tokio::test]
    async fn health_reports_queue() {
        let f = fixture();
        let (status, body) = call(&f.router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue"]["waiting"], 0);
    }

    #[tokio::test]
    async fn inbound_then_outbound_sends() {
        let f = fixture();
        let (status, window) = call(
            &f.router,
            post_json(
                "/v1/inbound",
                serde_json::json!({"conversationId": "C1", "channelType": "whatsapp"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(window["status"], "open");

        let (status, body) = call(&f.router, post_json("/v1/outbound", outbound_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "sent");
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn outbound_without_window_is_queued() {
        let f = fixture();
        let (status, body) = call(&f.router, post_json("/v1/outbound", outbound_body())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "queued");
        assert_eq!(body["reason"], "no_window");
        assert_eq!(body["entry"]["status"], "waiting");

        let (status, counts) = call(&f.router, get("/v1/queue/counts")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(counts["waiting"], 1);

        let (_, entries) = call(&f.router, get("/v1/queue?status=waiting&limit=10")).await;
        assert_eq!(entries.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_json_400() {
        let f = fixture();
        let (status, body) = call(
            &f.router,
            post_json("/v1/outbound", serde_json::json!({"conversationId": "C1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn compliance_decision_and_bad_channel() {
        let f = fixture();
        f.services
            .gate
            .renew(
                &courier_core::ConversationChannelKey::new("C1", ChannelType::Messenger),
                t0(),
            )
            .unwrap();

        let (status, body) = call(&f.router, get("/v1/compliance/C1/messenger")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);

        f.clock.advance(chrono::Duration::hours(25));
        let (_, body) = call(&f.router, get("/v1/compliance/C1/messenger")).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["reason"], "window_expired");

        let (status, body) = call(&f.router, get("/v1/compliance/C1/telegram")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("telegram"));
    }

    #[tokio::test]
    async fn windows_listing_filters_expiring() {
        let f = fixture();
        let near = courier_core::ConversationChannelKey::new("near", ChannelType::Whatsapp);
        let far = courier_core::ConversationChannelKey::new("far", ChannelType::Whatsapp);
        f.services.gate.renew(&near, t0()).unwrap();
        f.services
            .gate
            .renew(&far, t0() + chrono::Duration::hours(10))
            .unwrap();
        f.clock.advance(chrono::Duration::hours(23) + chrono::Duration::minutes(30));

        let (_, open) = call(&f.router, get("/v1/windows")).await;
        assert_eq!(open.as_array().unwrap().len(), 2);

        let (_, soon) = call(&f.router, get("/v1/windows?expiringWithinMinutes=60")).await;
        let soon = soon.as_array().unwrap();
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0]["key"]["conversationId"], "near");
    }

    #[tokio::test]
    async fn invalid_queue_status_is_400() {
        let f = fixture();
        let (status, _) = call(&f.router, get("/v1/queue?status=lost")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn server_starts_and_stops() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let handle = start(config, f.services.clone(), cancel.clone()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        cancel.cancel();
        handle.into_join_handle().await.unwrap();
    }
}
