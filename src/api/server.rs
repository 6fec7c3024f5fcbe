//! Inbound HTTP server for enqueue webhooks.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::types::{EnqueueResponse, ErrorDetail, ErrorResponse, HealthResponse, WebhookPayload};
use crate::backends::{FieldIdCacheBackend, StagingBackend};
use crate::enqueue::{EnqueueError, EnqueueService};

/// Running API server handle.
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ApiServer {
    /// Bind `bind_addr` and serve until [`ApiServer::shutdown`].
    pub async fn start<B>(bind_addr: SocketAddr, service: EnqueueService<B>) -> Result<Self>
    where
        B: StagingBackend + FieldIdCacheBackend + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind api listener on {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(run_server(listener, build_router(service), shutdown_rx));

        info!(addr = %addr, "api server started");
        Ok(Self {
            addr,
            shutdown_tx,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.handle.await {
            error!(error = ?err, "api server task panicked");
        }
    }
}

async fn run_server(
    listener: TcpListener,
    app: Router,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    {
        error!(error = %err, "api server failed");
    }
}

pub fn build_router<B>(service: EnqueueService<B>) -> Router
where
    B: StagingBackend + FieldIdCacheBackend + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/enqueue-contact", post(enqueue_contact::<B>))
        .route("/healthz", get(healthz))
        .with_state(service)
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "dripline-api",
    })
}

async fn enqueue_contact<B>(
    State(service): State<EnqueueService<B>>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Result<Json<EnqueueResponse>, ApiError>
where
    B: StagingBackend + FieldIdCacheBackend + Clone + Send + Sync + 'static,
{
    let Json(payload) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "rejected webhook body");
        ApiError::new(StatusCode::BAD_REQUEST, "MissingField", rejection.body_text())
    })?;
    let request = payload.normalize().into_request()?;
    let enqueued = service.enqueue(request).await?;
    Ok(Json(EnqueueResponse::from(&enqueued)))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        let status = match &err {
            EnqueueError::InvalidRange(_) | EnqueueError::MissingField(_) => {
                StatusCode::BAD_REQUEST
            }
            EnqueueError::DownstreamFieldNotFound { .. } => StatusCode::BAD_GATEWAY,
            EnqueueError::Downstream(_) | EnqueueError::Backend(_) => {
                error!(error = %err, "enqueue failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &err {
            EnqueueError::Downstream(_) | EnqueueError::Backend(_) => {
                "internal server error".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status, err.code(), message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use chrono::{DateTime, Utc};
    use serde_json::{Value, json};
    use tower::util::ServiceExt;

    use super::*;
    use crate::backends::MemoryBackend;
    use crate::downstream::{DownstreamError, FieldDirectory};
    use crate::partition::PartitionKey;

    struct StaticDirectory(Option<&'static str>);

    #[async_trait]
    impl FieldDirectory for StaticDirectory {
        async fn lookup_field_id(
            &self,
            _partition: &PartitionKey,
        ) -> Result<Option<String>, DownstreamError> {
            Ok(self.0.map(str::to_string))
        }
    }

    fn router(backend: MemoryBackend, field_id: Option<&'static str>) -> Router {
        build_router(EnqueueService::new(backend, Arc::new(StaticDirectory(field_id))))
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/enqueue-contact")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn enqueue_returns_schedule() {
        let backend = MemoryBackend::new();
        let before = Utc::now();
        let body = json!({
            "contact_id": "c1",
            "location": { "id": "loc-1" },
            "workflow": { "id": "wf-1" },
            "customData": { "TimeFrame": "60 to 300" }
        });
        let (status, value) =
            post_json(router(backend.clone(), Some("f1")), &body.to_string()).await;

        assert_eq!(status, StatusCode::OK, "{value}");
        assert_eq!(value["success"], json!(true));
        let delay = value["delaySeconds"].as_i64().expect("delay");
        assert!((60..=300).contains(&delay));
        let scheduled_at: DateTime<Utc> = value["scheduledAt"]
            .as_str()
            .expect("scheduledAt")
            .parse()
            .expect("timestamp");
        assert!(scheduled_at >= before + chrono::Duration::seconds(60));

        let staged = backend.staged_items();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].partition, PartitionKey::new("loc-1", Some("wf-1")));
        assert_eq!(staged[0].field_id, "f1");
    }

    #[tokio::test]
    async fn extras_payload_is_accepted() {
        let backend = MemoryBackend::new();
        let body = json!({
            "extras": { "contactId": "c9", "locationId": "loc-9", "TimeFrame": "0 TO 0" },
            "meta": { "key": "humanizer_drip" }
        });
        let (status, value) =
            post_json(router(backend.clone(), Some("f1")), &body.to_string()).await;
        assert_eq!(status, StatusCode::OK, "{value}");
        assert_eq!(value["delaySeconds"], json!(0));
        assert_eq!(backend.staged_items()[0].entity_id, "c9");
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let location = json!({ "id": "l" });
        let cases = [
            (
                json!({
                    "contact_id": "c1",
                    "location": location,
                    "customData": { "TimeFrame": "300 to 60" }
                }),
                "InvalidRange",
            ),
            (
                json!({
                    "contact_id": "c1",
                    "location": location,
                    "customData": { "TimeFrame": "soon" }
                }),
                "InvalidRange",
            ),
            (
                json!({ "contact_id": "c1", "customData": { "TimeFrame": "1 to 2" } }),
                "MissingField",
            ),
        ];
        for (body, code) in cases {
            let backend = MemoryBackend::new();
            let (status, value) =
                post_json(router(backend.clone(), Some("f1")), &body.to_string()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{value}");
            assert_eq!(value["error"]["code"], json!(code));
            assert!(backend.staged_items().is_empty());
        }

        let (status, value) =
            post_json(router(MemoryBackend::new(), Some("f1")), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"]["code"], json!("MissingField"));
    }

    #[tokio::test]
    async fn oversized_time_frame_is_rejected_before_lookup() {
        let backend = MemoryBackend::new();
        let body = json!({
            "contact_id": "c1",
            "location": { "id": "loc-1" },
            "customData": { "TimeFrame": "10000000000000 to 10000000000000" }
        });
        let (status, value) =
            post_json(router(backend.clone(), Some("f1")), &body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{value}");
        assert_eq!(value["error"]["code"], json!("InvalidRange"));
        assert!(backend.staged_items().is_empty());
        assert!(backend.cached_field_ids().is_empty());
    }

    #[tokio::test]
    async fn unknown_field_is_bad_gateway() {
        let backend = MemoryBackend::new();
        let body = json!({
            "contact_id": "c1",
            "location": { "id": "loc-1" },
            "customData": { "TimeFrame": "1 to 2" }
        });
        let (status, value) = post_json(router(backend.clone(), None), &body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(value["error"]["code"], json!("DownstreamFieldNotFound"));
        assert!(backend.staged_items().is_empty());
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let response = router(MemoryBackend::new(), None)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn server_binds_and_shuts_down() {
        let server = ApiServer::start(
            "127.0.0.1:0".parse().expect("addr"),
            EnqueueService::new(MemoryBackend::new(), Arc::new(StaticDirectory(Some("f1")))),
        )
        .await
        .expect("start");
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await;
    }
}
