use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER},
        HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sandbox_broker::{BrokerError, ConvertUpload, RelayError, RelayFailure};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::state::AppState;

const RETRY_AFTER_SECS: &str = "5";

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/convert", post(convert))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Browser access is limited to the app's own origin.
pub fn cors_layer(origin: &str, allow_credentials: bool) -> anyhow::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_credentials(allow_credentials))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn convert(State(state): State<AppState>, multipart: Multipart) -> Result<Response, ApiError> {
    let form = ConvertForm::read(multipart).await?;
    let connection = state.broker.ensure_ready().await?;
    let response = state
        .relay
        .convert(&connection, form.upload, form.options.as_deref())
        .await?
        .error_for_status()?;

    let content_type = response
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    Ok((
        [
            (CONTENT_TYPE, content_type),
            (
                CONTENT_DISPOSITION,
                "inline; filename=converted.png".to_string(),
            ),
        ],
        response.body,
    )
        .into_response())
}

struct ConvertForm {
    upload: ConvertUpload,
    options: Option<String>,
}

impl ConvertForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut upload = None;
        let mut options = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?
        {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("file") => {
                    // A plain text field named `file` is not an upload.
                    let Some(file_name) = field.file_name().map(str::to_string) else {
                        continue;
                    };
                    let content_type = field.content_type().map(str::to_string);
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
                    upload = Some(ConvertUpload {
                        file_name,
                        content_type,
                        bytes,
                    });
                }
                Some("options") => {
                    let text = field
                        .text()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
                    options = Some(text.trim().to_string()).filter(|o| !o.is_empty());
                }
                _ => {}
            }
        }

        let upload = upload.ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;
        Ok(Self { upload, options })
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Broker(BrokerError),
    Relay(RelayError),
    Upstream(RelayFailure),
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError::Broker(err)
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::Relay(err)
    }
}

impl From<RelayFailure> for ApiError {
    fn from(failure: RelayFailure) -> Self {
        ApiError::Upstream(failure)
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Broker(err) if err.is_transient() => {
                warn!(error = %err, "sandbox busy; asking client to retry");
                let body = ApiErrorBody {
                    error: "sandbox_busy",
                    message: "sandbox is being prepared, try again shortly".to_string(),
                };
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(RETRY_AFTER, RETRY_AFTER_SECS)],
                    Json(body),
                )
                    .into_response();
            }
            ApiError::Broker(BrokerError::Provisioning(err)) => {
                error!(error = %err, "sandbox provisioning failed");
                (StatusCode::BAD_GATEWAY, "sandbox_unavailable", err.to_string())
            }
            ApiError::Broker(err) => {
                error!(error = %err, "failed to resolve sandbox connection");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "failed to resolve sandbox connection".to_string(),
                )
            }
            ApiError::Relay(RelayError::InvalidUpload(message)) => {
                (StatusCode::BAD_REQUEST, "bad_request", message)
            }
            ApiError::Relay(err) => {
                warn!(error = %err, "relay to sandbox failed");
                (StatusCode::BAD_GATEWAY, "sandbox_unreachable", err.to_string())
            }
            ApiError::Upstream(failure) => {
                warn!(status = %failure.status, "sandbox rejected conversion");
                (StatusCode::BAD_GATEWAY, "convert_failed", failure.message)
            }
        };

        (status, Json(ApiErrorBody { error: code, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::{self, Body},
        http::{HeaderMap, Request},
    };
    use sandbox_broker::broker::ConnectionRecord;
    use sandbox_broker::provision::ProvisionedSandbox;
    use sandbox_broker::relay::CREDENTIAL_HEADER;
    use sandbox_broker::{
        BrokerConfig, DistributedLock, LaunchSpec, LivenessProbe, LockOptions, MemoryStore,
        ProbeFailure, ProvisionError, ProvisioningBackend, SandboxBroker, SandboxRelay,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "gateway-test-boundary";
    const PNG: &[u8] = b"\x89PNGconverted";

    struct AlwaysAlive;

    #[async_trait]
    impl LivenessProbe for AlwaysAlive {
        async fn check(&self, _record: &ConnectionRecord) -> Result<(), ProbeFailure> {
            Ok(())
        }
    }

    struct StaticBackend {
        public_url: Option<String>,
    }

    #[async_trait]
    impl ProvisioningBackend for StaticBackend {
        async fn create(&self, _spec: &LaunchSpec) -> Result<ProvisionedSandbox, ProvisionError> {
            match &self.public_url {
                Some(url) => Ok(ProvisionedSandbox {
                    public_url: url.clone(),
                    sandbox_id: "sbx-test".to_string(),
                }),
                None => Err(ProvisionError::Backend("no capacity".to_string())),
            }
        }

        async fn is_running(&self, _sandbox_id: &str) -> Result<bool, ProvisionError> {
            Ok(true)
        }
    }

    async fn worker_convert(headers: HeaderMap, mut multipart: Multipart) -> Response {
        if headers.get(CREDENTIAL_HEADER).is_none() {
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        let mut options = None;
        while let Some(field) = multipart.next_field().await.unwrap() {
            if field.name() == Some("options") {
                options = Some(field.text().await.unwrap());
            }
        }
        match options {
            Some(_) => ([(CONTENT_TYPE, "image/png")], PNG).into_response(),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "convert failed: no options").into_response(),
        }
    }

    async fn spawn_worker() -> String {
        let app = Router::new().route("/convert", post(worker_convert));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn app_with(store: &MemoryStore, public_url: Option<String>) -> Router {
        let config = BrokerConfig {
            lock: LockOptions {
                ttl: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
                max_wait: Duration::from_millis(100),
            },
            ..BrokerConfig::default()
        };
        let broker = SandboxBroker::new(
            Arc::new(store.clone()),
            Arc::new(StaticBackend { public_url }),
            Arc::new(AlwaysAlive),
            config,
        );
        build_router(AppState::new(broker, SandboxRelay::default()), 1024 * 1024)
    }

    fn convert_request(file: Option<&[u8]>, options: Option<&str>) -> Request<Body> {
        let mut body = Vec::new();
        if let Some(bytes) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"in.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(options) = options {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"options\"\r\n\r\n{options}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/convert")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_check_responds() {
        let app = app_with(&MemoryStore::new(), None);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test_timeout::tokio_timeout_test]
    async fn converts_and_passes_bytes_through() {
        let url = spawn_worker().await;
        let app = app_with(&MemoryStore::new(), Some(url));

        let response = app
            .oneshot(convert_request(Some(b"raw-image"), Some("-resize 50%")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "inline; filename=converted.png"
        );
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), PNG);
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_file_is_bad_request() {
        let app = app_with(&MemoryStore::new(), None);
        let response = app
            .oneshot(convert_request(None, Some("-resize 50%")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["message"], "file is required");
    }

    #[test_timeout::tokio_timeout_test]
    async fn worker_failure_maps_to_bad_gateway_with_text() {
        let url = spawn_worker().await;
        let app = app_with(&MemoryStore::new(), Some(url));

        // Blank options are dropped before relaying.
        let response = app
            .oneshot(convert_request(Some(b"raw-image"), Some("   ")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["error"], "convert_failed");
        assert_eq!(body["message"], "convert failed: no options");
    }

    #[test_timeout::tokio_timeout_test]
    async fn provisioning_failure_maps_to_bad_gateway() {
        let app = app_with(&MemoryStore::new(), None);
        let response = app
            .oneshot(convert_request(Some(b"raw-image"), Some("-resize 50%")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"], "sandbox_unavailable");
    }

    #[test_timeout::tokio_timeout_test]
    async fn lock_timeout_maps_to_service_unavailable() {
        let store = MemoryStore::new();
        let lock = DistributedLock::new(Arc::new(store.clone()));
        let _held = lock
            .try_acquire("refresh", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let app = app_with(&store, Some("http://127.0.0.1:9".to_string()));
        let response = app
            .oneshot(convert_request(Some(b"raw-image"), Some("-resize 50%")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], RETRY_AFTER_SECS);
        assert_eq!(json_body(response).await["error"], "sandbox_busy");
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_upload_is_client_error() {
        let response =
            ApiError::Relay(RelayError::InvalidUpload("content type \"nope\"".to_string()))
                .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "bad_request");
    }

    #[test_timeout::timeout]
    fn cors_layer_rejects_invalid_origin() {
        assert!(cors_layer("https://convert.example", true).is_ok());
        assert!(cors_layer("bad\norigin", false).is_err());
    }
}
