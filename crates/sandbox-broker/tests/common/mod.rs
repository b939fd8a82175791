//! In-process stand-ins for the worker sandbox and its provisioning platform.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Multipart, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use sandbox_broker::broker::PASSPHRASE_ENV;
use sandbox_broker::provision::ProvisionedSandbox;
use sandbox_broker::relay::CREDENTIAL_HEADER;
use sandbox_broker::{LaunchSpec, ProvisionError, ProvisioningBackend};

pub const CONVERTED_PNG: &[u8] = b"\x89PNG\r\n\x1a\nconverted-bytes";

/// Mimics the conversion worker: checks the launch-time passphrase and
/// answers `/convert` with fixed PNG bytes.
#[derive(Default)]
pub struct FakeWorker {
    pub expected_passphrase: Mutex<Option<String>>,
    pub last_options: Mutex<Option<String>>,
    pub last_upload: Mutex<Option<(Option<String>, Vec<u8>)>>,
    pub conversions: AtomicUsize,
    pub fail_with: Mutex<Option<String>>,
}

impl FakeWorker {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = self.expected_passphrase.lock().unwrap().clone();
        let received = headers
            .get(CREDENTIAL_HEADER)
            .and_then(|value| value.to_str().ok());
        matches!((expected.as_deref(), received), (Some(e), Some(r)) if e == r)
    }

    /// Simulates the worker being replaced out from under the cache.
    pub fn restart_with(&self, passphrase: &str) {
        *self.expected_passphrase.lock().unwrap() = Some(passphrase.to_string());
    }
}

async fn root(State(worker): State<Arc<FakeWorker>>, headers: HeaderMap) -> Response {
    if !worker.authorized(&headers) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    "Hello from the sandbox".into_response()
}

async fn convert(
    State(worker): State<Arc<FakeWorker>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if !worker.authorized(&headers) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let mut upload = None;
    let mut options = None;
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field.content_type().map(str::to_string);
                upload = Some((content_type, field.bytes().await.unwrap().to_vec()));
            }
            "options" => options = Some(field.text().await.unwrap()),
            _ => {}
        }
    }
    let Some(upload) = upload else {
        return (StatusCode::BAD_REQUEST, "No file provided").into_response();
    };
    *worker.last_upload.lock().unwrap() = Some(upload);
    *worker.last_options.lock().unwrap() = options;
    worker.conversions.fetch_add(1, Ordering::SeqCst);

    if let Some(message) = worker.fail_with.lock().unwrap().clone() {
        return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
    }
    ([(CONTENT_TYPE, "image/png")], CONVERTED_PNG).into_response()
}

/// Serves `worker` on an ephemeral local port and returns its base URL.
pub async fn spawn_worker(worker: Arc<FakeWorker>) -> String {
    let app = Router::new()
        .route("/", get(root))
        .route("/convert", post(convert))
        .with_state(worker);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// "Provisions" by handing the worker its new passphrase.
pub struct WorkerBackend {
    pub worker: Arc<FakeWorker>,
    pub public_url: String,
    pub created: AtomicUsize,
    pub delay: Duration,
}

impl WorkerBackend {
    pub fn new(worker: Arc<FakeWorker>, public_url: String) -> Self {
        Self {
            worker,
            public_url,
            created: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisioningBackend for WorkerBackend {
    async fn create(&self, spec: &LaunchSpec) -> Result<ProvisionedSandbox, ProvisionError> {
        tokio::time::sleep(self.delay).await;
        let passphrase = spec
            .env
            .get(PASSPHRASE_ENV)
            .cloned()
            .ok_or_else(|| ProvisionError::Backend("missing passphrase".into()))?;
        self.worker.restart_with(&passphrase);
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProvisionedSandbox {
            public_url: self.public_url.clone(),
            sandbox_id: format!("sbx-{n}"),
        })
    }

    async fn is_running(&self, _sandbox_id: &str) -> Result<bool, ProvisionError> {
        Ok(true)
    }
}
