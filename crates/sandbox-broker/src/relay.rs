use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::broker::ConnectionRecord;

/// Header carrying the per-worker passphrase.
pub const CREDENTIAL_HEADER: &str = "x-app-header";
pub const CONVERT_PATH: &str = "/convert";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request to sandbox failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid credential header value")]
    InvalidCredential(#[from] reqwest::header::InvalidHeaderValue),
    /// The upload itself is malformed; nothing was sent.
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
}

/// A worker answered with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sandbox returned {status}: {message}")]
pub struct RelayFailure {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Debug, Default)]
pub enum RelayBody {
    #[default]
    Empty,
    Raw(Bytes),
    /// Serialized by the relay, which also sets `content-type`.
    Json(serde_json::Value),
    /// Encoded by the relay as `multipart/form-data`.
    Form(Form),
}

#[derive(Debug)]
pub struct RelayRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

impl RelayRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: RelayBody::Empty,
        }
    }

    pub fn with_body(mut self, body: RelayBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// The worker's answer, untouched.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RelayResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Turns a non-success answer into a [`RelayFailure`] carrying the
    /// worker's text; success passes through.
    pub fn error_for_status(self) -> Result<RelayResponse, RelayFailure> {
        if self.is_success() {
            return Ok(self);
        }
        let text = String::from_utf8_lossy(&self.body).trim().to_string();
        Err(RelayFailure {
            status: self.status,
            message: if text.is_empty() {
                "convert failed".to_string()
            } else {
                text
            },
        })
    }
}

/// A file to hand to the worker's convert endpoint.
#[derive(Debug, Clone)]
pub struct ConvertUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Clone, Default)]
pub struct SandboxRelay {
    http: Client,
}

impl SandboxRelay {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Sends `request` to `connection.public_url + path` with the credential
    /// header set, and returns the response as received. Non-success
    /// statuses are not retried.
    pub async fn forward(
        &self,
        connection: &ConnectionRecord,
        path: &str,
        request: RelayRequest,
    ) -> Result<RelayResponse, RelayError> {
        let url = format!("{}{}", connection.public_url.trim_end_matches('/'), path);
        let mut headers = request.headers;
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.insert(CREDENTIAL_HEADER, HeaderValue::from_str(&connection.pass_phrase)?);

        let builder = self.http.request(request.method, url.as_str());
        let builder = match request.body {
            RelayBody::Empty => builder.headers(headers),
            RelayBody::Raw(bytes) => builder.headers(headers).body(bytes),
            RelayBody::Json(value) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                builder.headers(headers).body(serde_json::to_vec(&value)?)
            }
            RelayBody::Form(form) => {
                // reqwest supplies the boundary-bearing content type.
                headers.remove(CONTENT_TYPE);
                builder.headers(headers).multipart(form)
            }
        };

        let res = builder.send().await?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.bytes().await?;
        debug!(%url, %status, bytes = body.len(), "sandbox responded");

        Ok(RelayResponse {
            status,
            headers,
            body,
        })
    }

    /// Posts `upload` and an optional option string to [`CONVERT_PATH`].
    pub async fn convert(
        &self,
        connection: &ConnectionRecord,
        upload: ConvertUpload,
        options: Option<&str>,
    ) -> Result<RelayResponse, RelayError> {
        let form = convert_form(upload, options)?;
        let request = RelayRequest::new(Method::POST).with_body(RelayBody::Form(form));
        self.forward(connection, CONVERT_PATH, request).await
    }
}

fn convert_form(upload: ConvertUpload, options: Option<&str>) -> Result<Form, RelayError> {
    let mut part = Part::bytes(upload.bytes.to_vec()).file_name(upload.file_name);
    if let Some(content_type) = upload.content_type.as_deref() {
        part = part.mime_str(content_type).map_err(|err| {
            RelayError::InvalidUpload(format!("content type {content_type:?}: {err}"))
        })?;
    }
    let mut form = Form::new().part("file", part);
    if let Some(options) = options.map(str::trim).filter(|o| !o.is_empty()) {
        form = form.text("options", options.to_string());
    }
    Ok(form)
}
