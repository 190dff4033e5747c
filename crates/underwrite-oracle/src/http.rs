//! HTTP extraction backend.
//!
//! Talks to an extraction service exposing one endpoint per method plus an
//! OCR pre-pass:
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `POST /v1/ocr` | Rasterize and OCR a blob, returning a text-bearing PDF |
//! | `POST /v1/extract/structural` | Page-level structural parsing (docling) |
//! | `POST /v1/extract/span` | Span extraction with character offsets (langextract) |
//! | `GET /health` | Liveness |
//!
//! Blobs travel base64-encoded inside JSON bodies.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use underwrite_core::defaults;
use underwrite_core::{
    ExtractionMethod, ExtractionOracle, FileType, OcrMode, OracleError, OracleOutput, Result,
};

pub struct HttpOracle {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct BlobPayload<'a> {
    mime_type: &'a str,
    content_b64: String,
}

#[derive(Deserialize)]
struct OcrResponse {
    mime_type: String,
    content_b64: String,
}

impl HttpOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(defaults::ORACLE_TIMEOUT_SECS),
        }
    }

    /// Create from `ORACLE_URL` (default [`defaults::ORACLE_URL`]) and
    /// `ORACLE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("ORACLE_URL").unwrap_or_else(|_| defaults::ORACLE_URL.to_string());
        let timeout = std::env::var("ORACLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::ORACLE_TIMEOUT_SECS));
        Self::new(base_url).with_timeout(timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(method: ExtractionMethod) -> &'static str {
        match method {
            ExtractionMethod::Structural => "/v1/extract/structural",
            ExtractionMethod::Span => "/v1/extract/span",
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> OracleError {
        if e.is_timeout() {
            OracleError::Timeout(self.timeout)
        } else {
            OracleError::ModelUnavailable(format!("request failed: {}", e))
        }
    }

    async fn map_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, OracleError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{}: {}", status, body.trim());
        match status {
            StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(OracleError::UnsupportedFormat(detail))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(OracleError::ModelUnavailable(format!("upstream timeout {}", detail)))
            }
            _ => Err(OracleError::ModelUnavailable(detail)),
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        payload: &BlobPayload<'_>,
    ) -> std::result::Result<T, OracleError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let response = Self::map_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| OracleError::ModelUnavailable(format!("invalid response from {}: {}", path, e)))
    }

    /// Run the OCR pre-pass, returning the OCR'd blob and its type.
    async fn ocr(
        &self,
        blob: &[u8],
        file_type: FileType,
    ) -> std::result::Result<(Vec<u8>, FileType), OracleError> {
        let payload = BlobPayload {
            mime_type: file_type.mime_type(),
            content_b64: base64::engine::general_purpose::STANDARD.encode(blob),
        };
        let response: OcrResponse = self.post("/v1/ocr", &payload).await?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(response.content_b64.as_bytes())
            .map_err(|e| OracleError::ModelUnavailable(format!("OCR returned invalid base64: {}", e)))?;
        let ocr_type = FileType::parse(&response.mime_type).map_err(|e| {
            OracleError::ModelUnavailable(format!("OCR returned unexpected type: {}", e))
        })?;
        debug!(
            subsystem = "oracle",
            component = "http",
            input_bytes = blob.len(),
            output_bytes = data.len(),
            "OCR pre-pass complete"
        );
        Ok((data, ocr_type))
    }
}

#[async_trait]
impl ExtractionOracle for HttpOracle {
    async fn extract(
        &self,
        blob: &[u8],
        file_type: FileType,
        method: ExtractionMethod,
        ocr: OcrMode,
    ) -> std::result::Result<OracleOutput, OracleError> {
        let ocr_output;
        let (data, data_type) = if ocr == OcrMode::Force {
            ocr_output = self.ocr(blob, file_type).await?;
            (ocr_output.0.as_slice(), ocr_output.1)
        } else {
            (blob, file_type)
        };

        let payload = BlobPayload {
            mime_type: data_type.mime_type(),
            content_b64: base64::engine::general_purpose::STANDARD.encode(data),
        };
        let output: OracleOutput = self.post(Self::endpoint(method), &payload).await?;

        if !output.pages_failed.is_empty() {
            warn!(
                subsystem = "oracle",
                component = "http",
                method = %method,
                pages_failed = ?output.pages_failed,
                "Oracle reported partial extraction"
            );
        }
        Ok(output)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
