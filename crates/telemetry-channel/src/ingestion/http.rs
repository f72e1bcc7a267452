// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default HTTP transport posting JSON batches to the ingestion backend.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, error};
use zstd::stream::write::Encoder;

use crate::constants::{DEFAULT_SEND_TIMEOUT, LOGS_PATH};
use crate::ingestion::{classify_status, Ack, Credentials, Ingestion, LogUrl, TransportError};
use crate::log::LogEntry;
use crate::store::Batch;

pub const APP_SECRET_HEADER: &str = "App-Secret";
pub const INSTALL_ID_HEADER: &str = "Install-ID";

#[derive(Serialize)]
struct LogContainer<'a> {
    logs: Vec<&'a LogEntry>,
}

/// [`Ingestion`] over HTTPS with optional zstd compression.
#[derive(Debug, Clone)]
pub struct HttpIngestion {
    client: reqwest::Client,
    timeout: Duration,
    compression_level: Option<i32>,
}

impl Default for HttpIngestion {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT, None)
    }
}

impl HttpIngestion {
    #[must_use]
    pub fn new(timeout: Duration, compression_level: Option<i32>) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                error!(
                    "CHANNEL | Failed to build HTTP client: {}, using reqwest defaults",
                    e
                );
                reqwest::Client::new()
            }
        };
        Self {
            client,
            timeout,
            compression_level,
        }
    }

    /// Uses a preconfigured client (proxy, TLS) instead of building one.
    #[must_use]
    pub fn with_client(client: reqwest::Client, timeout: Duration, compression_level: Option<i32>) -> Self {
        Self {
            client,
            timeout,
            compression_level,
        }
    }

    fn headers(&self, credentials: &Credentials) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        let app_secret = HeaderValue::from_str(&credentials.app_secret).map_err(|_| {
            TransportError::InvalidCredentials("app secret is not a valid header value".to_string())
        })?;
        headers.insert(APP_SECRET_HEADER, app_secret);
        headers.insert(
            INSTALL_ID_HEADER,
            HeaderValue::from_str(&credentials.install_id.to_string()).map_err(|_| {
                TransportError::InvalidCredentials("install id is not a valid header value".to_string())
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        Ok(headers)
    }

    fn body(&self, batch: &Batch) -> Result<Vec<u8>, TransportError> {
        let container = LogContainer {
            logs: batch.entries().collect(),
        };
        let json =
            serde_json::to_vec(&container).map_err(|e| TransportError::Payload(e.to_string()))?;
        match self.compression_level {
            Some(level) => encode(&json, level).map_err(|e| TransportError::Payload(e.to_string())),
            None => Ok(json),
        }
    }
}

fn encode(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl Ingestion for HttpIngestion {
    async fn send(
        &self,
        batch: &Batch,
        credentials: &Credentials,
        url: &LogUrl,
    ) -> Result<Ack, TransportError> {
        let headers = self.headers(credentials)?;
        let body = self.body(batch)?;
        let endpoint = format!("{}{}", url.as_str(), LOGS_PATH);
        debug!(
            "CHANNEL | Sending batch {} of group {} ({} logs, {} bytes) to {}",
            batch.id,
            batch.group,
            batch.len(),
            body.len(),
            endpoint
        );

        let response = self
            .client
            .post(&endpoint)
            .timeout(self.timeout)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if let Err(e) = classify_status(status) {
            // Only read the body when it helps explaining a failure.
            let text = response.text().await.unwrap_or_default();
            debug!(
                "CHANNEL | Batch {} of group {} failed with status {}: {}",
                batch.id, batch.group, status, text
            );
            return Err(e);
        }
        Ok(Ack { status })
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
