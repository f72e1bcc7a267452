// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport boundary between channel units and the ingestion backend.
//!
//! A unit hands a [`Batch`] to an [`Ingestion`] implementation together with
//! the current [`Credentials`] and [`LogUrl`], and reacts to the returned
//! [`TransportError`] class: retryable errors release the batch for a later
//! attempt, terminal errors drop it.

pub mod http;

use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use uuid::Uuid;

use crate::constants::{DEFAULT_LOG_URL, DEFAULT_SEND_TIMEOUT};
use crate::errors::ConfigError;
use crate::store::Batch;

/// Failure of a single send attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, DNS, or TLS failure.
    #[error("network error: {0}")]
    Network(String),
    #[error("send timed out")]
    Timeout,
    /// Transient backend failure (5xx, 408, 429).
    #[error("transient backend error: status {0}")]
    Server(u16),
    /// The backend rejected the app secret.
    #[error("unauthorized: status {0}")]
    Unauthorized(u16),
    /// The log URL does not point at an ingestion endpoint.
    #[error("ingestion endpoint not found: status {0}")]
    InvalidEndpoint(u16),
    /// The credentials cannot be expressed as request headers.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// The backend refused the batch itself.
    #[error("batch rejected: status {0}")]
    Rejected(u16),
    /// The batch could not be encoded.
    #[error("malformed payload: {0}")]
    Payload(String),
}

impl TransportError {
    /// Whether the batch should be released and attempted again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Timeout | TransportError::Server(_)
        )
    }

    /// Whether the failure means every batch of the unit would fail the same
    /// way until the credentials or the endpoint change.
    #[must_use]
    pub fn invalidates_unit(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized(_)
                | TransportError::InvalidEndpoint(_)
                | TransportError::InvalidCredentials(_)
        )
    }
}

/// Maps an HTTP response status onto the transport error taxonomy.
pub fn classify_status(status: u16) -> Result<Ack, TransportError> {
    match status {
        200..=299 => Ok(Ack { status }),
        401 | 403 => Err(TransportError::Unauthorized(status)),
        404 => Err(TransportError::InvalidEndpoint(status)),
        // Request timeout and throttling clear up on their own.
        408 | 429 => Err(TransportError::Server(status)),
        500..=599 => Err(TransportError::Server(status)),
        _ => Err(TransportError::Rejected(status)),
    }
}

/// Successful acknowledgement of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
}

/// Application credentials attached to every send.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub app_secret: String,
    pub install_id: Uuid,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_secret", &redact(&self.app_secret))
            .field("install_id", &self.install_id)
            .finish()
    }
}

/// Keeps the last four characters of a secret for log correlation.
fn redact(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{visible}")
}

/// Base URL of the ingestion backend (scheme and host, optional port).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogUrl(Url);

impl LogUrl {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &'static str| ConfigError::InvalidLogUrl {
            url: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw.trim()).map_err(|_| invalid("not an absolute url"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }
        if !matches!(url.path(), "" | "/") {
            return Err(invalid("must not contain a path"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("must not contain a query or fragment"));
        }
        Ok(Self(url))
    }

    /// The URL without a trailing slash.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str().trim_end_matches('/')
    }
}

impl Default for LogUrl {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self(
            DEFAULT_LOG_URL_PARSED
                .get_or_init(|| Url::parse(DEFAULT_LOG_URL).expect("default log url is valid"))
                .clone(),
        )
    }
}

static DEFAULT_LOG_URL_PARSED: OnceLock<Url> = OnceLock::new();

impl fmt::Display for LogUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a send: where and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: LogUrl,
    pub credentials: Credentials,
}

/// Endpoint shared between a group and the units using its default
/// transport. Units read a fresh snapshot for every send.
#[derive(Debug, Clone)]
pub(crate) struct SharedEndpoint {
    inner: Arc<RwLock<Endpoint>>,
}

impl SharedEndpoint {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self {
            inner: Arc::new(RwLock::new(endpoint)),
        }
    }

    pub(crate) fn snapshot(&self) -> Endpoint {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `true` when the URL actually changed.
    pub(crate) fn set_url(&self, url: LogUrl) -> bool {
        let mut endpoint = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if endpoint.url == url {
            return false;
        }
        endpoint.url = url;
        true
    }

    /// Returns `true` when the secret actually changed.
    pub(crate) fn set_app_secret(&self, app_secret: String) -> bool {
        let mut endpoint = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if endpoint.credentials.app_secret == app_secret {
            return false;
        }
        endpoint.credentials.app_secret = app_secret;
        true
    }
}

/// Pluggable transport used by channel units to deliver batches.
#[async_trait]
pub trait Ingestion: Send + Sync {
    async fn send(
        &self,
        batch: &Batch,
        credentials: &Credentials,
        url: &LogUrl,
    ) -> Result<Ack, TransportError>;

    /// Upper bound of a single send; exceeding it counts as
    /// [`TransportError::Timeout`].
    fn timeout(&self) -> Duration {
        DEFAULT_SEND_TIMEOUT
    }
}
