// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transport recording every batch it is asked to send

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telemetry_channel::{Ack, Batch, Credentials, Ingestion, LogId, LogUrl, TransportError};

/// One call to [`MockIngestion::send`].
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub group: String,
    pub log_ids: Vec<LogId>,
    pub payloads: Vec<serde_json::Value>,
    pub attempt: u32,
    pub app_secret: String,
    pub url: String,
}

/// Replays scripted results in order, then acknowledges everything.
pub struct MockIngestion {
    script: Mutex<VecDeque<Result<Ack, TransportError>>>,
    sent: Mutex<Vec<SentBatch>>,
    delay: Duration,
    timeout: Duration,
}

impl MockIngestion {
    pub fn ok() -> Arc<Self> {
        Self::scripted(vec![])
    }

    pub fn scripted(script: Vec<Result<Ack, TransportError>>) -> Arc<Self> {
        Self::build(script, Duration::ZERO, Duration::from_secs(30))
    }

    /// Every send takes `delay` before answering.
    pub fn slow(delay: Duration, timeout: Duration) -> Arc<Self> {
        Self::build(vec![], delay, timeout)
    }

    fn build(
        script: Vec<Result<Ack, TransportError>>,
        delay: Duration,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
            delay,
            timeout,
        })
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        self.sent.lock().unwrap().clone()
    }

    /// Ids of every log sent, in send order, retries included.
    pub fn sent_log_ids(&self) -> Vec<LogId> {
        self.sent()
            .into_iter()
            .flat_map(|batch| batch.log_ids)
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Ingestion for MockIngestion {
    async fn send(
        &self,
        batch: &Batch,
        credentials: &Credentials,
        url: &LogUrl,
    ) -> Result<Ack, TransportError> {
        self.sent.lock().unwrap().push(SentBatch {
            group: batch.group.clone(),
            log_ids: batch.log_ids(),
            payloads: batch.entries().map(|entry| entry.payload.clone()).collect(),
            attempt: batch.attempt,
            app_secret: credentials.app_secret.clone(),
            url: url.as_str().to_string(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or(Ok(Ack { status: 200 }))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
