use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rowcast_core::{
    publish_individually, with_retry, BatchReport, ChangePublisher, EventSerializer, Format,
    PipelineEvent, Result, RetryPolicy,
};
use tracing::{debug, warn};

use crate::error::{SinkError, SinkResult};

/// Native batching settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Upper bound on one request body. A single event larger than this is sent alone.
    pub max_payload_bytes: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub batching: BatchingConfig,
    pub format: Format,
}

impl WebhookConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: Vec::new(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            batching: BatchingConfig::default(),
            format: Format::default(),
        }
    }
}

/// POSTs events to an HTTP endpoint.
///
/// Single events are sent as one serialized object. With batching enabled,
/// `publish_batch` packs events into as few requests as the payload limit allows.
pub struct WebhookPublisher {
    config: WebhookConfig,
    client: Client,
}

impl WebhookPublisher {
    pub fn new(config: WebhookConfig) -> SinkResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SinkError::InvalidConfig(format!("header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SinkError::InvalidConfig(format!("header '{name}' value: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SinkError::InvalidConfig(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    async fn post(&self, body: Vec<u8>) -> SinkResult<()> {
        let response = self
            .client
            .post(&self.config.url)
            .header(CONTENT_TYPE, self.config.format.content_type())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SinkError::RateLimited);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(SinkError::Http {
            status: status.as_u16(),
            message,
        })
    }

    /// Post one payload under the retry policy.
    async fn send(&self, body: Vec<u8>) -> Result<()> {
        let name = self.config.name.as_str();
        with_retry(&self.config.retry, name, |_| {
            let body = body.clone();
            async move { self.post(body).await.map_err(|e| e.into_publish(name)) }
        })
        .await
    }

    async fn publish_chunked(&self, events: &[PipelineEvent]) -> BatchReport {
        let mut report = BatchReport::new(events.len());
        let name = self.config.name.as_str();

        // Measure each event; events that cannot be encoded fail on their own.
        let mut sizes = Vec::with_capacity(events.len());
        for (index, event) in events.iter().enumerate() {
            match self.config.format.serialize(event) {
                Ok(bytes) => sizes.push(Some(bytes.len())),
                Err(e) => {
                    report.fail(
                        index,
                        event.offset(),
                        SinkError::Serialization(e.to_string()).into_publish(name),
                    );
                    sizes.push(None);
                }
            }
        }

        let max_bytes = self.config.batching.max_payload_bytes;
        // The plan is an estimate; a chunk whose real body is too large is halved.
        let mut pending: Vec<Range<usize>> =
            plan_chunks(&sizes, max_bytes).into_iter().rev().collect();
        while let Some(range) = pending.pop() {
            let chunk: Vec<PipelineEvent> = range.clone().map(|i| events[i].clone()).collect();
            let result = match self.config.format.serialize_batch(&chunk) {
                Ok(body) if body.len() > max_bytes && range.len() > 1 => {
                    let mid = range.start + range.len() / 2;
                    debug!(
                        sink = name,
                        events = range.len(),
                        bytes = body.len(),
                        "Splitting oversized batch"
                    );
                    pending.push(mid..range.end);
                    pending.push(range.start..mid);
                    continue;
                }
                Ok(body) => {
                    debug!(sink = name, events = chunk.len(), bytes = body.len(), "Posting batch");
                    self.send(body).await
                }
                Err(e) => Err(SinkError::Serialization(e.to_string()).into_publish(name)),
            };

            if let Err(e) = result {
                warn!(
                    sink = name,
                    first_offset = events[range.start].offset(),
                    events = range.len(),
                    error = %e,
                    "Batch publish failed"
                );
                let message = e.to_string();
                for index in range {
                    report.fail(
                        index,
                        events[index].offset(),
                        rowcast_core::Error::publish(name, message.clone()),
                    );
                }
            }
        }
        report
    }
}

/// Split events into consecutive chunks whose estimated payload fits `max_bytes`.
///
/// The estimate assumes compact framing; callers still check the encoded body.
/// Each event costs its encoded size plus one separator byte, on top of two
/// bytes of framing per chunk. `None` marks an event to leave out; it also ends
/// the current chunk so chunks never span a gap.
pub fn plan_chunks(sizes: &[Option<usize>], max_bytes: usize) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start: Option<usize> = None;
    let mut used = 2usize;

    for (index, size) in sizes.iter().enumerate() {
        let Some(size) = size else {
            if let Some(s) = start.take() {
                chunks.push(s..index);
            }
            used = 2;
            continue;
        };
        let cost = size + 1;

        if let Some(s) = start {
            if used + cost <= max_bytes {
                used += cost;
                continue;
            }
            chunks.push(s..index);
        }
        start = Some(index);
        used = 2 + cost;
    }

    if let Some(s) = start {
        chunks.push(s..sizes.len());
    }
    chunks
}

impl ChangePublisher for WebhookPublisher {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let body = self.config.format.serialize(event).map_err(|e| {
                SinkError::Serialization(e.to_string()).into_publish(&self.config.name)
            })?;
            self.send(body).await
        }
    }

    fn publish_batch(&self, events: &[PipelineEvent]) -> impl Future<Output = BatchReport> + Send {
        async move {
            if self.config.batching.enabled {
                self.publish_chunked(events).await
            } else {
                publish_individually(self, events).await
            }
        }
    }
}
