use std::future::Future;
use std::io::{self, Write};
use std::sync::Mutex;

use rowcast_core::{
    with_retry, ChangePublisher, EventSerializer, Format, JsonLinesSerializer, PipelineEvent,
    Result, RetryPolicy,
};

use crate::error::SinkError;

/// Writes one serialized event per line to stdout (or any writer).
pub struct StdoutPublisher {
    name: String,
    format: Format,
    retry: RetryPolicy,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StdoutPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_writer(name, io::stdout())
    }

    pub fn with_writer(name: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Self {
            name: name.into(),
            format: Format::JsonLines(JsonLinesSerializer),
            retry: RetryPolicy::default(),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    fn encode(&self, event: &PipelineEvent) -> std::result::Result<Vec<u8>, SinkError> {
        let mut line = self
            .format
            .serialize(event)
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        Ok(line)
    }

    fn write_line(&self, line: &[u8]) -> std::result::Result<(), SinkError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Io(io::Error::other("stdout writer lock poisoned")))?;
        writer.write_all(line)?;
        writer.flush()?;
        Ok(())
    }
}

impl ChangePublisher for StdoutPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let name = self.name.as_str();
            let line = self.encode(event).map_err(|e| e.into_publish(name))?;
            with_retry(&self.retry, name, |_| {
                let result = self.write_line(&line).map_err(|e| e.into_publish(name));
                async move { result }
            })
            .await
        }
    }
}
