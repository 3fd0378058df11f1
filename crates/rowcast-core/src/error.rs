use thiserror::Error;

/// Errors that can occur in rowcast-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("adapter for source '{0}' is already running")]
    AlreadyRunning(String),

    #[error("cannot open source '{source_id}': {message}")]
    SourceUnavailable { source_id: String, message: String },

    #[error("fetch from source '{source_id}' failed: {message}")]
    Fetch { source_id: String, message: String },

    #[error("cannot convert record at offset {offset} from '{source_id}': {message}")]
    Conversion {
        source_id: String,
        offset: String,
        message: String,
    },

    #[error("event handler failed: {0}")]
    Handler(String),

    #[error("offset store error: {0}")]
    OffsetStore(String),

    #[error("invalid offset '{0}'")]
    InvalidOffset(String),

    #[error("publish to '{sink}' failed: {message}")]
    Publish {
        sink: String,
        message: String,
        retryable: bool,
    },

    #[error("publish to '{sink}' failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        sink: String,
        attempts: u32,
        message: String,
    },

    #[error("{failed} of {total} events in batch failed to publish")]
    PartialBatch { failed: usize, total: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("adapter for source '{0}' did not stop within the deadline")]
    StopTimeout(String),

    #[error("cannot decode payload: {0}")]
    Decode(String),
}

impl Error {
    /// Build a retryable publish error for a sink.
    pub fn publish(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Publish {
            sink: sink.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Build a publish error that retrying cannot fix (bad request, encoding failure).
    pub fn publish_permanent(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Publish {
            sink: sink.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Check if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Publish { retryable, .. } => *retryable,
            Error::Fetch { .. } | Error::OffsetStore(_) | Error::Handler(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::publish("hook", "connection reset").is_retryable());
        assert!(!Error::publish_permanent("hook", "400 bad request").is_retryable());
        assert!(!Error::AlreadyRunning("db".into()).is_retryable());

        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(!err.is_retryable());
    }
}
