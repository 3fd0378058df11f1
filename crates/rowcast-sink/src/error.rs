use thiserror::Error;

/// Errors from sink transports.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (429)")]
    RateLimited,

    #[error("http error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),
}

impl SinkError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkError::Network(_)
                | SinkError::RateLimited
                | SinkError::Io(_)
                | SinkError::Http {
                    status: 408 | 500..=599,
                    ..
                }
        )
    }

    /// Convert into a publish error attributed to `sink`.
    pub fn into_publish(self, sink: &str) -> rowcast_core::Error {
        if self.is_retryable() {
            rowcast_core::Error::publish(sink, self.to_string())
        } else {
            rowcast_core::Error::publish_permanent(sink, self.to_string())
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SinkError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => SinkError::Network(e.to_string()),
        }
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let http = |status| SinkError::Http {
            status,
            message: String::new(),
        };

        assert!(http(500).is_retryable());
        assert!(http(503).is_retryable());
        assert!(http(408).is_retryable());
        assert!(SinkError::RateLimited.is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(404).is_retryable());
        assert!(!SinkError::Serialization("bad".into()).is_retryable());
    }

    #[test]
    fn test_into_publish_keeps_classification() {
        let err = SinkError::Http {
            status: 422,
            message: "unprocessable".into(),
        }
        .into_publish("hook");
        assert!(!err.is_retryable());

        let err = SinkError::Network("reset".into()).into_publish("hook");
        assert!(err.is_retryable());
    }
}
