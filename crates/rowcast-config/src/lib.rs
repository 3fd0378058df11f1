mod config;
mod error;
mod validation;

pub use config::{
    BatchingSection, DetectorSection, OffsetBackend, OffsetsSection, RetrySection, RowcastConfig,
    SinkKind, SinkMode, SinkSection, SourceKind, SourceSection,
};
pub use error::{ConfigError, ConfigResult};
pub use validation::{
    adapter_config, detector_config, retry_policy, sink_format, sinks_for_source, validate_config,
};
