pub mod adapter;
pub mod bulk;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod mock;
pub mod offset;
pub mod publisher;
pub mod retry;
pub mod serializer;
pub mod types;

pub use adapter::{
    AdapterConfig, AdapterState, CaptureOptions, ChangeSource, DatabaseAdapter, EventHandler,
    FnHandler, MemoryRecord, MemorySource, PollingAdapter,
};
pub use bulk::{BulkOperationEvent, BulkOperationType, PipelineEvent};
pub use detector::{
    batch_key, default_sweep_interval, BulkDetectorConfig, BulkOperationDetector, Detection,
    DetectorStats,
};
pub use dispatcher::{BatchForwarder, Dispatcher};
pub use error::{Error, Result};
pub use filter::{BulkFilter, Rejection};
pub use mock::{MockPublisher, RecordingOffsetStore};
pub use offset::{MemoryOffsetStore, OffsetRecord, OffsetStore};
pub use publisher::{publish_individually, BatchFailure, BatchReport, ChangePublisher, Fanout};
pub use retry::{with_retry, RetryPolicy};
pub use serializer::{EventSerializer, Format, JsonLinesSerializer, JsonSerializer};
pub use types::{meta, ChangeEvent, Document, Operation};
