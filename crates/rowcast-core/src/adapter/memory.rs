use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::ChangeSource;
use crate::error::{Error, Result};
use crate::types::{ChangeEvent, Document, Operation};

/// A raw change record held by a [`MemorySource`].
///
/// The operation is kept as a string so tests can feed malformed records.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub sequence: u64,
    pub schema: String,
    pub table: String,
    pub operation: String,
    pub before: Option<Document>,
    pub after: Option<Document>,
    pub captured_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl MemoryRecord {
    pub fn new(
        sequence: u64,
        schema: impl Into<String>,
        table: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            schema: schema.into(),
            table: table.into(),
            operation: operation.into(),
            before: None,
            after: None,
            captured_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_before(mut self, before: Document) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Document) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Default)]
struct Log {
    records: Vec<MemoryRecord>,
    open: bool,
    fail_open: bool,
    failing_fetches: u32,
    fetches: u64,
}

/// An in-process change log. Offsets are decimal sequence numbers.
///
/// Clones share the same log, so a test can keep appending while an adapter
/// owns another handle.
#[derive(Clone, Default)]
pub struct MemorySource {
    log: Arc<Mutex<Log>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a record. Records are served in sequence order regardless of push order.
    pub fn push(&self, record: MemoryRecord) {
        let mut log = self.log();
        log.records.push(record);
        log.records.sort_by_key(|r| r.sequence);
    }

    /// Append a record with the next sequence number and return it.
    pub fn append(&self, schema: &str, table: &str, operation: &str) -> u64 {
        let sequence = self.next_sequence();
        self.push(MemoryRecord::new(sequence, schema, table, operation));
        sequence
    }

    pub fn next_sequence(&self) -> u64 {
        self.log().records.last().map_or(1, |r| r.sequence + 1)
    }

    /// Make every `open` fail until cleared with [`MemorySource::recover`].
    pub fn fail_open(&self) {
        self.log().fail_open = true;
    }

    /// Fail the next `count` fetches.
    pub fn fail_next_fetches(&self, count: u32) {
        self.log().failing_fetches = count;
    }

    pub fn recover(&self) {
        let mut log = self.log();
        log.fail_open = false;
        log.failing_fetches = 0;
    }

    pub fn is_open(&self) -> bool {
        self.log().open
    }

    /// Number of fetch calls, including failed ones.
    pub fn fetch_count(&self) -> u64 {
        self.log().fetches
    }

    pub fn len(&self) -> usize {
        self.log().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn do_open(&self) -> Result<()> {
        let mut log = self.log();
        if log.fail_open {
            return Err(Error::SourceUnavailable {
                source_id: "memory".into(),
                message: "simulated connection failure".into(),
            });
        }
        log.open = true;
        Ok(())
    }

    fn do_fetch(&self, after: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let after = match after {
            Some(token) => token
                .parse::<u64>()
                .map_err(|_| Error::InvalidOffset(token.to_string()))?,
            None => 0,
        };

        let mut log = self.log();
        log.fetches += 1;
        if !log.open {
            return Err(Error::Fetch {
                source_id: "memory".into(),
                message: "source is not open".into(),
            });
        }
        if log.failing_fetches > 0 {
            log.failing_fetches -= 1;
            return Err(Error::Fetch {
                source_id: "memory".into(),
                message: "simulated fetch failure".into(),
            });
        }

        Ok(log
            .records
            .iter()
            .filter(|r| r.sequence > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl ChangeSource for MemorySource {
    type Record = MemoryRecord;

    fn open(&mut self) -> impl Future<Output = Result<()>> + Send {
        let result = self.do_open();
        async move { result }
    }

    fn fetch_after(
        &mut self,
        after: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<MemoryRecord>>> + Send {
        let result = self.do_fetch(after, limit);
        async move { result }
    }

    fn record_offset(&self, record: &MemoryRecord) -> String {
        record.sequence.to_string()
    }

    fn convert(&self, record: MemoryRecord, source_id: &str) -> Result<ChangeEvent> {
        let offset = record.sequence.to_string();
        let operation: Operation =
            record
                .operation
                .parse()
                .map_err(|message| Error::Conversion {
                    source_id: source_id.to_string(),
                    offset: offset.clone(),
                    message,
                })?;

        Ok(ChangeEvent {
            source: source_id.to_string(),
            schema: record.schema,
            table: record.table,
            operation,
            offset,
            timestamp_utc: record.captured_at,
            before: record.before,
            after: record.after,
            metadata: record.metadata,
        })
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        self.log().open = false;
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_after_respects_offset_and_limit() {
        let mut source = MemorySource::new();
        for _ in 0..5 {
            source.append("public", "t", "INSERT");
        }
        source.open().await.unwrap();

        let all = source.fetch_after(None, 10).await.unwrap();
        assert_eq!(all.len(), 5);

        let page = source.fetch_after(Some("2"), 2).await.unwrap();
        let sequences: Vec<u64> = page.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [3, 4]);

        assert!(matches!(
            source.fetch_after(Some("abc"), 2).await,
            Err(Error::InvalidOffset(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_requires_open() {
        let mut source = MemorySource::new();
        assert!(source.fetch_after(None, 1).await.is_err());

        source.open().await.unwrap();
        source.open().await.unwrap();
        assert!(source.fetch_after(None, 1).await.is_ok());

        source.close().await.unwrap();
        assert!(!source.is_open());
    }

    #[test]
    fn test_convert_rejects_unknown_operation() {
        let source = MemorySource::new();
        let record = MemoryRecord::new(7, "public", "t", "MERGE");
        let err = source.convert(record, "db").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref offset, .. } if offset == "7"));
    }
}
