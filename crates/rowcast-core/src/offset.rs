//! Durable resumption state, keyed by source.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Storage for per-source offsets.
///
/// `set_offset` must be durable before its future resolves: a crash right after
/// it returns may re-deliver handled events on restart, but never skips unhandled ones.
pub trait OffsetStore: Send + Sync {
    /// Get the last stored offset for a source.
    fn get_offset(&self, source: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Store the offset of the last handed-off event for a source.
    fn set_offset(&self, source: &str, offset: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<T: OffsetStore> OffsetStore for Arc<T> {
    fn get_offset(&self, source: &str) -> impl Future<Output = Result<Option<String>>> + Send {
        (**self).get_offset(source)
    }

    fn set_offset(&self, source: &str, offset: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).set_offset(source, offset)
    }
}

/// A stored offset as listed by operator tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRecord {
    pub source: String,
    pub offset: String,
    /// Time of the last write, as rendered by the backing store.
    pub updated_at: String,
}

/// A process-local offset store, for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct MemoryOffsetStore {
    offsets: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an offset without going through the async trait.
    pub fn snapshot(&self, source: &str) -> Option<String> {
        self.offsets
            .read()
            .ok()
            .and_then(|offsets| offsets.get(source).cloned())
    }

    fn read(&self, source: &str) -> Result<Option<String>> {
        let offsets = self
            .offsets
            .read()
            .map_err(|_| Error::OffsetStore("offset map lock poisoned".into()))?;
        Ok(offsets.get(source).cloned())
    }

    fn write(&self, source: &str, offset: &str) -> Result<()> {
        let mut offsets = self
            .offsets
            .write()
            .map_err(|_| Error::OffsetStore("offset map lock poisoned".into()))?;
        offsets.insert(source.to_string(), offset.to_string());
        Ok(())
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn get_offset(&self, source: &str) -> impl Future<Output = Result<Option<String>>> + Send {
        let result = self.read(source);
        async move { result }
    }

    fn set_offset(&self, source: &str, offset: &str) -> impl Future<Output = Result<()>> + Send {
        let result = self.write(source, offset);
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offsets_are_per_source() {
        let store = MemoryOffsetStore::new();
        assert_eq!(store.get_offset("a").await.unwrap(), None);

        store.set_offset("a", "10").await.unwrap();
        store.set_offset("b", "99").await.unwrap();
        store.set_offset("a", "11").await.unwrap();

        assert_eq!(store.get_offset("a").await.unwrap().as_deref(), Some("11"));
        assert_eq!(store.get_offset("b").await.unwrap().as_deref(), Some("99"));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interfere() {
        let store = MemoryOffsetStore::new();

        let mut handles = Vec::new();
        for source in ["s1", "s2", "s3", "s4"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50u32 {
                    store.set_offset(source, &i.to_string()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for source in ["s1", "s2", "s3", "s4"] {
            assert_eq!(store.snapshot(source).as_deref(), Some("49"));
        }
    }

    #[tokio::test]
    async fn test_repeated_writes_keep_one_entry_per_source() {
        let store = MemoryOffsetStore::new();
        for i in 0..10_000u32 {
            store.set_offset("orders_db", &i.to_string()).await.unwrap();
        }

        assert_eq!(store.offsets.read().unwrap().len(), 1);
        assert_eq!(store.snapshot("orders_db").as_deref(), Some("9999"));
    }
}
