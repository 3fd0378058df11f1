//! Reads captured changes from a Postgres change-log table.
//!
//! The table is populated by something else (usually row triggers) and must
//! expose these columns:
//!
//! | column          | type          |
//! |-----------------|---------------|
//! | `change_id`     | `bigint`, increasing in capture order |
//! | `schema_name`   | `text`        |
//! | `table_name`    | `text`        |
//! | `operation`     | `text` (`INSERT`/`UPDATE`/`DELETE` or `I`/`U`/`D`) |
//! | `before_image`  | `jsonb` null  |
//! | `after_image`   | `jsonb` null  |
//! | `transaction_id`| any, null     |
//! | `metadata`      | `jsonb` object, null |
//! | `captured_at`   | `timestamptz` |

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use rowcast_core::{meta, ChangeEvent, ChangeSource, Document, Operation};
use serde_json::Value;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Row};
use tracing::{debug, info, warn};

use crate::connect::{connect_postgres, Reconnecting, Slot};
use crate::error::{PgError, PgResult};
use crate::ident::TableName;

/// One row of the change-log table.
///
/// Only `change_id` must decode; other columns are kept loose so a bad row is
/// rejected at conversion and skipped instead of stalling the fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub change_id: i64,
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    pub operation: Option<String>,
    pub before_image: Option<Value>,
    pub after_image: Option<Value>,
    pub transaction_id: Option<String>,
    pub metadata: Option<Value>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(Self {
            change_id: row.try_get(0)?,
            schema_name: loose(row, 1),
            table_name: loose(row, 2),
            operation: loose(row, 3),
            before_image: loose(row, 4),
            after_image: loose(row, 5),
            transaction_id: loose(row, 6),
            metadata: loose(row, 7),
            captured_at: loose(row, 8),
        })
    }

    /// Convert into a change event. Fails with a message when a required column is missing
    /// or malformed.
    pub fn into_event(self, source_id: &str) -> Result<ChangeEvent, String> {
        let schema = self.schema_name.ok_or("schema_name is null")?;
        let table = self.table_name.ok_or("table_name is null")?;
        let operation: Operation = self.operation.ok_or("operation is null")?.parse()?;

        let mut metadata = match self.metadata {
            None | Some(Value::Null) => HashMap::new(),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, value)
                })
                .collect(),
            Some(_) => return Err("metadata is not a JSON object".into()),
        };
        if let Some(tx) = self.transaction_id.filter(|tx| !tx.is_empty()) {
            metadata.insert(meta::TRANSACTION_ID.to_string(), tx);
        }

        Ok(ChangeEvent {
            source: source_id.to_string(),
            schema,
            table,
            operation,
            offset: self.change_id.to_string(),
            timestamp_utc: self.captured_at.unwrap_or_else(Utc::now),
            before: non_null(self.before_image),
            after: non_null(self.after_image),
            metadata,
        })
    }
}

/// Read a nullable column, treating decode failures as null.
fn loose<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    decoded_or_null(row.try_get::<_, Option<T>>(idx), idx)
}

fn decoded_or_null<T, E: std::fmt::Display>(
    value: Result<Option<T>, E>,
    column: usize,
) -> Option<T> {
    match value {
        Ok(value) => value,
        Err(e) => {
            warn!(column, error = %e, "Undecodable change-log column read as null");
            None
        }
    }
}

fn non_null(image: Option<Value>) -> Option<Document> {
    image.filter(|v| !v.is_null())
}

/// Parse an offset token into a change id. `None` means from the beginning.
fn parse_offset(after: Option<&str>) -> PgResult<i64> {
    match after {
        None => Ok(i64::MIN),
        Some(token) => token
            .trim()
            .parse()
            .map_err(|_| PgError::InvalidOffset(token.to_string())),
    }
}

/// A [`ChangeSource`] over a Postgres change-log table.
///
/// Offsets are `change_id` values rendered as decimal text. A dropped
/// connection is re-established on the next fetch.
pub struct PgChangeSource {
    change_table: TableName,
    query: String,
    conn: Reconnecting<Client>,
}

impl PgChangeSource {
    pub fn new(connection_string: impl Into<String>, change_table: &str) -> PgResult<Self> {
        let change_table: TableName = change_table.parse()?;
        let query = format!(
            "SELECT change_id, schema_name, table_name, operation, before_image, after_image, \
             transaction_id::text, metadata, captured_at \
             FROM {} WHERE change_id > $1 ORDER BY change_id LIMIT $2",
            change_table.quoted()
        );
        Ok(Self {
            change_table,
            query,
            conn: Reconnecting::lazy(connection_string),
        })
    }

    pub fn change_table(&self) -> &TableName {
        &self.change_table
    }

    async fn connect(&mut self) -> PgResult<&Client> {
        let slot = self.conn.check();
        if slot != Slot::Live {
            if slot == Slot::Lost {
                warn!(table = %self.change_table, "Postgres connection lost; reconnecting");
            }
            let client = connect_postgres(self.conn.target()?).await?;
            info!(table = %self.change_table, "Connected to change-log table");
            self.conn.install(client);
        }
        self.conn.get()
    }

    async fn fetch(&mut self, after: Option<&str>, limit: usize) -> PgResult<Vec<ChangeRecord>> {
        let after = parse_offset(after)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let query = self.query.clone();

        let client = self.connect().await?;
        let rows = client.query(query.as_str(), &[&after, &limit]).await?;
        debug!(after, rows = rows.len(), "Fetched change-log rows");

        rows.iter().map(ChangeRecord::from_row).collect()
    }
}

impl ChangeSource for PgChangeSource {
    type Record = ChangeRecord;

    fn open(&mut self) -> impl Future<Output = rowcast_core::Result<()>> + Send {
        async move {
            let table = self.change_table.to_string();
            let query = self.query.clone();
            let client = self
                .connect()
                .await
                .map_err(|e| unavailable(&table, e))?;

            // Fail fast if the table or its columns are missing.
            client
                .prepare(query.as_str())
                .await
                .map_err(|e| unavailable(&table, e.into()))?;
            Ok(())
        }
    }

    fn fetch_after(
        &mut self,
        after: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = rowcast_core::Result<Vec<ChangeRecord>>> + Send {
        async move {
            let table = self.change_table.to_string();
            self.fetch(after, limit).await.map_err(|e| match e {
                PgError::InvalidOffset(token) => rowcast_core::Error::InvalidOffset(token),
                other => rowcast_core::Error::Fetch {
                    source_id: table,
                    message: other.to_string(),
                },
            })
        }
    }

    fn record_offset(&self, record: &ChangeRecord) -> String {
        record.change_id.to_string()
    }

    fn convert(&self, record: ChangeRecord, source_id: &str) -> rowcast_core::Result<ChangeEvent> {
        let offset = record.change_id.to_string();
        record
            .into_event(source_id)
            .map_err(|message| rowcast_core::Error::Conversion {
                source_id: source_id.to_string(),
                offset,
                message,
            })
    }

    fn close(&mut self) -> impl Future<Output = rowcast_core::Result<()>> + Send {
        // Dropping the client ends the spawned connection task.
        if self.conn.close() {
            debug!(table = %self.change_table, "Closed change-log connection");
        }
        async { Ok(()) }
    }
}

fn unavailable(table: &str, e: PgError) -> rowcast_core::Error {
    rowcast_core::Error::SourceUnavailable {
        source_id: table.to_string(),
        message: e.to_string(),
    }
}
