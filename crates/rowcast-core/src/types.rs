use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opaque row image. Column structure is not modelled here.
pub type Document = serde_json::Value;

/// Well-known metadata keys attached to change events.
pub mod meta {
    /// Row-count hint declared by the source for the statement that produced the event.
    pub const AFFECTED_ROWS: &str = "affected_rows";
    /// Source transaction identifier.
    pub const TRANSACTION_ID: &str = "transaction_id";
    /// Explicit flag marking the event as part of a multi-row statement.
    pub const BULK_OPERATION: &str = "bulk_operation";
    /// Text of the statement, when the source can capture it.
    pub const SQL_STATEMENT: &str = "sql_statement";
    /// Grouping key of a bulk operation.
    pub const BATCH_KEY: &str = "batch_key";
    /// Offset of the first constituent of a bulk operation.
    pub const FIRST_OFFSET: &str = "first_offset";
}

/// The type of row mutation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    /// Accepts full names in any case and the single-letter forms used by log tables.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" | "I" => Ok(Operation::Insert),
            "UPDATE" | "U" => Ok(Operation::Update),
            "DELETE" | "D" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// One captured row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Logical identifier of the originating database or connection.
    pub source: String,
    /// The schema name (e.g., "public").
    pub schema: String,
    /// The table name.
    pub table: String,
    pub operation: Operation,
    /// Resumption token, only meaningful to the adapter that produced it.
    pub offset: String,
    /// Capture time.
    pub timestamp_utc: DateTime<Utc>,
    /// Prior row image (absent for inserts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    /// New row image (absent for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Document>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ChangeEvent {
    /// Create an event captured now, with no row images or metadata.
    pub fn new(
        source: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        operation: Operation,
        offset: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            schema: schema.into(),
            table: table.into(),
            operation,
            offset: offset.into(),
            timestamp_utc: Utc::now(),
            before: None,
            after: None,
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

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp_utc = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get the most relevant row image: `after` for inserts/updates, `before` for deletes.
    pub fn row(&self) -> Option<&Document> {
        match self.operation {
            Operation::Insert | Operation::Update => self.after.as_ref().or(self.before.as_ref()),
            Operation::Delete => self.before.as_ref().or(self.after.as_ref()),
        }
    }

    /// The source transaction id, if the adapter recorded one.
    pub fn transaction_id(&self) -> Option<&str> {
        self.metadata
            .get(meta::TRANSACTION_ID)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The declared row-count hint, if present and numeric.
    pub fn affected_rows_hint(&self) -> Option<u64> {
        self.metadata
            .get(meta::AFFECTED_ROWS)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the source explicitly flagged this event as part of a bulk statement.
    pub fn is_flagged_bulk(&self) -> bool {
        self.metadata
            .get(meta::BULK_OPERATION)
            .map(|v| {
                let v = v.trim();
                v == "1" || v.eq_ignore_ascii_case("true")
            })
            .unwrap_or(false)
    }

    /// Whether this event belongs to a multi-row statement.
    pub fn is_bulk_operation(&self) -> bool {
        self.is_flagged_bulk() || self.affected_rows_hint().map_or(false, |n| n > 1)
    }

    /// A short `schema.table@offset` label for logs.
    pub fn location(&self) -> String {
        format!("{}.{}@{}", self.schema, self.table, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_event(op: Operation) -> ChangeEvent {
        ChangeEvent::new("orders_db", "public", "orders", op, "100")
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("U".parse::<Operation>().unwrap(), Operation::Update);
        assert_eq!(" DELETE ".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("TRUNCATE".parse::<Operation>().is_err());
    }

    #[test]
    fn test_row_prefers_relevant_image() {
        let insert = make_event(Operation::Insert).with_after(json!({"id": 1}));
        assert_eq!(insert.row(), Some(&json!({"id": 1})));

        let delete = make_event(Operation::Delete).with_before(json!({"id": 2}));
        assert_eq!(delete.row(), Some(&json!({"id": 2})));

        let update = make_event(Operation::Update)
            .with_before(json!({"v": 1}))
            .with_after(json!({"v": 2}));
        assert_eq!(update.row(), Some(&json!({"v": 2})));
    }

    #[test]
    fn test_bulk_signals() {
        let plain = make_event(Operation::Update);
        assert!(!plain.is_bulk_operation());

        let single = make_event(Operation::Update).with_metadata(meta::AFFECTED_ROWS, "1");
        assert!(!single.is_bulk_operation());

        let hinted = make_event(Operation::Update).with_metadata(meta::AFFECTED_ROWS, "50");
        assert!(hinted.is_bulk_operation());
        assert_eq!(hinted.affected_rows_hint(), Some(50));

        let flagged = make_event(Operation::Delete).with_metadata(meta::BULK_OPERATION, "TRUE");
        assert!(flagged.is_bulk_operation());

        let garbage = make_event(Operation::Delete).with_metadata(meta::AFFECTED_ROWS, "many");
        assert!(!garbage.is_bulk_operation());
    }

    #[test]
    fn test_transaction_id_ignores_empty() {
        let event = make_event(Operation::Insert).with_metadata(meta::TRANSACTION_ID, "");
        assert_eq!(event.transaction_id(), None);

        let event = make_event(Operation::Insert).with_metadata(meta::TRANSACTION_ID, "tx-9");
        assert_eq!(event.transaction_id(), Some("tx-9"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = make_event(Operation::Insert).with_after(json!({"id": 7}));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["operation"], "INSERT");
        assert_eq!(value["offset"], "100");
        assert!(value.get("before").is_none());
        assert!(value.get("metadata").is_none());
    }
}
