use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{ChangeEvent, Document, Operation};

/// The kind of multi-row statement a bulk operation summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkOperationType {
    BulkInsert,
    BulkUpdate,
    BulkDelete,
}

impl BulkOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperationType::BulkInsert => "BULK_INSERT",
            BulkOperationType::BulkUpdate => "BULK_UPDATE",
            BulkOperationType::BulkDelete => "BULK_DELETE",
        }
    }
}

impl From<Operation> for BulkOperationType {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Insert => BulkOperationType::BulkInsert,
            Operation::Update => BulkOperationType::BulkUpdate,
            Operation::Delete => BulkOperationType::BulkDelete,
        }
    }
}

impl fmt::Display for BulkOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkOperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BULK_INSERT" | "INSERT" => Ok(BulkOperationType::BulkInsert),
            "BULK_UPDATE" | "UPDATE" => Ok(BulkOperationType::BulkUpdate),
            "BULK_DELETE" | "DELETE" => Ok(BulkOperationType::BulkDelete),
            other => Err(format!("unknown bulk operation type: {other}")),
        }
    }
}

/// One logical multi-row operation, summarizing its constituent change events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperationEvent {
    pub source: String,
    pub schema: String,
    pub table: String,
    pub operation_type: BulkOperationType,
    /// Number of constituent events (not the source's row-count hint).
    pub affected_row_count: u64,
    /// Offset of the last constituent; resuming after it never re-sees the constituents.
    pub final_offset: String,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_statement: Option<String>,
    pub execution_duration_ms: u64,
    #[serde(default)]
    pub sample_rows: Vec<Document>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl BulkOperationEvent {
    /// A short `schema.table` label for logs.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// The unit handed to publishers: either a raw change or a bulk summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PipelineEvent {
    Change(ChangeEvent),
    Bulk(BulkOperationEvent),
}

impl PipelineEvent {
    pub fn source(&self) -> &str {
        match self {
            PipelineEvent::Change(e) => &e.source,
            PipelineEvent::Bulk(e) => &e.source,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            PipelineEvent::Change(e) => &e.table,
            PipelineEvent::Bulk(e) => &e.table,
        }
    }

    /// The offset a consumer can resume after once this event is handled.
    pub fn offset(&self) -> &str {
        match self {
            PipelineEvent::Change(e) => &e.offset,
            PipelineEvent::Bulk(e) => &e.final_offset,
        }
    }

    pub fn as_change(&self) -> Option<&ChangeEvent> {
        match self {
            PipelineEvent::Change(e) => Some(e),
            PipelineEvent::Bulk(_) => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&BulkOperationEvent> {
        match self {
            PipelineEvent::Bulk(e) => Some(e),
            PipelineEvent::Change(_) => None,
        }
    }
}

impl From<ChangeEvent> for PipelineEvent {
    fn from(e: ChangeEvent) -> Self {
        PipelineEvent::Change(e)
    }
}

impl From<BulkOperationEvent> for PipelineEvent {
    fn from(e: BulkOperationEvent) -> Self {
        PipelineEvent::Bulk(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_type_from_operation() {
        assert_eq!(
            BulkOperationType::from(Operation::Insert),
            BulkOperationType::BulkInsert
        );
        assert_eq!(
            BulkOperationType::from(Operation::Delete).to_string(),
            "BULK_DELETE"
        );
        assert_eq!(
            "bulk_update".parse::<BulkOperationType>().unwrap(),
            BulkOperationType::BulkUpdate
        );
    }

    #[test]
    fn test_pipeline_event_tagging() {
        let change = ChangeEvent::new("db", "public", "orders", Operation::Insert, "7");
        let value = serde_json::to_value(PipelineEvent::from(change)).unwrap();
        assert_eq!(value["kind"], "change");
        assert_eq!(value["table"], "orders");

        let bulk = BulkOperationEvent {
            source: "db".into(),
            schema: "public".into(),
            table: "orders".into(),
            operation_type: BulkOperationType::BulkInsert,
            affected_row_count: 3,
            final_offset: "102".into(),
            batch_id: "b-1".into(),
            transaction_id: None,
            sql_statement: None,
            execution_duration_ms: 12,
            sample_rows: vec![],
            metadata: HashMap::new(),
        };
        let event = PipelineEvent::from(bulk);
        assert_eq!(event.offset(), "102");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "bulk");
        assert_eq!(value["operation_type"], "BULK_INSERT");
    }
}
