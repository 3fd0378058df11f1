use std::fmt;

use crate::bulk::{BulkOperationEvent, BulkOperationType};

/// Publication rules applied to finalized bulk operations.
///
/// Table patterns match either the bare table name or `schema.table`.
/// An empty include list admits every table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkFilter {
    /// Bulk operations with fewer constituent rows are not published.
    pub min_row_count: u64,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub exclude_operations: Vec<BulkOperationType>,
}

/// Why a bulk operation was held back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    BelowMinRows { count: u64, min: u64 },
    TableNotIncluded,
    TableExcluded,
    OperationExcluded(BulkOperationType),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::BelowMinRows { count, min } => {
                write!(f, "{count} rows is below the minimum of {min}")
            }
            Rejection::TableNotIncluded => f.write_str("table is not in the include list"),
            Rejection::TableExcluded => f.write_str("table is excluded"),
            Rejection::OperationExcluded(op) => write!(f, "operation {op} is excluded"),
        }
    }
}

impl BulkFilter {
    /// Check an event against every rule. Returns the first rule it breaks.
    pub fn evaluate(&self, event: &BulkOperationEvent) -> Option<Rejection> {
        if event.affected_row_count < self.min_row_count {
            return Some(Rejection::BelowMinRows {
                count: event.affected_row_count,
                min: self.min_row_count,
            });
        }

        if !self.include_tables.is_empty()
            && !matches_any(&self.include_tables, &event.schema, &event.table)
        {
            return Some(Rejection::TableNotIncluded);
        }

        if matches_any(&self.exclude_tables, &event.schema, &event.table) {
            return Some(Rejection::TableExcluded);
        }

        if self.exclude_operations.contains(&event.operation_type) {
            return Some(Rejection::OperationExcluded(event.operation_type));
        }

        None
    }

    pub fn allows(&self, event: &BulkOperationEvent) -> bool {
        self.evaluate(event).is_none()
    }
}

fn matches_any(patterns: &[String], schema: &str, table: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.split_once('.') {
        Some((s, t)) => s.eq_ignore_ascii_case(schema) && t.eq_ignore_ascii_case(table),
        None => pattern.eq_ignore_ascii_case(table),
    })
}
