use std::fmt;
use std::str::FromStr;

use crate::error::PgError;

/// A validated, optionally schema-qualified table name.
///
/// Only plain identifiers are accepted, so the name can be interpolated into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    /// The name quoted for use in a statement, e.g. `"audit"."changes"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.table),
            None => format!("\"{}\"", self.table),
        }
    }
}

impl FromStr for TableName {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let (schema, table) = match parts.as_slice() {
            [table] => (None, *table),
            [schema, table] => (Some(*schema), *table),
            _ => return Err(PgError::InvalidIdentifier(s.to_string())),
        };

        if !schema.map_or(true, is_identifier) || !is_identifier(table) {
            return Err(PgError::InvalidIdentifier(s.to_string()));
        }

        Ok(Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.table),
            None => f.write_str(&self.table),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        let name: TableName = "rowcast_changes".parse().unwrap();
        assert_eq!(name.schema, None);
        assert_eq!(name.quoted(), "\"rowcast_changes\"");

        let name: TableName = "audit._Changes2".parse().unwrap();
        assert_eq!(name.schema.as_deref(), Some("audit"));
        assert_eq!(name.quoted(), "\"audit\".\"_Changes2\"");
        assert_eq!(name.to_string(), "audit._Changes2");
    }

    #[test]
    fn test_invalid_names() {
        for bad in [
            "",
            "1changes",
            "changes; DROP TABLE users",
            "a.b.c",
            "audit.",
            "\"quoted\"",
            "chänges",
        ] {
            assert!(
                bad.parse::<TableName>().is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }
}
