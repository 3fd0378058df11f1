use std::fs;
use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use dialoguer::Confirm;

const CONFIG_TEMPLATE: &str = r#"# rowcast configuration
# ${VAR} values are read from the environment (and .env)

[offsets]
backend = "sqlite"            # sqlite | postgres | memory
path = ".rowcast/offsets.db"
# connection_string = "${DATABASE_URL}"   # postgres backend

[[sources]]
name = "app_db"
connection_string = "${DATABASE_URL}"
change_table = "rowcast_changes"
poll_interval_ms = 1000
max_batch_size = 500
include_before = true
include_after = true

[detector]
enabled = true
max_batch_size = 1000
batch_timeout_secs = 5.0
min_row_count = 0
# include_tables = ["public.orders"]
# exclude_tables = ["public.audit_log"]
# exclude_operations = ["BULK_DELETE"]
sample_cap = 5

[[sinks]]
name = "console"
kind = "stdout"
format = "jsonl"

# [[sinks]]
# name = "events"
# kind = "webhook"
# mode = "bulk_aware"         # raw | bulk_aware
# url = "${WEBHOOK_URL}"
# format = "json"
#
# [sinks.headers]
# Authorization = "Bearer ${WEBHOOK_TOKEN}"
#
# [sinks.retry]
# max_attempts = 3
# backoff_base = 2.0
# backoff_cap_secs = 30
#
# [sinks.batching]
# enabled = false
# max_payload_bytes = 1048576
"#;

const ENV_TEMPLATE: &str = r#"# rowcast environment variables
# Copy this file to .env and fill in your values

# Database holding the change-log table
DATABASE_URL=

# Optional: webhook sink
# WEBHOOK_URL=
# WEBHOOK_TOKEN=
"#;

/// The change-log table every source polls. Rows are written by triggers.
const CHANGE_TABLE_SQL: &str = r#"-- rowcast change-log table
CREATE TABLE IF NOT EXISTS rowcast_changes (
    change_id      BIGSERIAL PRIMARY KEY,
    schema_name    TEXT NOT NULL,
    table_name     TEXT NOT NULL,
    operation      TEXT NOT NULL,
    before_image   JSONB,
    after_image    JSONB,
    transaction_id BIGINT DEFAULT txid_current(),
    metadata       JSONB,
    captured_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE OR REPLACE FUNCTION rowcast_capture() RETURNS trigger AS $$
BEGIN
    INSERT INTO rowcast_changes (schema_name, table_name, operation, before_image, after_image)
    VALUES (
        TG_TABLE_SCHEMA,
        TG_TABLE_NAME,
        TG_OP,
        CASE WHEN TG_OP IN ('UPDATE', 'DELETE') THEN to_jsonb(OLD) END,
        CASE WHEN TG_OP IN ('INSERT', 'UPDATE') THEN to_jsonb(NEW) END
    );
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

-- Attach to each table you want to capture:
-- CREATE TRIGGER orders_rowcast AFTER INSERT OR UPDATE OR DELETE ON orders
--     FOR EACH ROW EXECUTE FUNCTION rowcast_capture();
"#;

pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    println!("Initializing rowcast...\n");

    let write_config = if !config_path.exists() || force {
        true
    } else {
        Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite it?", config_path.display()))
            .default(false)
            .interact()?
    };

    if write_config {
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(config_path, CONFIG_TEMPLATE)?;
        println!("Created {}", config_path.display());
    } else {
        println!("{} left unchanged", config_path.display());
    }

    write_if_missing(Path::new(".env.example"), ENV_TEMPLATE)?;
    write_if_missing(Path::new("rowcast_changes.sql"), CHANGE_TABLE_SQL)?;

    println!("\n{}", "rowcast initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Copy .env.example to .env and fill in DATABASE_URL");
    println!("  2. Apply rowcast_changes.sql and attach the trigger to your tables");
    println!("  3. Run: rowcast validate");
    println!("  4. Run: rowcast run\n");

    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        println!("{} already exists, skipping", path.display());
    } else {
        fs::write(path, content)?;
        println!("Created {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcast_config::{validate_config, RowcastConfig};

    #[test]
    fn test_template_is_valid_config() {
        let rendered = CONFIG_TEMPLATE.replace("${DATABASE_URL}", "postgres://localhost/app");
        let config = RowcastConfig::parse(&rendered).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.sources[0].change_table, "rowcast_changes");
    }
}
