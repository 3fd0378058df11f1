use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rowcast_config::{validate_config, RowcastConfig};

/// Read, expand, and validate a config file.
pub fn load_config(path: &Path) -> Result<RowcastConfig> {
    let content = fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\nRun 'rowcast init' to create one.",
            path.display()
        )
    })?;

    let mut config = RowcastConfig::parse(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    resolve_config_env(&mut config);
    validate_config(&config).with_context(|| format!("Invalid config: {}", path.display()))?;

    Ok(config)
}

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables become empty.
pub fn resolve_env(s: &str) -> String {
    let mut result = s.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
        } else {
            break;
        }
    }

    result
}

/// Expand `${VAR}` in every field that may carry a secret or an endpoint.
fn resolve_config_env(config: &mut RowcastConfig) {
    config.offsets.path = resolve_env(&config.offsets.path);
    if let Some(conn) = &mut config.offsets.connection_string {
        *conn = resolve_env(conn);
    }

    for source in &mut config.sources {
        source.connection_string = resolve_env(&source.connection_string);
    }

    for sink in &mut config.sinks {
        if let Some(url) = &mut sink.url {
            *url = resolve_env(url);
        }
        for value in sink.headers.values_mut() {
            *value = resolve_env(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_resolve_env() {
        std::env::set_var("ROWCAST_TEST_VAR", "hello");

        assert_eq!(resolve_env("${ROWCAST_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env("prefix_${ROWCAST_TEST_VAR}_suffix"),
            "prefix_hello_suffix"
        );
        assert_eq!(resolve_env("no_vars"), "no_vars");
        assert_eq!(resolve_env("unterminated ${ROWCAST_TEST_VAR"), "unterminated ${ROWCAST_TEST_VAR");

        std::env::remove_var("ROWCAST_TEST_VAR");
    }

    #[test]
    #[serial]
    fn test_load_config_expands_secrets() {
        std::env::set_var("ROWCAST_TEST_DB", "postgres://app@db/orders");
        std::env::set_var("ROWCAST_TEST_TOKEN", "s3cret");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rowcast.toml");
        fs::write(
            &path,
            r#"
[[sources]]
name = "orders_db"
connection_string = "${ROWCAST_TEST_DB}"

[[sinks]]
name = "hook"
kind = "webhook"
url = "https://example.com/hook"

[sinks.headers]
Authorization = "Bearer ${ROWCAST_TEST_TOKEN}"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(
            config.sources[0].connection_string,
            "postgres://app@db/orders"
        );
        assert_eq!(config.sinks[0].headers["Authorization"], "Bearer s3cret");

        std::env::remove_var("ROWCAST_TEST_DB");
        std::env::remove_var("ROWCAST_TEST_TOKEN");
    }

    #[test]
    #[serial]
    fn test_unset_connection_string_fails_validation() {
        std::env::remove_var("ROWCAST_TEST_UNSET");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rowcast.toml");
        fs::write(
            &path,
            r#"
[[sources]]
name = "orders_db"
connection_string = "${ROWCAST_TEST_UNSET}"
"#,
        )
        .unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
