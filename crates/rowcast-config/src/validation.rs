use std::collections::HashSet;
use std::time::Duration;

use rowcast_core::{
    default_sweep_interval, AdapterConfig, BulkDetectorConfig, BulkFilter, BulkOperationType,
    CaptureOptions, Format, RetryPolicy,
};

use crate::config::{
    DetectorSection, OffsetBackend, RetrySection, RowcastConfig, SinkKind, SinkSection,
    SourceSection,
};
use crate::error::{ConfigError, ConfigResult};

/// Validate a parsed config.
pub fn validate_config(config: &RowcastConfig) -> ConfigResult<()> {
    validate_offsets(config)?;
    validate_sources(&config.sources)?;
    validate_detector(&config.detector)?;
    validate_sinks(config)?;
    Ok(())
}

fn validate_offsets(config: &RowcastConfig) -> ConfigResult<()> {
    match config.offsets.backend {
        OffsetBackend::Sqlite if config.offsets.path.trim().is_empty() => {
            Err(ConfigError::MissingField {
                field: "offsets.path".to_string(),
            })
        }
        OffsetBackend::Postgres
            if config
                .offsets
                .connection_string
                .as_deref()
                .map_or(true, |s| s.trim().is_empty()) =>
        {
            Err(ConfigError::MissingField {
                field: "offsets.connection_string".to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn validate_sources(sources: &[SourceSection]) -> ConfigResult<()> {
    if sources.is_empty() {
        return Err(ConfigError::NoSources);
    }

    let mut seen = HashSet::new();
    for source in sources {
        validate_name("source", &source.name)?;
        if !seen.insert(source.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                kind: "source",
                name: source.name.clone(),
            });
        }

        let field = |name: &str| format!("sources.{}.{name}", source.name);
        if source.connection_string.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: field("connection_string"),
            });
        }
        if source.change_table.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: field("change_table"),
            });
        }
        if source.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(field("poll_interval_ms"), "must be positive"));
        }
        if source.max_batch_size == 0 {
            return Err(ConfigError::invalid(field("max_batch_size"), "must be positive"));
        }
    }
    Ok(())
}

fn validate_detector(detector: &DetectorSection) -> ConfigResult<()> {
    if detector.max_batch_size == 0 {
        return Err(ConfigError::invalid("detector.max_batch_size", "must be positive"));
    }
    batch_timeout(detector.batch_timeout_secs)?;
    if detector.sweep_interval_ms == Some(0) {
        return Err(ConfigError::invalid("detector.sweep_interval_ms", "must be positive"));
    }
    parse_operations(&detector.exclude_operations)?;
    Ok(())
}

fn batch_timeout(secs: f64) -> ConfigResult<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) if !timeout.is_zero() => Ok(timeout),
        _ => Err(ConfigError::invalid(
            "detector.batch_timeout_secs",
            "must be a positive number of seconds within range",
        )),
    }
}

fn validate_sinks(config: &RowcastConfig) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for sink in &config.sinks {
        validate_name("sink", &sink.name)?;
        if !seen.insert(sink.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                kind: "sink",
                name: sink.name.clone(),
            });
        }

        for source_name in &sink.sources {
            if config.source(source_name).is_none() {
                return Err(ConfigError::UnknownSource {
                    sink: sink.name.clone(),
                    source_name: source_name.clone(),
                });
            }
        }

        sink_format(sink)?;
        validate_retry(&sink.name, &sink.retry)?;

        if sink.kind == SinkKind::Webhook {
            validate_webhook(sink)?;
        }
    }
    Ok(())
}

fn validate_webhook(sink: &SinkSection) -> ConfigResult<()> {
    let field = |name: &str| format!("sinks.{}.{name}", sink.name);
    let url = sink.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(ConfigError::MissingField { field: field("url") });
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::invalid(
            field("url"),
            format!("'{url}' must start with http:// or https://"),
        ));
    }
    if sink.timeout_secs == 0 {
        return Err(ConfigError::invalid(field("timeout_secs"), "must be positive"));
    }
    if sink.batching.enabled && sink.batching.max_payload_bytes == 0 {
        return Err(ConfigError::invalid(
            field("batching.max_payload_bytes"),
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_retry(sink: &str, retry: &RetrySection) -> ConfigResult<()> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::invalid(
            format!("sinks.{sink}.retry.max_attempts"),
            "must be at least 1",
        ));
    }
    if !(retry.backoff_base.is_finite() && retry.backoff_base >= 1.0) {
        return Err(ConfigError::invalid(
            format!("sinks.{sink}.retry.backoff_base"),
            "must be at least 1.0",
        ));
    }
    Ok(())
}

/// Names end up in logs, offset keys and event `source` fields.
fn validate_name(kind: &str, name: &str) -> ConfigResult<()> {
    if name.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: format!("{kind}.name"),
        });
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid(
            format!("{kind}.name"),
            format!("'{name}' must not contain whitespace"),
        ));
    }
    Ok(())
}

fn parse_operations(names: &[String]) -> ConfigResult<Vec<BulkOperationType>> {
    names
        .iter()
        .map(|name| {
            name.parse()
                .map_err(|message: String| ConfigError::invalid("detector.exclude_operations", message))
        })
        .collect()
}

/// Adapter settings for one source.
pub fn adapter_config(source: &SourceSection) -> AdapterConfig {
    let mut config = AdapterConfig::new(&source.name)
        .with_poll_interval(Duration::from_millis(source.poll_interval_ms))
        .with_max_batch_size(source.max_batch_size)
        .with_capture(CaptureOptions {
            include_before: source.include_before,
            include_after: source.include_after,
        });
    config.stop_timeout = Duration::from_secs(source.stop_timeout_secs);
    config
}

/// Detector settings, or `None` when detection is disabled.
pub fn detector_config(detector: &DetectorSection) -> ConfigResult<Option<BulkDetectorConfig>> {
    if !detector.enabled {
        return Ok(None);
    }

    let batch_timeout = batch_timeout(detector.batch_timeout_secs)?;
    let sweep_interval = detector
        .sweep_interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| default_sweep_interval(batch_timeout));

    Ok(Some(BulkDetectorConfig {
        enabled: true,
        max_batch_size: detector.max_batch_size,
        batch_timeout,
        sweep_interval,
        sample_cap: detector.sample_cap,
        filter: BulkFilter {
            min_row_count: detector.min_row_count,
            include_tables: detector.include_tables.clone(),
            exclude_tables: detector.exclude_tables.clone(),
            exclude_operations: parse_operations(&detector.exclude_operations)?,
        },
    }))
}

pub fn retry_policy(retry: &RetrySection) -> RetryPolicy {
    RetryPolicy::new(
        retry.max_attempts,
        retry.backoff_base,
        Duration::from_secs(retry.backoff_cap_secs),
    )
}

pub fn sink_format(sink: &SinkSection) -> ConfigResult<Format> {
    Format::from_name(&sink.format).ok_or_else(|| ConfigError::InvalidFormat {
        value: sink.format.clone(),
    })
}

/// Sinks that receive events from `source`, in declaration order.
pub fn sinks_for_source<'a>(
    config: &'a RowcastConfig,
    source: &'a str,
) -> impl Iterator<Item = &'a SinkSection> + 'a {
    config
        .sinks
        .iter()
        .filter(move |sink| sink.sources.is_empty() || sink.sources.iter().any(|s| s == source))
}
