use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ConfigResult;

/// Raw `rowcast.toml` as parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RowcastConfig {
    #[serde(default)]
    pub offsets: OffsetsSection,
    #[serde(default)]
    pub sources: Vec<SourceSection>,
    /// Bulk detection settings shared by every source.
    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default)]
    pub sinks: Vec<SinkSection>,
}

impl RowcastConfig {
    /// Parse a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: RowcastConfig = toml::from_str(toml_str)?;
        Ok(config)
    }

    pub fn source(&self, name: &str) -> Option<&SourceSection> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Where adapter offsets are persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct OffsetsSection {
    #[serde(default)]
    pub backend: OffsetBackend,
    /// SQLite database file.
    #[serde(default = "default_offsets_path")]
    pub path: String,
    /// Postgres connection string (postgres backend).
    pub connection_string: Option<String>,
}

impl Default for OffsetsSection {
    fn default() -> Self {
        Self {
            backend: OffsetBackend::default(),
            path: default_offsets_path(),
            connection_string: None,
        }
    }
}

fn default_offsets_path() -> String {
    ".rowcast/offsets.db".to_string()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetBackend {
    #[default]
    Sqlite,
    Postgres,
    /// Process-local; offsets are lost on exit.
    Memory,
}

/// One monitored database.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    /// Source id; also the offset store key.
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    pub connection_string: String,
    /// Change-log table to poll, optionally schema-qualified.
    #[serde(default = "default_change_table")]
    pub change_table: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_source_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_true")]
    pub include_before: bool,
    #[serde(default = "default_true")]
    pub include_after: bool,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A change-log table in Postgres.
    #[default]
    Postgres,
}

fn default_change_table() -> String {
    "rowcast_changes".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_source_batch_size() -> usize {
    500
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Bulk operation detection.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_detector_batch_size")]
    pub max_batch_size: usize,
    /// Seconds without a new event before a batch completes.
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: f64,
    /// Background sweep period; defaults to a quarter of the timeout.
    pub sweep_interval_ms: Option<u64>,
    #[serde(default)]
    pub min_row_count: u64,
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    /// e.g. `["BULK_DELETE"]`.
    #[serde(default)]
    pub exclude_operations: Vec<String>,
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: default_detector_batch_size(),
            batch_timeout_secs: default_batch_timeout_secs(),
            sweep_interval_ms: None,
            min_row_count: 0,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            exclude_operations: Vec::new(),
            sample_cap: default_sample_cap(),
        }
    }
}

fn default_detector_batch_size() -> usize {
    1000
}

fn default_batch_timeout_secs() -> f64 {
    5.0
}

fn default_sample_cap() -> usize {
    5
}

/// One downstream consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkSection {
    pub name: String,
    pub kind: SinkKind,
    #[serde(default)]
    pub mode: SinkMode,
    /// Sources this sink receives; empty means all.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Endpoint (webhook).
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub batching: BatchingSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Webhook,
    Stdout,
}

/// What a sink receives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Every raw change event.
    #[default]
    Raw,
    /// Raw events that are not part of a bulk operation, plus bulk summaries.
    BulkAware,
}

fn default_format() -> String {
    "json".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_cap_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for BatchingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
