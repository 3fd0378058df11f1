//! Wire encodings for pipeline events.

use crate::bulk::PipelineEvent;
use crate::error::{Error, Result};

/// Encodes events for a transport.
pub trait EventSerializer: Send + Sync {
    /// MIME type of the encoded payload.
    fn content_type(&self) -> &'static str;

    fn serialize(&self, event: &PipelineEvent) -> Result<Vec<u8>>;

    /// Encode several events as one payload.
    fn serialize_batch(&self, events: &[PipelineEvent]) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<PipelineEvent>;
}

/// JSON objects; batches are JSON arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    pub pretty: bool,
}

impl JsonSerializer {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl EventSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, event: &PipelineEvent) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(event)?
        } else {
            serde_json::to_vec(event)?
        };
        Ok(bytes)
    }

    fn serialize_batch(&self, events: &[PipelineEvent]) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(events)?
        } else {
            serde_json::to_vec(events)?
        };
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<PipelineEvent> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One compact JSON object per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSerializer;

impl EventSerializer for JsonLinesSerializer {
    fn content_type(&self) -> &'static str {
        "application/x-ndjson"
    }

    fn serialize(&self, event: &PipelineEvent) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(event)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn serialize_batch(&self, events: &[PipelineEvent]) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for event in events {
            serde_json::to_writer(&mut bytes, event)?;
            bytes.push(b'\n');
        }
        Ok(bytes)
    }

    /// Reads the first non-empty line.
    fn deserialize(&self, bytes: &[u8]) -> Result<PipelineEvent> {
        let line = bytes
            .split(|b| *b == b'\n')
            .find(|line| !line.iter().all(u8::is_ascii_whitespace))
            .ok_or_else(|| Error::Decode("empty JSON lines payload".into()))?;
        Ok(serde_json::from_slice(line)?)
    }
}

/// Selects a serializer by format name.
#[derive(Debug, Clone, Copy)]
pub enum Format {
    Json(JsonSerializer),
    JsonLines(JsonLinesSerializer),
}

impl Default for Format {
    fn default() -> Self {
        Format::Json(JsonSerializer::default())
    }
}

impl Format {
    /// Parse `json`, `json_pretty` or `jsonl`/`ndjson`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json(JsonSerializer::default())),
            "json_pretty" => Some(Format::Json(JsonSerializer::pretty())),
            "jsonl" | "ndjson" | "json_lines" => Some(Format::JsonLines(JsonLinesSerializer)),
            _ => None,
        }
    }
}

impl EventSerializer for Format {
    fn content_type(&self) -> &'static str {
        match self {
            Format::Json(s) => s.content_type(),
            Format::JsonLines(s) => s.content_type(),
        }
    }

    fn serialize(&self, event: &PipelineEvent) -> Result<Vec<u8>> {
        match self {
            Format::Json(s) => s.serialize(event),
            Format::JsonLines(s) => s.serialize(event),
        }
    }

    fn serialize_batch(&self, events: &[PipelineEvent]) -> Result<Vec<u8>> {
        match self {
            Format::Json(s) => s.serialize_batch(events),
            Format::JsonLines(s) => s.serialize_batch(events),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<PipelineEvent> {
        match self {
            Format::Json(s) => s.deserialize(bytes),
            Format::JsonLines(s) => s.deserialize(bytes),
        }
    }
}
