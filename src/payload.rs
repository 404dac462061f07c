//! JSON envelope for a batch of records.
//!
//! Pure transformation: no I/O and no state. The only non-deterministic
//! input is the wall clock used for the envelope timestamp.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::PayloadError;
use crate::metadata::MetadataProvider;
use crate::record::{ErrorInfo, LogRecord};

/// Which optional sections end up in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadFlags {
    pub include_stack_trace: bool,
    pub include_metadata: bool,
}

impl Default for PayloadFlags {
    fn default() -> Self {
        Self {
            include_stack_trace: true,
            include_metadata: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub timestamp: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BatchMetadata>,
    pub logs: Vec<EnvelopeRecord<'a>>,
}

/// Computed once per batch.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub app_version: Option<String>,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeRecord<'a> {
    pub timestamp: String,
    pub level: &'static str,
    pub level_value: u16,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mdc: Option<BTreeMap<String, String>>,
}

fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build the envelope for `records`, preserving their order.
///
/// The diagnostic context is read from `metadata` here, at send time. Keys
/// carried on the record itself take precedence over the ambient snapshot.
pub fn build_envelope<'a>(
    records: &'a [LogRecord],
    flags: PayloadFlags,
    metadata: &dyn MetadataProvider,
) -> Envelope<'a> {
    let batch_metadata = flags.include_metadata.then(|| BatchMetadata {
        app_version: metadata.app_version(),
        device_id: metadata.device_id(),
        session_id: metadata.session_id(),
        hostname: metadata.hostname(),
    });
    let ambient = metadata.context();

    let logs = records
        .iter()
        .map(|record| {
            let mut mdc = ambient.clone();
            mdc.extend(record.context.iter().map(|(k, v)| (k.clone(), v.clone())));

            EnvelopeRecord {
                timestamp: iso8601(&record.timestamp),
                level: record.level.as_str(),
                level_value: record.level.value(),
                message: &record.message,
                logger: record.logger.as_deref(),
                tag: record.tag.as_deref(),
                class: record.class.as_deref(),
                method: record.method.as_deref(),
                line: record.line,
                error: record.error.as_ref(),
                stack_trace: record
                    .stack_trace
                    .as_deref()
                    .filter(|_| flags.include_stack_trace),
                mdc: (!mdc.is_empty()).then_some(mdc),
            }
        })
        .collect::<Vec<_>>();

    Envelope {
        timestamp: iso8601(&Utc::now()),
        count: logs.len(),
        metadata: batch_metadata,
        logs,
    }
}

/// Serialize an envelope into a request body, gzip-compressing it if asked.
pub fn encode(envelope: &Envelope<'_>, compress: bool) -> Result<Vec<u8>, PayloadError> {
    let json = serde_json::to_vec(envelope)?;
    if compress {
        return gzip(&json);
    }
    Ok(json)
}

#[cfg(feature = "gzip")]
fn gzip(bytes: &[u8]) -> Result<Vec<u8>, PayloadError> {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

// Unreachable in practice: configuration rejects compression without the feature.
#[cfg(not(feature = "gzip"))]
fn gzip(bytes: &[u8]) -> Result<Vec<u8>, PayloadError> {
    Ok(bytes.to_vec())
}
