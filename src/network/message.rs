//! Decoding of certstream JSON frames.

use crate::core::CertificateEvent;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use thiserror::Error;

/// A frame that could not be turned into a stream message.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed certstream frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A classified inbound frame.
#[derive(Debug, PartialEq)]
pub enum StreamMessage {
    Heartbeat,
    Certificate(CertificateEvent),
    /// A well-formed frame of a type this client does not act on.
    Other,
}

/// Parses a raw certstream frame.
///
/// # Returns
/// * `Ok(StreamMessage)` for any frame carrying a `message_type`
/// * `Err(ProtocolError)` if the JSON is malformed or a certificate frame
///   does not have the expected structure
pub fn decode_message(text: &str) -> Result<StreamMessage, ProtocolError> {
    let frame: RawFrame = serde_json::from_str(text)?;
    Ok(match frame {
        RawFrame::Heartbeat => StreamMessage::Heartbeat,
        RawFrame::CertificateUpdate { data } => StreamMessage::Certificate(data.into_event()),
        RawFrame::Other => StreamMessage::Other,
    })
}

/// Normalizes a certificate name: trimmed, lower-cased, no trailing dot.
pub fn normalize_domain(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

// --- Deserialization-only structs ---

#[derive(Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum RawFrame {
    Heartbeat,
    CertificateUpdate { data: RawData },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawData {
    leaf_cert: RawLeafCert,
    #[serde(default)]
    cert_index: Option<u64>,
}

#[derive(Deserialize, Default)]
struct RawLeafCert {
    #[serde(default)]
    subject: Option<RawName>,
    #[serde(default)]
    extensions: Option<RawExtensions>,
    #[serde(default)]
    all_domains: Vec<String>,
    #[serde(default)]
    issuer: Option<RawName>,
    #[serde(default)]
    not_before: Option<f64>,
    #[serde(default)]
    not_after: Option<f64>,
}

#[derive(Deserialize, Default)]
struct RawName {
    #[serde(rename = "CN", default)]
    common_name: Option<String>,
    #[serde(rename = "O", default)]
    organization: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawExtensions {
    #[serde(rename = "subjectAltName", default)]
    subject_alt_name: Option<SubjectAltName>,
}

/// Certstream has shipped SANs both as a list and as OpenSSL's text form.
#[derive(Deserialize)]
#[serde(untagged)]
enum SubjectAltName {
    List(Vec<String>),
    Text(String),
}

impl SubjectAltName {
    fn names(self) -> Vec<String> {
        match self {
            SubjectAltName::List(names) => names,
            SubjectAltName::Text(text) => text
                .split(',')
                .filter_map(|entry| entry.trim().strip_prefix("DNS:"))
                .map(str::to_string)
                .collect(),
        }
    }
}

impl RawData {
    fn into_event(self) -> CertificateEvent {
        let leaf = self.leaf_cert;
        let mut domains = BTreeSet::new();

        let common_name = leaf.subject.and_then(|s| s.common_name);
        let san = leaf
            .extensions
            .and_then(|e| e.subject_alt_name)
            .map(SubjectAltName::names)
            .unwrap_or_default();

        for name in common_name.into_iter().chain(san).chain(leaf.all_domains) {
            let name = normalize_domain(&name);
            if !name.is_empty() {
                domains.insert(name);
            }
        }

        CertificateEvent {
            domains,
            issuer_org: leaf
                .issuer
                .and_then(|i| i.organization)
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty()),
            not_before: leaf.not_before.and_then(unix_to_datetime),
            not_after: leaf.not_after.and_then(unix_to_datetime),
            cert_index: self.cert_index,
        }
    }
}

fn unix_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let secs = ts.trunc() as i64;
    let nanos = ((ts.fract()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}
