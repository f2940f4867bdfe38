//! Core domain types and service traits for CabalWatch
//!
//! This module defines the fundamental data structures and trait contracts
//! that govern component interactions throughout the application.

use crate::dns::DnsError;
use crate::verification::VerificationReport;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

/// A single certificate observed on the stream, reduced to what matching needs.
///
/// One event is created per `certificate_update` frame and dropped once the
/// observer has processed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CertificateEvent {
    /// Union of subject CN, SAN entries and `all_domains`, normalized and deduplicated.
    pub domains: BTreeSet<String>,
    /// Organization (`O`) of the issuing CA, if present.
    pub issuer_org: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Position of the entry in its CT log, when the stream provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_index: Option<u64>,
}

/// The rule that produced an alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    /// The domain resolves into watched hosting infrastructure.
    IpMatch,
    /// The certificate was issued by a CA seen on reference sites.
    SslIssuerMatch,
    /// The domain name matches a naming heuristic.
    PatternMatch,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::IpMatch => "IP_MATCH",
            MatchType::SslIssuerMatch => "SSL_ISSUER_MATCH",
            MatchType::PatternMatch => "PATTERN_MATCH",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much an alert can be trusted without further checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Critical,
    Medium,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Critical => f.write_str("CRITICAL"),
            Confidence::Medium => f.write_str("MEDIUM"),
        }
    }
}

/// Represents a detection of a suspected cabal site
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    /// The detected domain name
    pub domain: String,
    /// First IPv4 address the domain resolved to, if resolution succeeded
    pub resolved_ip: Option<Ipv4Addr>,
    pub match_type: MatchType,
    pub confidence: Confidence,
    /// What exactly matched: the watched IP or subnet, the issuer, or the pattern
    pub matched_on: String,
    /// Set when the alert must not be treated as confirmed until a human or
    /// the deep-DNA verification has looked at it.
    pub requires_verification: bool,
    pub issuer_org: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// When the alert was generated
    pub timestamp: DateTime<Utc>,
}

/// Everything handed to the outputs. Each detection produces one `Alert`
/// and, if verification is enabled, one later `Verification`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Alert(Alert),
    Verification(VerificationReport),
}

impl Notification {
    /// The domain this notification is about.
    pub fn domain(&self) -> &str {
        match self {
            Notification::Alert(alert) => &alert.domain,
            Notification::Verification(report) => &report.domain,
        }
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Resolves hostnames to IPv4 addresses
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// Resolves a hostname to its A records
    ///
    /// # Returns
    /// * `Ok(Vec<Ipv4Addr>)` with at least one address on success
    /// * `Err` for NXDOMAIN, timeouts, server errors, or an empty answer
    async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
}

/// Receives every certificate decoded from the stream.
///
/// There is exactly one observer per stream connection. The connection awaits
/// each call before reading the next frame, so events arrive strictly in
/// stream order.
#[async_trait]
pub trait DomainsObserver: Send {
    async fn on_domains_observed(&mut self, event: CertificateEvent);
}

/// Sends notifications to output destinations
#[async_trait]
pub trait Output: Send + Sync {
    /// A unique, descriptive name for the output (e.g., "stdout", "slack").
    /// Used for logging and metrics.
    fn name(&self) -> &str;

    /// Sends a notification to the configured output destination
    ///
    /// # Returns
    /// * `Ok(())` if the notification was successfully sent
    /// * `Err` if sending failed (network error, formatting error, etc.)
    async fn send(&self, notification: &Notification) -> Result<()>;
}
