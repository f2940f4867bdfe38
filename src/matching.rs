//! Classification of observed domains against the locked DNA.
//!
//! `MatchEngine` applies three rules in priority order: watched
//! infrastructure, known SSL issuer, then naming patterns. It remembers every
//! domain it has alerted on and never alerts on the same domain twice.

use crate::config::MatchingConfig;
use crate::core::{Alert, CertificateEvent, Confidence, MatchType};
use crate::profile::DnaLock;
use anyhow::{Context, Result};
use chrono::Utc;
use regex::RegexSet;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// A named pattern as written in a YAML pattern file.
#[derive(Debug, Deserialize)]
struct FilePattern {
    name: String,
    pattern: String,
}

/// Multi-pattern matcher for domain names.
#[derive(Debug)]
pub struct PatternSet {
    regex_set: RegexSet,
    /// Name of each pattern in `regex_set`, by index.
    names: Vec<String>,
}

impl PatternSet {
    /// Compiles `(name, regex)` pairs.
    pub fn new(patterns: Vec<(String, String)>) -> Result<Self> {
        let (names, regexes): (Vec<String>, Vec<String>) = patterns.into_iter().unzip();
        let regex_set = RegexSet::new(&regexes).context("Failed to compile domain patterns")?;
        Ok(Self { regex_set, names })
    }

    /// Suffixes, inline regexes and pattern files from the configuration.
    pub fn from_config(config: &MatchingConfig) -> Result<Self> {
        let mut patterns: Vec<(String, String)> = config
            .suffixes
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .map(|suffix| (suffix.clone(), format!("{}$", regex::escape(&suffix))))
            .collect();

        patterns.extend(config.patterns.iter().map(|p| (p.clone(), p.clone())));

        for path in &config.pattern_files {
            patterns.extend(load_pattern_file(path)?);
        }

        Self::new(patterns)
    }

    /// Name of the first pattern matching `domain`.
    pub fn first_match(&self, domain: &str) -> Option<&str> {
        self.regex_set
            .matches(domain)
            .into_iter()
            .next()
            .and_then(|index| self.names.get(index))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Loads `- name: ... pattern: ...` entries from a YAML file.
pub fn load_pattern_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read pattern file: {}", path.display()))?;
    let entries: Vec<FilePattern> = serde_yml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML from pattern file: {}", path.display()))?;
    Ok(entries.into_iter().map(|e| (e.name, e.pattern)).collect())
}

/// True for names that can be classified at all.
pub fn is_classifiable(domain: &str) -> bool {
    !domain.is_empty() && !domain.starts_with("*.")
}

pub struct MatchEngine {
    dna: DnaLock,
    patterns: PatternSet,
    excluded: Vec<String>,
    alerted: HashSet<String>,
}

impl MatchEngine {
    pub fn new(dna: DnaLock, patterns: PatternSet, excluded: Vec<String>) -> Self {
        Self {
            dna,
            patterns,
            excluded: excluded
                .into_iter()
                .map(|e| e.to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            alerted: HashSet::new(),
        }
    }

    pub fn dna(&self) -> &DnaLock {
        &self.dna
    }

    /// A certificate naming any excluded substring is skipped as a whole.
    pub fn is_excluded(&self, event: &CertificateEvent) -> bool {
        event
            .domains
            .iter()
            .any(|domain| self.excluded.iter().any(|e| domain.contains(e.as_str())))
    }

    pub fn already_alerted(&self, domain: &str) -> bool {
        self.alerted.contains(domain)
    }

    pub fn alerted_count(&self) -> usize {
        self.alerted.len()
    }

    /// Picks the address to classify with: a watched one if any, otherwise
    /// the first.
    pub fn pick_address(&self, addresses: &[Ipv4Addr]) -> Option<Ipv4Addr> {
        addresses
            .iter()
            .copied()
            .find(|ip| self.dna.is_watched_ip(*ip) || self.dna.watched_subnet_for(*ip).is_some())
            .or_else(|| addresses.first().copied())
    }

    /// Classifies one domain of `event`.
    ///
    /// Returns `None` without changing state if no rule matches, the name is
    /// a wildcard or empty, or the domain was alerted on before.
    pub fn classify(
        &mut self,
        domain: &str,
        resolved_ip: Option<Ipv4Addr>,
        event: &CertificateEvent,
    ) -> Option<Alert> {
        if !is_classifiable(domain) || self.alerted.contains(domain) {
            return None;
        }

        let (match_type, confidence, matched_on, requires_verification) =
            if let Some(on) = resolved_ip.and_then(|ip| self.infrastructure_match(ip)) {
                (MatchType::IpMatch, Confidence::Critical, on, false)
            } else if let Some(issuer) = self.issuer_match(event) {
                (MatchType::SslIssuerMatch, Confidence::Medium, issuer, false)
            } else if let Some(pattern) = self.patterns.first_match(domain) {
                (MatchType::PatternMatch, Confidence::Medium, pattern.to_string(), true)
            } else {
                return None;
            };

        self.alerted.insert(domain.to_string());
        metrics::counter!("alerts_total", "match_type" => match_type.as_str()).increment(1);
        debug!(domain, %match_type, matched_on, "Domain classified");

        Some(Alert {
            domain: domain.to_string(),
            resolved_ip,
            match_type,
            confidence,
            matched_on,
            requires_verification,
            issuer_org: event.issuer_org.clone(),
            not_before: event.not_before,
            not_after: event.not_after,
            timestamp: Utc::now(),
        })
    }

    fn infrastructure_match(&self, ip: Ipv4Addr) -> Option<String> {
        if self.dna.is_watched_ip(ip) {
            return Some(ip.to_string());
        }
        self.dna.watched_subnet_for(ip).map(|net| net.to_string())
    }

    fn issuer_match(&self, event: &CertificateEvent) -> Option<String> {
        let issuer = event.issuer_org.as_deref()?;
        self.dna
            .profile()
            .ssl_issuers
            .contains(issuer)
            .then(|| issuer.to_string())
    }
}
