//! Structural fingerprints of websites.
//!
//! A `FingerprintExtractor` runs an ordered list of `ExtractionStrategy`
//! tiers and keeps the first fingerprint that succeeds. Every tier feeds the
//! same markup analysis in `parse`, so the shape of a fingerprint does not
//! depend on the tier that produced it.

pub mod local;
pub mod parse;
pub mod remote;
pub mod static_fetch;
pub mod tls;

pub use local::LocalBrowserStrategy;
pub use remote::RemoteBrowserStrategy;
pub use static_fetch::StaticFetchStrategy;
pub use tls::{issuer_org_from_der, IssuerProbe, TlsIssuerProbe};

use crate::config::ExtractionConfig;
use crate::core::DomainResolver;
use async_trait::async_trait;
use reqwest::Url;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// blake3 hash of a document's canonical, text-free structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomHash(blake3::Hash);

impl DomHash {
    pub fn of(canonical: &str) -> Self {
        Self(blake3::hash(canonical.as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Result<Self, blake3::HexError> {
        blake3::Hash::from_hex(hex).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for DomHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomHash({})", self.to_hex())
    }
}

impl fmt::Display for DomHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for DomHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DomHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        DomHash::from_hex(&hex).map_err(de::Error::custom)
    }
}

/// The tier that produced a fingerprint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    StaticParse,
    RemoteBrowser,
    LocalBrowser,
}

impl ExtractionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionTier::StaticParse => "static_parse",
            ExtractionTier::RemoteBrowser => "remote_browser",
            ExtractionTier::LocalBrowser => "local_browser",
        }
    }
}

impl fmt::Display for ExtractionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural description of a site. Created once, then only merged into a
/// `Profile`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Fingerprint {
    pub dom_hash: Option<DomHash>,
    /// Declared CSS custom property names, e.g. `--brand-color`.
    pub css_variables: BTreeSet<String>,
    /// Script `src` references in document order, without duplicates.
    pub script_refs: Vec<String>,
    pub template_markers: BTreeSet<String>,
    pub class_names: BTreeSet<String>,
    pub uses_upload_path: bool,
    pub uses_tracking_script: bool,
    /// `None` for a degraded fingerprint.
    pub extracted_via: Option<ExtractionTier>,
}

impl Fingerprint {
    /// The result of an extraction where every tier failed.
    pub fn degraded() -> Self {
        Self::default()
    }

    pub fn is_degraded(&self) -> bool {
        self.extracted_via.is_none()
    }

    /// Hashes of the normalized script references.
    pub fn script_hashes(&self) -> BTreeSet<String> {
        self.script_refs.iter().map(|r| hash_script_ref(r)).collect()
    }
}

/// Hash of a script reference with query string and fragment removed.
pub fn hash_script_ref(reference: &str) -> String {
    let reference = reference.trim();
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    let normalized = reference[..end].to_ascii_lowercase();
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}

/// Adds `https://` to scheme-less input and validates the result.
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let url = Url::parse(&with_scheme).ok()?;
    url.host_str()?;
    Some(url.to_string())
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("{tier} timed out after {after:?}")]
    Timeout {
        tier: ExtractionTier,
        after: Duration,
    },

    #[error("TLS probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("browser process failed: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("document is empty")]
    EmptyDocument,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// One tier of the extraction cascade.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn tier(&self) -> ExtractionTier;

    async fn extract(&self, url: &str) -> Result<Fingerprint, ExtractionError>;
}

/// Where a site lives, as opposed to what it looks like.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct NetworkFacts {
    pub ips: Vec<Ipv4Addr>,
    pub ssl_issuer: Option<String>,
}

/// Runs the extraction cascade and gathers network facts.
pub struct FingerprintExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    resolver: Arc<dyn DomainResolver>,
    issuer_probe: Arc<dyn IssuerProbe>,
}

impl FingerprintExtractor {
    pub fn new(
        strategies: Vec<Box<dyn ExtractionStrategy>>,
        resolver: Arc<dyn DomainResolver>,
        issuer_probe: Arc<dyn IssuerProbe>,
    ) -> Self {
        Self {
            strategies,
            resolver,
            issuer_probe,
        }
    }

    /// Builds the standard cascade: static parse, then the remote and local
    /// browsers when configured.
    pub fn from_config(
        config: &ExtractionConfig,
        resolver: Arc<dyn DomainResolver>,
    ) -> Result<Self, ExtractionError> {
        let mut strategies: Vec<Box<dyn ExtractionStrategy>> = vec![Box::new(
            StaticFetchStrategy::new(&config.user_agent, Duration::from_secs(config.static_timeout_secs))?,
        )];
        if let Some(remote) = &config.remote_browser {
            strategies.push(Box::new(RemoteBrowserStrategy::from_config(remote)?));
        }
        if let Some(local) = &config.local_browser {
            strategies.push(Box::new(LocalBrowserStrategy::from_config(local)));
        }
        let probe = TlsIssuerProbe::new(Duration::from_secs(config.tls_timeout_secs));
        Ok(Self::new(strategies, resolver, Arc::new(probe)))
    }

    pub fn tiers(&self) -> Vec<ExtractionTier> {
        self.strategies.iter().map(|s| s.tier()).collect()
    }

    /// Fingerprints `url` with the first tier that succeeds.
    ///
    /// Never fails: when every tier fails the result is
    /// `Fingerprint::degraded()`.
    #[instrument(skip(self))]
    pub async fn extract(&self, url: &str) -> Fingerprint {
        for strategy in &self.strategies {
            let tier = strategy.tier();
            match strategy.extract(url).await {
                Ok(fingerprint) => {
                    metrics::counter!("extractions_total", "tier" => tier.as_str(), "outcome" => "success")
                        .increment(1);
                    debug!(%tier, "Extraction succeeded");
                    return fingerprint;
                }
                Err(e) => {
                    metrics::counter!("extractions_total", "tier" => tier.as_str(), "outcome" => "failure")
                        .increment(1);
                    warn!(%tier, error = %e, "Extraction tier failed, falling back");
                }
            }
        }
        info!("All extraction tiers failed, using a degraded fingerprint");
        Fingerprint::degraded()
    }

    /// Resolves the host of `url` and reads the issuer of its certificate.
    /// Either part is left empty when it cannot be determined.
    #[instrument(skip(self))]
    pub async fn network_facts(&self, url: &str) -> NetworkFacts {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Cannot read host from URL");
                return NetworkFacts::default();
            }
        };
        let Some(host) = parsed.host_str() else {
            return NetworkFacts::default();
        };
        let port = parsed.port_or_known_default().unwrap_or(443);

        let ips = match self.resolver.resolve_ipv4(host).await {
            Ok(ips) => ips,
            Err(e) => {
                warn!(host, error = %e, "Could not resolve host");
                Vec::new()
            }
        };

        let ssl_issuer = if parsed.scheme() == "https" {
            match self.issuer_probe.issuer_org(host, port).await {
                Ok(issuer) => issuer,
                Err(e) => {
                    warn!(host, error = %e, "Could not read certificate issuer");
                    None
                }
            }
        } else {
            None
        };

        NetworkFacts { ips, ssl_issuer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dom_hash_hex_serde() {
        let hash = DomHash::of("<html><body></body></html>");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json.len(), 64 + 2);
        let back: DomHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<DomHash>("\"not-hex\"").is_err());
    }

    #[test]
    fn test_degraded_fingerprint() {
        let fp = Fingerprint::degraded();
        assert!(fp.is_degraded());
        assert!(fp.dom_hash.is_none());
        assert!(fp.css_variables.is_empty());
        assert!(fp.script_hashes().is_empty());
    }

    #[test]
    fn test_script_hash_ignores_query_and_case() {
        assert_eq!(
            hash_script_ref("/static/JS/app.js?v=123"),
            hash_script_ref("/static/js/app.js#main")
        );
        assert_ne!(hash_script_ref("/static/js/app.js"), hash_script_ref("/static/js/vendor.js"));
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("whitecat.fun").as_deref(), Some("https://whitecat.fun/"));
        assert_eq!(
            normalize_url(" http://example.com/path ").as_deref(),
            Some("http://example.com/path")
        );
        assert_eq!(normalize_url(""), None);
        assert_eq!(normalize_url("https://"), None);
    }
}
