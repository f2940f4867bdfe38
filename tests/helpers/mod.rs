#![allow(dead_code)]
pub mod fake_extraction;
pub mod mock_output;
pub mod mock_ws;

use async_trait::async_trait;
use cabalwatch::config::Config;
use cabalwatch::dns::{DnsError, DomainResolver};
use cabalwatch::profile::{DnaLock, Profile, WatchEntry};
use serde_json::json;
use std::net::Ipv4Addr;

/// A `certificate_update` frame as certstream sends it.
pub fn certificate_frame(domains: &[&str], issuer: Option<&str>) -> String {
    json!({
        "message_type": "certificate_update",
        "data": {
            "update_type": "X509LogEntry",
            "leaf_cert": {
                "subject": { "CN": domains.first().copied().unwrap_or_default() },
                "all_domains": domains,
                "issuer": { "O": issuer, "CN": "R11" },
                "not_before": 1751994232,
                "not_after": 1759770232
            },
            "cert_index": 42,
            "seen": 1751994232.5
        }
    })
    .to_string()
}

pub fn heartbeat_frame() -> String {
    json!({ "message_type": "heartbeat", "timestamp": 1751994232.5 }).to_string()
}

/// A locked profile watching `ips`, with the given issuers.
pub fn dna_watching(ips: &[Ipv4Addr], issuers: &[&str]) -> DnaLock {
    let mut profile = Profile::default();
    for issuer in issuers {
        profile.add_ssl_issuer(issuer);
    }
    let entries = ips.iter().map(|ip| WatchEntry::hand_curated(*ip)).collect();
    DnaLock::new(entries, [], profile)
}

/// Defaults with verification off and a short DNS budget.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.verification.enabled = false;
    config.dns.timeout_ms = 200;
    config.dns.attempts = 1;
    config.stream.certstream_url = "wss://certstream.test".to_string();
    config
}

/// A resolver whose lookups never answer.
pub struct HangingResolver;

#[async_trait]
impl DomainResolver for HangingResolver {
    async fn resolve_ipv4(&self, _domain: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        std::future::pending().await
    }
}
