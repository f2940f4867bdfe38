//! Reference data: watched infrastructure and the aggregate DNA profile.
//!
//! `ProfileStore` is the mutable form used while researching. Calling
//! `ProfileStore::lock` consumes it and yields a `DnaLock`, the read-only
//! form shared by everything that runs while listening.

pub mod store;

pub use store::{ProfileStore, StoreError};

use crate::fingerprint::Fingerprint;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// The /24 network that contains `ip`.
pub fn derive_subnet(ip: Ipv4Addr) -> Ipv4Network {
    let [a, b, c, _] = ip.octets();
    Ipv4Network::new(Ipv4Addr::new(a, b, c, 0), 24).expect("24 is a valid IPv4 prefix length")
}

/// One known address of a reference site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEntry {
    /// Site the address was learned from. `None` for hand-curated addresses.
    #[serde(default)]
    pub url: Option<String>,
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Network,
    #[serde(default)]
    pub fingerprint: Fingerprint,
}

impl WatchEntry {
    pub fn new(url: impl Into<String>, ip: Ipv4Addr, fingerprint: Fingerprint) -> Self {
        Self {
            url: Some(url.into()),
            ip,
            subnet: derive_subnet(ip),
            fingerprint,
        }
    }

    /// An address listed in the watchlist without any research behind it.
    pub fn hand_curated(ip: Ipv4Addr) -> Self {
        Self {
            url: None,
            ip,
            subnet: derive_subnet(ip),
            fingerprint: Fingerprint::degraded(),
        }
    }
}

/// Union of everything learned from the reference sites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Profile {
    pub ssl_issuers: BTreeSet<String>,
    pub css_variables: BTreeSet<String>,
    pub script_hashes: BTreeSet<String>,
    pub dom_hashes: BTreeSet<String>,
    pub template_markers: BTreeSet<String>,
}

impl Profile {
    /// Unions a fingerprint into the profile.
    pub fn absorb(&mut self, fingerprint: &Fingerprint) {
        self.css_variables
            .extend(fingerprint.css_variables.iter().cloned());
        self.script_hashes.extend(fingerprint.script_hashes());
        if let Some(hash) = fingerprint.dom_hash {
            self.dom_hashes.insert(hash.to_hex());
        }
        self.template_markers
            .extend(fingerprint.template_markers.iter().cloned());
    }

    pub fn add_ssl_issuer(&mut self, issuer: &str) {
        let issuer = issuer.trim();
        if !issuer.is_empty() {
            self.ssl_issuers.insert(issuer.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ssl_issuers.is_empty()
            && self.css_variables.is_empty()
            && self.script_hashes.is_empty()
            && self.dom_hashes.is_empty()
            && self.template_markers.is_empty()
    }
}

#[derive(Debug)]
struct LockedDna {
    entries: Vec<WatchEntry>,
    watched_ips: HashSet<Ipv4Addr>,
    watched_subnets: BTreeSet<Ipv4Network>,
    profile: Profile,
}

/// Read-only reference data for a listening session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DnaLock {
    inner: Arc<LockedDna>,
}

impl DnaLock {
    /// Freezes the given data. Subnets of all entries are added to
    /// `extra_subnets`.
    pub fn new(
        entries: Vec<WatchEntry>,
        extra_subnets: impl IntoIterator<Item = Ipv4Network>,
        profile: Profile,
    ) -> Self {
        let watched_ips = entries.iter().map(|e| e.ip).collect();
        let mut watched_subnets: BTreeSet<Ipv4Network> = extra_subnets.into_iter().collect();
        watched_subnets.extend(entries.iter().map(|e| e.subnet));
        Self {
            inner: Arc::new(LockedDna {
                entries,
                watched_ips,
                watched_subnets,
                profile,
            }),
        }
    }

    pub fn entries(&self) -> &[WatchEntry] {
        &self.inner.entries
    }

    pub fn profile(&self) -> &Profile {
        &self.inner.profile
    }

    pub fn is_watched_ip(&self, ip: Ipv4Addr) -> bool {
        self.inner.watched_ips.contains(&ip)
    }

    /// The watched network containing `ip`, if any.
    pub fn watched_subnet_for(&self, ip: Ipv4Addr) -> Option<Ipv4Network> {
        let own = derive_subnet(ip);
        if self.inner.watched_subnets.contains(&own) {
            return Some(own);
        }
        self.inner
            .watched_subnets
            .iter()
            .find(|net| net.contains(ip))
            .copied()
    }

    pub fn watched_ip_count(&self) -> usize {
        self.inner.watched_ips.len()
    }

    pub fn watched_subnet_count(&self) -> usize {
        self.inner.watched_subnets.len()
    }

    /// True when there is no infrastructure to match against.
    pub fn has_no_infrastructure(&self) -> bool {
        self.inner.watched_ips.is_empty() && self.inner.watched_subnets.is_empty()
    }
}
