#![allow(dead_code)]
use async_trait::async_trait;
use cabalwatch::fingerprint::{
    ExtractionError, ExtractionStrategy, ExtractionTier, Fingerprint, IssuerProbe,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// A tier that returns a canned fingerprint, or fails with `EmptyDocument`.
pub struct FakeStrategy {
    tier: ExtractionTier,
    result: Option<Fingerprint>,
    calls: Arc<AtomicUsize>,
}

impl FakeStrategy {
    pub fn succeeding(tier: ExtractionTier, mut fingerprint: Fingerprint) -> Self {
        fingerprint.extracted_via = Some(tier);
        Self {
            tier,
            result: Some(fingerprint),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(tier: ExtractionTier) -> Self {
        Self {
            tier,
            result: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl ExtractionStrategy for FakeStrategy {
    fn tier(&self) -> ExtractionTier {
        self.tier
    }

    async fn extract(&self, _url: &str) -> Result<Fingerprint, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().ok_or(ExtractionError::EmptyDocument)
    }
}

/// A probe that always reports the same issuer.
pub struct FakeIssuerProbe(pub Option<String>);

impl FakeIssuerProbe {
    pub fn issuing(org: &str) -> Self {
        Self(Some(org.to_string()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl IssuerProbe for FakeIssuerProbe {
    async fn issuer_org(&self, _host: &str, _port: u16) -> Result<Option<String>, ExtractionError> {
        Ok(self.0.clone())
    }
}

/// A tier that knows a fixed fingerprint per URL and fails for the rest.
pub struct MappedStrategy {
    tier: ExtractionTier,
    pages: std::collections::HashMap<String, Fingerprint>,
    calls: Arc<AtomicUsize>,
}

impl MappedStrategy {
    pub fn new(tier: ExtractionTier, pages: Vec<(&str, Fingerprint)>) -> Self {
        let pages = pages
            .into_iter()
            .map(|(url, mut fingerprint)| {
                fingerprint.extracted_via = Some(tier);
                (url.to_string(), fingerprint)
            })
            .collect();
        Self {
            tier,
            pages,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl ExtractionStrategy for MappedStrategy {
    fn tier(&self) -> ExtractionTier {
        self.tier
    }

    async fn extract(&self, url: &str) -> Result<Fingerprint, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages.get(url).cloned().ok_or(ExtractionError::Status(404))
    }
}
