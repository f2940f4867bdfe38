//! Seeding of the profile store from known reference sites.

use crate::fingerprint::{normalize_url, FingerprintExtractor};
use crate::profile::{ProfileStore, StoreError, WatchEntry};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What a research run did.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ResearchSummary {
    pub researched: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub entries_added: usize,
    pub degraded: usize,
}

/// One-shot batch process that fills a `ProfileStore`.
pub struct ResearchBuilder {
    extractor: Arc<FingerprintExtractor>,
}

impl ResearchBuilder {
    pub fn new(extractor: Arc<FingerprintExtractor>) -> Self {
        Self { extractor }
    }

    /// Researches every URL not yet in the ledger, one at a time.
    ///
    /// The store is saved after each site, before the URL enters the
    /// ledger, so an interrupted run is resumed rather than half-recorded.
    #[instrument(skip_all, fields(urls = urls.len()))]
    pub async fn seed(&self, store: &mut ProfileStore, urls: &[String]) -> Result<ResearchSummary, StoreError> {
        let mut summary = ResearchSummary::default();

        for raw in urls {
            let Some(url) = normalize_url(raw) else {
                warn!(url = %raw, "Skipping invalid URL");
                summary.invalid += 1;
                continue;
            };
            if store.is_processed(&url) {
                info!(%url, "Already researched, skipping");
                summary.skipped += 1;
                continue;
            }

            info!(%url, "Researching reference site");
            let facts = self.extractor.network_facts(&url).await;
            let fingerprint = self.extractor.extract(&url).await;
            if fingerprint.is_degraded() {
                summary.degraded += 1;
            }

            store.merge_fingerprint(&fingerprint);
            if let Some(issuer) = &facts.ssl_issuer {
                store.add_ssl_issuer(issuer);
            }
            for ip in &facts.ips {
                if store.add_entry(WatchEntry::new(url.clone(), *ip, fingerprint.clone())) {
                    summary.entries_added += 1;
                }
            }
            if facts.ips.is_empty() {
                warn!(%url, "No addresses resolved, only the fingerprint was recorded");
            }

            store.save()?;
            store.mark_processed(&url)?;
            summary.researched += 1;

            info!(
                %url,
                ips = facts.ips.len(),
                issuer = ?facts.ssl_issuer,
                tier = ?fingerprint.extracted_via,
                "Reference site recorded"
            );
        }

        info!(?summary, "Research finished");
        Ok(summary)
    }
}
