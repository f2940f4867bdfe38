//! The observer that turns stream certificates into notifications.

use crate::core::{CertificateEvent, DomainResolver, DomainsObserver, Notification};
use crate::matching::{is_classifiable, MatchEngine};
use crate::verification::Verifier;
use async_channel::Sender;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lookups in flight for one certificate.
const DNS_CONCURRENCY: usize = 16;

/// Time allowed for all lookups of one certificate. The read loop waits for
/// it, so it stays well below the stall timeout.
pub const CERTIFICATE_DNS_BUDGET: Duration = Duration::from_secs(10);

/// Resolves, classifies and reports each domain of a certificate.
///
/// Owned by the stream connection, so all state here is touched by one task.
pub struct MatchPipeline {
    engine: MatchEngine,
    resolver: Arc<dyn DomainResolver>,
    dns_timeout: Duration,
    notifications_tx: Sender<Notification>,
    verifier: Option<Verifier>,
}

impl MatchPipeline {
    pub fn new(
        engine: MatchEngine,
        resolver: Arc<dyn DomainResolver>,
        dns_timeout: Duration,
        notifications_tx: Sender<Notification>,
        verifier: Option<Verifier>,
    ) -> Self {
        Self {
            engine,
            resolver,
            dns_timeout,
            notifications_tx,
            verifier,
        }
    }

    pub fn engine(&self) -> &MatchEngine {
        &self.engine
    }

    /// Resolves `domains` concurrently, keeping their order. Each lookup ends
    /// at its own timeout or at `deadline`, whichever comes first.
    async fn resolve_all(&self, domains: &[&str], deadline: Instant) -> Vec<Option<Ipv4Addr>> {
        if self.engine.dna().has_no_infrastructure() {
            return vec![None; domains.len()];
        }
        let lookups: Vec<_> = domains
            .iter()
            .map(|domain| self.resolve(domain, deadline))
            .collect();
        stream::iter(lookups)
            .buffered(DNS_CONCURRENCY)
            .collect()
            .await
    }

    /// Failures and timeouts yield `None`.
    async fn resolve(&self, domain: &str, deadline: Instant) -> Option<Ipv4Addr> {
        let until = deadline.min(Instant::now() + self.dns_timeout);
        match tokio::time::timeout_at(until, self.resolver.resolve_ipv4(domain)).await {
            Ok(Ok(addresses)) => self.engine.pick_address(&addresses),
            Ok(Err(e)) => {
                metrics::counter!("dns_failures_total").increment(1);
                trace!(domain, error = %e, "Resolution failed, classifying without an address");
                None
            }
            Err(_) => {
                metrics::counter!("dns_failures_total").increment(1);
                debug!(domain, "Resolution timed out, classifying without an address");
                None
            }
        }
    }
}

#[async_trait]
impl DomainsObserver for MatchPipeline {
    async fn on_domains_observed(&mut self, event: CertificateEvent) {
        if self.engine.is_excluded(&event) {
            metrics::counter!("certificates_excluded_total").increment(1);
            trace!(domains = ?event.domains, "Certificate excluded");
            return;
        }

        let candidates: Vec<&str> = event
            .domains
            .iter()
            .map(String::as_str)
            .filter(|domain| is_classifiable(domain) && !self.engine.already_alerted(domain))
            .collect();
        let deadline = Instant::now() + CERTIFICATE_DNS_BUDGET;
        let addresses = self.resolve_all(&candidates, deadline).await;

        for (domain, resolved_ip) in candidates.into_iter().zip(addresses) {
            let Some(alert) = self.engine.classify(domain, resolved_ip, &event) else {
                continue;
            };

            info!(
                domain = %alert.domain,
                match_type = %alert.match_type,
                confidence = %alert.confidence,
                matched_on = %alert.matched_on,
                cert_index = ?event.cert_index,
                "Suspected cabal site"
            );

            let verification = self.verifier.as_ref().map(|v| (v, alert.clone()));
            if self
                .notifications_tx
                .send(Notification::Alert(alert))
                .await
                .is_err()
            {
                warn!("Notification channel closed, alert dropped");
            }
            if let Some((verifier, alert)) = verification {
                verifier.dispatch(alert);
            }
        }
    }
}
