//! Deep-DNA re-verification of matched sites.
//!
//! After an alert the live site is fingerprinted again and compared with the
//! locked profile. This runs on its own task so the stream never waits for
//! it; the report follows the alert through the same notification channel.

use crate::core::{Alert, MatchType, Notification};
use crate::fingerprint::{ExtractionTier, Fingerprint, FingerprintExtractor};
use crate::profile::{DnaLock, Profile};
use async_channel::Sender;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Outcome of comparing a live fingerprint with the profile.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DnaVerdict {
    /// Same structure as a reference site, or every other signal agrees.
    Confirmed,
    /// Some signals overlap.
    Partial,
    NoMatch,
    /// The site could not be fingerprinted.
    Unavailable,
}

impl fmt::Display for DnaVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DnaVerdict::Confirmed => "CONFIRMED",
            DnaVerdict::Partial => "PARTIAL",
            DnaVerdict::NoMatch => "NO_MATCH",
            DnaVerdict::Unavailable => "UNAVAILABLE",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DnaComparison {
    pub dom_hash_match: bool,
    pub shared_css_variables: BTreeSet<String>,
    pub shared_script_hashes: BTreeSet<String>,
    pub shared_template_markers: BTreeSet<String>,
    pub verdict: DnaVerdict,
}

impl DnaComparison {
    pub fn between(profile: &Profile, fingerprint: &Fingerprint) -> Self {
        if fingerprint.is_degraded() {
            return Self {
                dom_hash_match: false,
                shared_css_variables: BTreeSet::new(),
                shared_script_hashes: BTreeSet::new(),
                shared_template_markers: BTreeSet::new(),
                verdict: DnaVerdict::Unavailable,
            };
        }

        let dom_hash_match = fingerprint
            .dom_hash
            .is_some_and(|hash| profile.dom_hashes.contains(&hash.to_hex()));
        let shared_css_variables: BTreeSet<String> = fingerprint
            .css_variables
            .intersection(&profile.css_variables)
            .cloned()
            .collect();
        let shared_script_hashes: BTreeSet<String> = fingerprint
            .script_hashes()
            .intersection(&profile.script_hashes)
            .cloned()
            .collect();
        let shared_template_markers: BTreeSet<String> = fingerprint
            .template_markers
            .intersection(&profile.template_markers)
            .cloned()
            .collect();

        let signals = [
            !shared_css_variables.is_empty(),
            !shared_script_hashes.is_empty(),
            !shared_template_markers.is_empty(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        let verdict = match (dom_hash_match, signals) {
            (true, _) | (false, 3) => DnaVerdict::Confirmed,
            (false, 0) => DnaVerdict::NoMatch,
            _ => DnaVerdict::Partial,
        };

        Self {
            dom_hash_match,
            shared_css_variables,
            shared_script_hashes,
            shared_template_markers,
            verdict,
        }
    }
}

/// Result of re-verifying one alerted domain.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerificationReport {
    pub domain: String,
    pub url: String,
    pub match_type: MatchType,
    pub extracted_via: Option<ExtractionTier>,
    pub dna: DnaComparison,
    pub timestamp: DateTime<Utc>,
}

impl VerificationReport {
    pub fn verdict(&self) -> DnaVerdict {
        self.dna.verdict
    }
}

/// Fingerprints `alert.domain` and compares it with the locked profile.
#[instrument(skip_all, fields(domain = %alert.domain))]
pub async fn verify(extractor: &FingerprintExtractor, dna: &DnaLock, alert: &Alert) -> VerificationReport {
    let url = format!("https://{}/", alert.domain);
    let fingerprint = extractor.extract(&url).await;
    let comparison = DnaComparison::between(dna.profile(), &fingerprint);
    VerificationReport {
        domain: alert.domain.clone(),
        url,
        match_type: alert.match_type,
        extracted_via: fingerprint.extracted_via,
        dna: comparison,
        timestamp: Utc::now(),
    }
}

/// Runs verifications in the background with bounded concurrency.
#[derive(Clone)]
pub struct Verifier {
    extractor: Arc<FingerprintExtractor>,
    dna: DnaLock,
    notifications_tx: Sender<Notification>,
    permits: Arc<Semaphore>,
}

impl Verifier {
    pub fn new(
        extractor: Arc<FingerprintExtractor>,
        dna: DnaLock,
        notifications_tx: Sender<Notification>,
        concurrency: usize,
    ) -> Self {
        Self {
            extractor,
            dna,
            notifications_tx,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Starts verifying `alert` and returns immediately.
    pub fn dispatch(&self, alert: Alert) -> JoinHandle<()> {
        let verifier = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = verifier.permits.clone().acquire_owned().await else {
                return;
            };
            let report = verify(&verifier.extractor, &verifier.dna, &alert).await;
            metrics::counter!("verifications_total", "verdict" => report.verdict().to_string())
                .increment(1);
            info!(
                domain = %report.domain,
                verdict = %report.verdict(),
                "Verification finished"
            );
            if verifier
                .notifications_tx
                .send(Notification::Verification(report))
                .await
                .is_err()
            {
                debug!("Notification channel closed, dropping verification report");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::DomHash;

    fn reference() -> (Profile, Fingerprint) {
        let fp = Fingerprint {
            dom_hash: Some(DomHash::of("<html><body></body></html>")),
            css_variables: ["--brand".to_string(), "--accent".to_string()].into(),
            script_refs: vec!["/js/app.js".to_string()],
            template_markers: ["data-theme".to_string()].into(),
            extracted_via: Some(ExtractionTier::StaticParse),
            ..Fingerprint::default()
        };
        let mut profile = Profile::default();
        profile.absorb(&fp);
        (profile, fp)
    }

    #[test]
    fn test_identical_structure_is_confirmed() {
        let (profile, fp) = reference();
        let comparison = DnaComparison::between(&profile, &fp);
        assert!(comparison.dom_hash_match);
        assert_eq!(comparison.verdict, DnaVerdict::Confirmed);
        assert_eq!(comparison.shared_script_hashes.len(), 1);
    }

    #[test]
    fn test_partial_overlap() {
        let (profile, _) = reference();
        let live = Fingerprint {
            dom_hash: Some(DomHash::of("<html><body><main></main></body></html>")),
            css_variables: ["--brand".to_string()].into(),
            extracted_via: Some(ExtractionTier::RemoteBrowser),
            ..Fingerprint::default()
        };
        let comparison = DnaComparison::between(&profile, &live);
        assert!(!comparison.dom_hash_match);
        assert_eq!(comparison.verdict, DnaVerdict::Partial);
    }

    #[test]
    fn test_all_signals_without_dom_match_is_confirmed() {
        let (profile, mut live) = reference();
        live.dom_hash = Some(DomHash::of("<html></html>"));
        assert_eq!(DnaComparison::between(&profile, &live).verdict, DnaVerdict::Confirmed);
    }

    #[test]
    fn test_unrelated_site_is_no_match() {
        let (profile, _) = reference();
        let live = Fingerprint {
            dom_hash: Some(DomHash::of("<html><head></head></html>")),
            extracted_via: Some(ExtractionTier::StaticParse),
            ..Fingerprint::default()
        };
        assert_eq!(DnaComparison::between(&profile, &live).verdict, DnaVerdict::NoMatch);
    }

    #[test]
    fn test_degraded_fingerprint_is_unavailable() {
        let (profile, _) = reference();
        let comparison = DnaComparison::between(&profile, &Fingerprint::degraded());
        assert_eq!(comparison.verdict, DnaVerdict::Unavailable);
    }
}
