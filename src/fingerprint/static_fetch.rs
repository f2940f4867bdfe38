use super::{parse, ExtractionError, ExtractionStrategy, ExtractionTier, Fingerprint};
use async_trait::async_trait;
use reqwest::{redirect, Client};
use std::time::Duration;
use tracing::debug;

/// Tier 1: plain HTTP GET and static markup analysis. Scripts are not run.
pub struct StaticFetchStrategy {
    client: Client,
}

impl StaticFetchStrategy {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ExtractionStrategy for StaticFetchStrategy {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::StaticParse
    }

    async fn extract(&self, url: &str) -> Result<Fingerprint, ExtractionError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(ExtractionError::EmptyDocument);
        }
        debug!(bytes = body.len(), "Fetched static document");

        let mut fingerprint = parse::analyze(&body);
        fingerprint.extracted_via = Some(ExtractionTier::StaticParse);
        Ok(fingerprint)
    }
}
