use super::{parse, ExtractionError, ExtractionStrategy, ExtractionTier, Fingerprint};
use crate::config::LocalBrowserConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Tier 3: a locally launched headless Chromium that prints the rendered DOM.
pub struct LocalBrowserStrategy {
    binary: PathBuf,
    timeout: Duration,
}

impl LocalBrowserStrategy {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &LocalBrowserConfig) -> Self {
        Self::new(config.binary.clone(), Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl ExtractionStrategy for LocalBrowserStrategy {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::LocalBrowser
    }

    async fn extract(&self, url: &str) -> Result<Fingerprint, ExtractionError> {
        let mut command = Command::new(&self.binary);
        command
            .args([
                "--headless=new",
                "--disable-gpu",
                "--no-sandbox",
                "--hide-scrollbars",
                "--virtual-time-budget=10000",
                "--dump-dom",
            ])
            .arg(url)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ExtractionError::Timeout {
                tier: ExtractionTier::LocalBrowser,
                after: self.timeout,
            })??;

        if !output.status.success() {
            return Err(ExtractionError::Process(format!(
                "{} exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        let markup = String::from_utf8_lossy(&output.stdout);
        if markup.trim().is_empty() {
            return Err(ExtractionError::EmptyDocument);
        }
        debug!(bytes = markup.len(), "Browser dumped rendered document");

        let mut fingerprint = parse::analyze(&markup);
        fingerprint.extracted_via = Some(ExtractionTier::LocalBrowser);
        Ok(fingerprint)
    }
}
