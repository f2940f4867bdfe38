//! An output that posts notifications to a Slack incoming webhook.

use crate::core::{Notification, Output};
use crate::formatting::TextFormatter;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{error, instrument, trace};

/// A client for sending messages to a Slack webhook.
pub struct SlackOutput {
    client: reqwest::Client,
    webhook_url: String,
    formatter: Box<dyn TextFormatter>,
}

impl SlackOutput {
    /// Creates a new `SlackOutput` with a 10 second request timeout.
    pub fn new(webhook_url: String, formatter: Box<dyn TextFormatter>) -> anyhow::Result<Self> {
        Self::with_timeout(webhook_url, formatter, Duration::from_secs(10))
    }

    pub fn with_timeout(
        webhook_url: String,
        formatter: Box<dyn TextFormatter>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url,
            formatter,
        })
    }
}

#[async_trait]
impl Output for SlackOutput {
    fn name(&self) -> &str {
        "slack"
    }

    #[instrument(skip_all, fields(domain = notification.domain()))]
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = json!({ "text": self.formatter.format(notification) });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP request to Slack failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Failed to send Slack notification");
            anyhow::bail!(
                "Failed to send Slack notification: status {}, body: {}",
                status,
                text
            );
        }

        trace!("Slack notification delivered");
        Ok(())
    }
}
