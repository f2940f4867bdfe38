//! Output destinations and their dispatcher.

use crate::config::OutputFormat;
use crate::core::{Notification, Output};
use crate::formatting::{PlainTextFormatter, TextFormatter};
use anyhow::Result;
use async_trait::async_trait;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, error};

/// Writes notifications to stdout, one per line.
pub struct StdoutOutput {
    format: OutputFormat,
}

impl StdoutOutput {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Renders a notification the way `send` prints it.
    pub fn render(&self, notification: &Notification) -> Result<String> {
        Ok(match self.format {
            OutputFormat::Json => serde_json::to_string(notification)?,
            OutputFormat::PlainText => PlainTextFormatter.format(notification),
        })
    }
}

#[async_trait]
impl Output for StdoutOutput {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let line = self.render(notification)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        stdout.flush()?;
        Ok(())
    }
}

/// Fans each notification out to every configured output.
pub struct OutputManager {
    outputs: Vec<Arc<dyn Output>>,
}

impl OutputManager {
    pub fn new(outputs: Vec<Arc<dyn Output>>) -> Self {
        Self { outputs }
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Sends to all outputs. A failing output does not stop the others;
    /// an error is returned only if every output failed.
    pub async fn send(&self, notification: &Notification) -> Result<()> {
        let mut failures = 0;
        for output in &self.outputs {
            match output.send(notification).await {
                Ok(()) => {
                    metrics::counter!("notifications_sent_total", "output" => output.name().to_string())
                        .increment(1);
                    debug!(output = output.name(), domain = notification.domain(), "Notification sent");
                }
                Err(e) => {
                    failures += 1;
                    metrics::counter!("notification_failures_total", "output" => output.name().to_string())
                        .increment(1);
                    error!(output = output.name(), error = %e, "Failed to send notification");
                }
            }
        }
        if failures > 0 && failures == self.outputs.len() {
            anyhow::bail!("all {} outputs failed", failures);
        }
        Ok(())
    }
}
