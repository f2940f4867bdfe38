#![allow(dead_code)]
use async_trait::async_trait;
use cabalwatch::core::{DomainsObserver, CertificateEvent, Notification, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A mock Output that forwards every notification over a channel.
#[derive(Clone, Debug)]
pub struct ChannelOutput {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelOutput {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Output for ChannelOutput {
    fn name(&self) -> &str {
        "channel_mock"
    }

    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        self.tx.send(notification.clone())?;
        Ok(())
    }
}

/// A mock Output that always fails.
#[derive(Clone, Debug, Default)]
pub struct FailingOutput;

#[async_trait]
impl Output for FailingOutput {
    fn name(&self) -> &str {
        "failing_mock"
    }

    async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
        anyhow::bail!("mock output failure")
    }
}

/// An observer that records the domains of every certificate it is given.
///
/// `work` simulates slow processing so ordering can be checked.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub seen: Arc<Mutex<Vec<Vec<String>>>>,
    pub work: Duration,
}

impl RecordingObserver {
    pub fn with_work(work: Duration) -> Self {
        Self {
            work,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DomainsObserver for RecordingObserver {
    async fn on_domains_observed(&mut self, event: CertificateEvent) {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.seen
            .lock()
            .unwrap()
            .push(event.domains.into_iter().collect());
    }
}
