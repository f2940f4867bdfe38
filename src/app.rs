//! Assembly of the `listen` mode, decoupled from the entry point.

use crate::{
    config::Config,
    core::{DomainResolver, Notification, Output},
    dns::HickoryDnsResolver,
    fingerprint::FingerprintExtractor,
    formatting::SlackTextFormatter,
    internal_metrics::{Metrics, MetricsBuilder},
    matching::{MatchEngine, PatternSet},
    network::{
        ConnectionState, Connector, StreamConnection, StreamError, StreamHandle, StreamSettings,
        TungsteniteConnector,
    },
    notification::SlackOutput,
    outputs::{OutputManager, StdoutOutput},
    pipeline::MatchPipeline,
    profile::{DnaLock, ProfileStore},
    task_manager::TaskManager,
    verification::Verifier,
};
use anyhow::Result;
use async_channel::Receiver;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// How `App::run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The shutdown signal was received.
    Shutdown,
    /// The stream gave up after its reconnect budget was spent.
    StreamExhausted,
}

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    stream: StreamHandle,
    metrics: Metrics,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// Read-only view of the stream connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.stream.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs until the shutdown signal or until the stream is exhausted, then
    /// waits for pending notifications to be written.
    pub async fn run(self) -> Result<RunOutcome> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        let disconnector = self.stream.disconnector();
        let join = self.stream.join();
        tokio::pin!(join);

        let (outcome, result) = tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, disconnecting from the stream");
                disconnector.disconnect();
                (RunOutcome::Shutdown, join.await)
            }
            result = &mut join => {
                let outcome = match &result {
                    Err(StreamError::Exhausted { .. }) => RunOutcome::StreamExhausted,
                    _ => RunOutcome::Shutdown,
                };
                (outcome, result)
            }
        };

        match result {
            Ok(()) => debug!("Stream connection closed"),
            Err(StreamError::Exhausted { ref url, retries }) => {
                warn!(%url, retries, "Stream connection exhausted its reconnect budget");
            }
            Err(e) => return Err(e.into()),
        }

        self.task_manager.shutdown().await;
        info!(?outcome, "All tasks shut down.");
        Ok(outcome)
    }
}

/// Builder for the `listen` mode.
///
/// Every external dependency can be overridden, which is how the
/// integration tests run the whole pipeline without a network.
pub struct AppBuilder {
    config: Config,
    connector_override: Option<Arc<dyn Connector>>,
    resolver_override: Option<Arc<dyn DomainResolver>>,
    extractor_override: Option<Arc<FingerprintExtractor>>,
    output_override: Option<Vec<Arc<dyn Output>>>,
    dna_override: Option<DnaLock>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector_override: None,
            resolver_override: None,
            extractor_override: None,
            output_override: None,
            dna_override: None,
        }
    }

    /// Overrides the transport used to reach the stream.
    pub fn connector_override(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector_override = Some(connector);
        self
    }

    /// Overrides the DNS resolver.
    pub fn resolver_override(mut self, resolver: Arc<dyn DomainResolver>) -> Self {
        self.resolver_override = Some(resolver);
        self
    }

    /// Overrides the extractor used for verification.
    pub fn extractor_override(mut self, extractor: Arc<FingerprintExtractor>) -> Self {
        self.extractor_override = Some(extractor);
        self
    }

    /// Overrides the output destinations.
    pub fn output_override(mut self, outputs: Vec<Arc<dyn Output>>) -> Self {
        self.output_override = Some(outputs);
        self
    }

    /// Uses an already locked profile instead of loading `data_dir`.
    pub fn dna_override(mut self, dna: DnaLock) -> Self {
        self.dna_override = Some(dna);
        self
    }

    /// Builds all components and connects to the stream.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);

        // =========================================================================
        // 1. Metrics
        // =========================================================================
        let metrics = MetricsBuilder::new(config.metrics.clone()).build()?;

        // =========================================================================
        // 2. Locked profile and patterns
        // =========================================================================
        let dna = match self.dna_override {
            Some(dna) => dna,
            None => ProfileStore::open(&config.data_dir)?.lock(),
        };
        metrics.set_watched_infrastructure(dna.watched_ip_count(), dna.watched_subnet_count());
        info!(
            watched_ips = dna.watched_ip_count(),
            watched_subnets = dna.watched_subnet_count(),
            ssl_issuers = dna.profile().ssl_issuers.len(),
            "Profile locked"
        );
        if dna.has_no_infrastructure() {
            warn!(
                data_dir = %config.data_dir.display(),
                "No watched infrastructure; only issuer and pattern matches are possible. Run `research` first."
            );
        }

        let patterns = PatternSet::from_config(&config.matching)?;
        metrics.set_patterns_loaded(patterns.len());
        info!(patterns = patterns.len(), excluded = config.matching.excluded.len(), "Patterns loaded");

        // =========================================================================
        // 3. Resolver and extractor
        // =========================================================================
        let resolver = match self.resolver_override {
            Some(resolver) => resolver,
            None => {
                let (resolver, nameservers) = HickoryDnsResolver::from_config(&config.dns)?;
                let ns: Vec<String> = nameservers.iter().map(|s| s.to_string()).collect();
                info!(nameservers = %ns.join(", "), "DNS resolver ready");
                Arc::new(resolver) as Arc<dyn DomainResolver>
            }
        };

        // =========================================================================
        // 4. Outputs
        // =========================================================================
        let outputs = match self.output_override {
            Some(outputs) => outputs,
            None => {
                let mut outputs: Vec<Arc<dyn Output>> =
                    vec![Arc::new(StdoutOutput::new(config.output.format))];
                if let Some(slack) = &config.output.slack {
                    outputs.push(Arc::new(SlackOutput::new(
                        slack.webhook_url.clone(),
                        Box::new(SlackTextFormatter),
                    )?));
                }
                outputs
            }
        };
        let output_manager = Arc::new(OutputManager::new(outputs));
        debug!(outputs = output_manager.len(), "Output manager ready");

        // =========================================================================
        // 5. Match pipeline
        // =========================================================================
        let (notifications_tx, notifications_rx) = async_channel::unbounded();

        let verifier = if config.verification.enabled {
            let extractor = match self.extractor_override {
                Some(extractor) => extractor,
                None => Arc::new(FingerprintExtractor::from_config(&config.extraction, resolver.clone())?),
            };
            info!(tiers = ?extractor.tiers(), concurrency = config.verification.concurrency, "Verification enabled");
            Some(Verifier::new(
                extractor,
                dna.clone(),
                notifications_tx.clone(),
                config.verification.concurrency,
            ))
        } else {
            None
        };

        let engine = MatchEngine::new(dna, patterns, config.matching.excluded.clone());
        let pipeline = MatchPipeline::new(
            engine,
            resolver,
            config.dns.lookup_timeout(),
            notifications_tx,
            verifier,
        );

        // =========================================================================
        // 6. Output task
        // =========================================================================
        task_manager.spawn(
            "OutputTask",
            output_task_logic(task_manager.get_shutdown_rx(), notifications_rx, output_manager),
        );

        // =========================================================================
        // 7. Stream connection
        // =========================================================================
        let connector = match self.connector_override {
            Some(connector) => connector,
            None => Arc::new(TungsteniteConnector::new(
                config.stream.allow_invalid_certs,
                config.stream.connect_timeout(),
            )),
        };
        let connection = StreamConnection::new(
            config.stream.certstream_url.clone(),
            connector,
            pipeline,
            StreamSettings::from(&config.stream),
        );
        let stream = connection.spawn(config.stream.max_retries);

        info!(url = %config.stream.certstream_url, "CabalWatch listening");

        Ok(App {
            task_manager,
            stream,
            metrics,
        })
    }
}

/// Writes notifications until the channel closes. On shutdown, whatever is
/// already queued is still written.
#[instrument(skip_all)]
async fn output_task_logic(
    mut shutdown_rx: watch::Receiver<bool>,
    notifications_rx: Receiver<Notification>,
    output_manager: Arc<OutputManager>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("Output task received shutdown signal.");
                while let Ok(notification) = notifications_rx.try_recv() {
                    deliver(&output_manager, &notification).await;
                }
                break;
            }
            received = notifications_rx.recv() => {
                match received {
                    Ok(notification) => deliver(&output_manager, &notification).await,
                    Err(_) => {
                        debug!("Notification channel closed.");
                        break;
                    }
                }
            }
        }
    }
    info!("Output task finished.");
}

async fn deliver(output_manager: &OutputManager, notification: &Notification) {
    if let Err(e) = output_manager.send(notification).await {
        warn!(domain = notification.domain(), error = %e, "Notification was not delivered");
    }
}
