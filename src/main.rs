//! CabalWatch - certificate transparency watcher for a known operator group.
//!
//! `research` builds the reference profile, `listen` watches the stream
//! against it, and `inspect` prints what the extractor sees for one site.

use anyhow::{Context, Result};
use cabalwatch::{
    app::{App, RunOutcome},
    cli::{Cli, Command},
    config::Config,
    core::DomainResolver,
    dns::HickoryDnsResolver,
    fingerprint::{normalize_url, FingerprintExtractor},
    profile::ProfileStore,
    research::ResearchBuilder,
};
use clap::Parser;
use serde_json::json;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!("Failed to load configuration: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);

    let result = match cli.command {
        Command::Research { urls, urls_file } => research(config, urls, urls_file.as_deref()).await,
        Command::Listen { .. } => listen(config).await,
        Command::Inspect { url } => inspect(config, &url).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout carries only notifications and reports.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_resolver(config: &Config) -> Result<Arc<dyn DomainResolver>> {
    let (resolver, _) = HickoryDnsResolver::from_config(&config.dns)?;
    Ok(Arc::new(resolver))
}

/// Reads one URL per line. Blank lines and `#` comments are skipped.
fn read_urls_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn research(config: Config, mut urls: Vec<String>, urls_file: Option<&Path>) -> Result<ExitCode> {
    if let Some(path) = urls_file {
        urls.extend(read_urls_file(path)?);
    }
    if urls.is_empty() {
        anyhow::bail!("No URLs to research; pass them as arguments or with --urls-file");
    }

    let resolver = build_resolver(&config)?;
    let extractor = Arc::new(FingerprintExtractor::from_config(&config.extraction, resolver)?);
    let mut store = ProfileStore::open(&config.data_dir)?;
    info!(
        data_dir = %store.dir().display(),
        known_entries = store.entries().len(),
        processed = store.processed_count(),
        "Profile store opened"
    );

    let summary = ResearchBuilder::new(extractor).seed(&mut store, &urls).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

async fn listen(config: Config) -> Result<ExitCode> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let app = App::builder(config).build(shutdown_rx).await?;
    match app.run().await? {
        RunOutcome::Shutdown => Ok(ExitCode::SUCCESS),
        RunOutcome::StreamExhausted => {
            error!("Certificate stream unreachable, giving up");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn inspect(config: Config, raw: &str) -> Result<ExitCode> {
    let url = normalize_url(raw).with_context(|| format!("Invalid URL: {raw}"))?;
    let extractor = FingerprintExtractor::from_config(&config.extraction, build_resolver(&config)?)?;

    let facts = extractor.network_facts(&url).await;
    let fingerprint = extractor.extract(&url).await;
    let report = json!({
        "url": url,
        "ips": facts.ips,
        "ssl_issuer": facts.ssl_issuer,
        "script_hashes": fingerprint.script_hashes(),
        "fingerprint": fingerprint,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}
