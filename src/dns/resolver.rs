use crate::{
    config::DnsConfig,
    core::DomainResolver,
    dns::DnsError,
};
use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    proto::{rr::RecordType, xfer::Protocol},
    system_conf, TokioResolver,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};
use tracing::{trace, warn};

/// IPv4 resolver backed by hickory-resolver
pub struct HickoryDnsResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryDnsResolver {
    /// Creates a resolver from the application's DNS configuration.
    ///
    /// Returns the resolver together with the nameservers it will query, so the
    /// caller can log them.
    pub fn from_config(config: &DnsConfig) -> Result<(Self, Vec<SocketAddr>)> {
        // Search domains are dropped: names from certificates are fully qualified.
        let mut upstream = ResolverConfig::new();
        for ns in nameserver_source(config)?.name_servers() {
            upstream.add_name_server(ns.clone());
        }

        let mut nameservers: Vec<SocketAddr> =
            upstream.name_servers().iter().map(|ns| ns.socket_addr).collect();
        nameservers.sort();
        nameservers.dedup();

        let timeout = Duration::from_millis(config.timeout_ms);
        let mut opts = ResolverOpts::default();
        opts.ndots = 1;
        opts.timeout = timeout;
        opts.attempts = config.attempts;

        let resolver = hickory_resolver::Resolver::builder_with_config(
            upstream,
            hickory_resolver::name_server::TokioConnectionProvider::default(),
        )
        .with_options(opts)
        .build();

        Ok((Self { resolver, timeout }, nameservers))
    }
}

/// The configured resolver alone, or the system's nameservers.
fn nameserver_source(config: &DnsConfig) -> Result<ResolverConfig> {
    if let Some(addr) = &config.resolver {
        let socket_addr: SocketAddr = addr.parse()?;
        let mut explicit = ResolverConfig::new();
        explicit.add_name_server(NameServerConfig::new(socket_addr, Protocol::Udp));
        return Ok(explicit);
    }

    let (system, _) = system_conf::read_system_conf()?;
    if system.name_servers().is_empty() {
        warn!("No system nameservers found, using Cloudflare DNS");
        return Ok(ResolverConfig::cloudflare());
    }
    Ok(system)
}

#[async_trait]
impl DomainResolver for HickoryDnsResolver {
    async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let start_time = Instant::now();

        // The resolver applies its timeout per attempt; this bounds the whole lookup.
        let lookup = tokio::time::timeout(
            self.timeout * 2,
            self.resolver.lookup(domain, RecordType::A),
        )
        .await;

        metrics::histogram!("dns_resolution_duration_seconds")
            .record(start_time.elapsed().as_secs_f64());

        let lookup = match lookup {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                trace!(domain, error = %e, "A record lookup failed");
                let status = if is_nxdomain_error_str(&e.to_string()) {
                    "nxdomain"
                } else {
                    "failure"
                };
                metrics::counter!("dns_queries_total", "status" => status).increment(1);
                return Err(DnsError::Resolution(e.to_string()));
            }
            Err(_) => {
                metrics::counter!("dns_queries_total", "status" => "timeout").increment(1);
                return Err(DnsError::Timeout(domain.to_string()));
            }
        };

        let addresses: Vec<Ipv4Addr> = lookup
            .into_iter()
            .filter_map(|record| match record.ip_addr() {
                Some(IpAddr::V4(ip)) => Some(ip),
                _ => None,
            })
            .collect();

        if addresses.is_empty() {
            metrics::counter!("dns_queries_total", "status" => "empty").increment(1);
            return Err(DnsError::NoRecords(domain.to_string()));
        }

        metrics::counter!("dns_queries_total", "status" => "success").increment(1);
        Ok(addresses)
    }
}

fn is_nxdomain_error_str(err_str: &str) -> bool {
    let lower = err_str.to_lowercase();
    lower.contains("nxdomain") || lower.contains("no records found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nxdomain_detection() {
        assert!(is_nxdomain_error_str("no records found for Query { name: Name(\"x.invalid.\") }"));
        assert!(is_nxdomain_error_str("NXDomain response"));
        assert!(!is_nxdomain_error_str("request timed out"));
    }

    #[test]
    fn test_from_config_with_explicit_resolver() {
        let config = DnsConfig {
            resolver: Some("9.9.9.9:53".to_string()),
            ..DnsConfig::default()
        };
        let (_resolver, nameservers) = HickoryDnsResolver::from_config(&config).unwrap();
        assert_eq!(nameservers, vec!["9.9.9.9:53".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_from_config_rejects_bad_address() {
        let config = DnsConfig {
            resolver: Some("not-an-address".to_string()),
            ..DnsConfig::default()
        };
        assert!(HickoryDnsResolver::from_config(&config).is_err());
    }
}
