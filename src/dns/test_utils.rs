use crate::dns::{DnsError, DomainResolver};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// Fake resolver with a fixed answer table. Unknown names fail like NXDOMAIN.
#[derive(Clone, Default)]
pub struct FakeResolver {
    answers: Arc<Mutex<HashMap<String, Vec<Ipv4Addr>>>>,
    call_count: Arc<Mutex<HashMap<String, u32>>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `domain` resolve to `ips`.
    pub fn add_answer(&self, domain: &str, ips: &[Ipv4Addr]) {
        self.answers
            .lock()
            .unwrap()
            .insert(domain.to_string(), ips.to_vec());
    }

    /// Get the number of times a domain was queried
    pub fn get_call_count(&self, domain: &str) -> u32 {
        let call_count = self.call_count.lock().unwrap();
        call_count.get(domain).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DomainResolver for FakeResolver {
    async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        {
            let mut call_count = self.call_count.lock().unwrap();
            *call_count.entry(domain.to_string()).or_insert(0) += 1;
        }

        match self.answers.lock().unwrap().get(domain) {
            Some(ips) if !ips.is_empty() => Ok(ips.clone()),
            Some(_) => Err(DnsError::NoRecords(domain.to_string())),
            None => Err(DnsError::Resolution(format!("NXDOMAIN for {}", domain))),
        }
    }
}
