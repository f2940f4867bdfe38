pub mod resolver;
#[cfg(feature = "test-utils")]
pub mod test_utils;

use thiserror::Error;

pub use crate::core::DomainResolver;
pub use resolver::HickoryDnsResolver;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DnsError {
    #[error("DNS resolution failed: {0}")]
    Resolution(String),

    #[error("No A records found for {0}")]
    NoRecords(String),

    #[error("DNS resolution for {0} timed out")]
    Timeout(String),
}
