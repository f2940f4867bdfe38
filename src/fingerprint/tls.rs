//! Reads the issuing organization from a site's TLS certificate.

use super::ExtractionError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use x509_parser::prelude::*;

#[async_trait]
pub trait IssuerProbe: Send + Sync {
    /// Issuer `O` of the certificate served at `host:port`, if it has one.
    async fn issuer_org(&self, host: &str, port: u16) -> Result<Option<String>, ExtractionError>;
}

/// Probe that performs a real TLS handshake. Certificate validation is off:
/// self-signed and mismatched certificates still name an issuer.
#[derive(Debug, Clone)]
pub struct TlsIssuerProbe {
    timeout: Duration,
}

impl TlsIssuerProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn peer_certificate_der(&self, host: &str, port: u16) -> Result<Option<Vec<u8>>, ExtractionError> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ExtractionError::Tls(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tcp = TcpStream::connect((host, port)).await?;
        let stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| ExtractionError::Tls(e.to_string()))?;

        let certificate = stream
            .get_ref()
            .peer_certificate()
            .map_err(|e| ExtractionError::Tls(e.to_string()))?;

        certificate
            .map(|c| c.to_der().map_err(|e| ExtractionError::Tls(e.to_string())))
            .transpose()
    }
}

#[async_trait]
impl IssuerProbe for TlsIssuerProbe {
    async fn issuer_org(&self, host: &str, port: u16) -> Result<Option<String>, ExtractionError> {
        let der = tokio::time::timeout(self.timeout, self.peer_certificate_der(host, port))
            .await
            .map_err(|_| ExtractionError::ProbeTimeout(self.timeout))??;
        Ok(der.as_deref().and_then(issuer_org_from_der))
    }
}

/// Issuer organization of a DER-encoded certificate.
pub fn issuer_org_from_der(der: &[u8]) -> Option<String> {
    let (_, certificate) = X509Certificate::from_der(der).ok()?;
    let organization = certificate
        .issuer()
        .iter_organization()
        .next()?
        .as_str()
        .ok()?
        .trim()
        .to_string();
    (!organization.is_empty()).then_some(organization)
}
