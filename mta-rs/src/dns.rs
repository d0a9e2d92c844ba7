//! DNS lookups used by relay (MX) and SPF (TXT, A/AAAA)
//!
//! Everything goes through [`DnsResolver`] so callers can be exercised
//! without a network.

use crate::error::{MailError, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::debug;
use trust_dns_resolver::config::*;
use trust_dns_resolver::TokioAsyncResolver;

/// One MX answer, exchange without the trailing dot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>>;

    /// TXT records, each one's character strings concatenated
    async fn txt(&self, domain: &str) -> Result<Vec<String>>;

    async fn ips(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by trust-dns with the default upstream configuration
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| MailError::DnsLookup(format!("MX lookup for {} failed: {}", domain, e)))?;

        let records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                preference: mx.preference(),
                exchange: mx.exchange().to_string().trim_end_matches('.').to_string(),
            })
            .collect();

        debug!("Found {} MX record(s) for {}", records.len(), domain);
        Ok(records)
    }

    async fn txt(&self, domain: &str) -> Result<Vec<String>> {
        let lookup = self
            .resolver
            .txt_lookup(domain)
            .await
            .map_err(|e| MailError::DnsLookup(format!("TXT lookup for {} failed: {}", domain, e)))?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect())
    }

    async fn ips(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| MailError::DnsLookup(format!("Failed to resolve {}: {}", host, e)))?;

        Ok(lookup.iter().collect())
    }
}
