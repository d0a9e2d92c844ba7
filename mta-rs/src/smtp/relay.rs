//! Direct MX delivery
//!
//! No smart host: the recipient domain's MX records are resolved and tried
//! in ascending preference order until one accepts. A domain without MX
//! records (or whose lookup fails) is its own single candidate. Every
//! attempt draws from one shared deadline.

use crate::config::RelayConfig;
use crate::dns::DnsResolver;
use crate::error::{MailError, Result};
use crate::smtp::client::SmtpClient;
use crate::utils::domain_of;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxCandidate {
    pub preference: u16,
    pub host: String,
    pub port: u16,
}

impl MxCandidate {
    /// `host:port`, with IPv6 literals bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Outcome of a successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Candidate that accepted the message
    pub host: String,
    /// Attempts made, including the successful one
    pub attempts: usize,
}

pub struct OutboundRelay {
    resolver: Arc<dyn DnsResolver>,
    config: RelayConfig,
    helo_name: String,
}

impl OutboundRelay {
    pub fn new(resolver: Arc<dyn DnsResolver>, config: RelayConfig, helo_name: &str) -> Self {
        Self {
            resolver,
            config,
            helo_name: helo_name.to_string(),
        }
    }

    /// Ordered candidate list for `domain`
    ///
    /// Empty only when the domain publishes a null MX (RFC 7505) and accepts
    /// no mail at all.
    pub async fn candidates(&self, domain: &str) -> Vec<MxCandidate> {
        let records = match self.resolver.mx(domain).await {
            Ok(records) => records,
            Err(e) => {
                debug!("MX lookup for {} failed, falling back to the domain: {}", domain, e);
                Vec::new()
            }
        };

        if records
            .iter()
            .any(|mx| mx.exchange.trim_end_matches('.').is_empty())
        {
            info!("{} publishes a null MX, it accepts no mail", domain);
            return Vec::new();
        }

        let mut candidates: Vec<MxCandidate> = records
            .into_iter()
            .map(|mx| MxCandidate {
                preference: mx.preference,
                host: mx.exchange,
                port: self.config.port,
            })
            .collect();

        if candidates.is_empty() {
            candidates.push(MxCandidate {
                preference: 0,
                host: domain.to_string(),
                port: self.config.port,
            });
        }

        // Stable: equal preferences keep DNS order
        candidates.sort_by_key(|c| c.preference);
        candidates
    }

    /// Deliver `data` to `to`, trying each MX candidate in order
    pub async fn deliver(&self, from: &str, to: &str, data: &[u8]) -> Result<DeliveryReport> {
        let domain = domain_of(to)
            .ok_or_else(|| MailError::InvalidEmail(format!("Recipient {} has no domain", to)))?;

        let candidates = self.candidates(&domain).await;
        if candidates.is_empty() {
            return Err(MailError::RelayExhausted {
                domain,
                attempts: 0,
                last_error: "domain publishes a null MX".to_string(),
            });
        }
        debug!(
            "Relaying to {} via {:?}",
            to,
            candidates.iter().map(|c| c.address()).collect::<Vec<_>>()
        );

        self.deliver_via(&domain, &candidates, from, to, data).await
    }

    /// Attempt `candidates` in the given order; first success wins
    pub async fn deliver_via(
        &self,
        domain: &str,
        candidates: &[MxCandidate],
        from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<DeliveryReport> {
        let deadline = Instant::now() + Duration::from_secs(self.config.deadline_secs);
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let command_timeout = Duration::from_secs(self.config.command_timeout_secs);

        let mut attempts = 0;
        let mut last_error = String::from("no candidates");

        for candidate in candidates {
            let now = Instant::now();
            if now >= deadline {
                warn!("Relay deadline for {} exhausted after {} attempt(s)", domain, attempts);
                last_error = format!("deadline exhausted ({})", last_error);
                break;
            }
            let remaining = deadline - now;

            attempts += 1;
            let address = candidate.address();
            let client = SmtpClient::new(&address, &self.helo_name, command_timeout);

            let attempt = tokio::time::timeout(
                remaining,
                client.send_mail(connect_timeout.min(remaining), from, to, data),
            )
            .await;

            match attempt {
                Ok(Ok(())) => {
                    info!(
                        "Delivered to {} via {} (attempt {})",
                        to, address, attempts
                    );
                    return Ok(DeliveryReport {
                        host: address,
                        attempts,
                    });
                }
                Ok(Err(e)) => {
                    warn!("Delivery to {} via {} failed: {}", to, address, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!("Delivery to {} via {} hit the relay deadline", to, address);
                    last_error = format!("{} timed out", address);
                }
            }
        }

        Err(MailError::RelayExhausted {
            domain: domain.to_string(),
            attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{MockDnsResolver, MxRecord};

    fn relay_with_mx(result: Result<Vec<MxRecord>>) -> OutboundRelay {
        let mut resolver = MockDnsResolver::new();
        let mut result = Some(result);
        resolver
            .expect_mx()
            .times(1)
            .returning(move |_| result.take().unwrap_or_else(|| Ok(Vec::new())));
        OutboundRelay::new(Arc::new(resolver), RelayConfig::default(), "mail.example.org")
    }

    #[tokio::test]
    async fn test_candidates_sorted_by_preference() {
        let relay = relay_with_mx(Ok(vec![
            MxRecord {
                preference: 20,
                exchange: "backup.example.com".to_string(),
            },
            MxRecord {
                preference: 5,
                exchange: "primary.example.com".to_string(),
            },
        ]));

        let candidates = relay.candidates("example.com").await;
        let hosts: Vec<&str> = candidates.iter().map(|c| c.host.as_str()).collect();
        assert_eq!(hosts, vec!["primary.example.com", "backup.example.com"]);
        assert_eq!(candidates[0].address(), "primary.example.com:25");
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back_to_domain() {
        let relay = relay_with_mx(Err(MailError::DnsLookup("NXDOMAIN".to_string())));
        let candidates = relay.candidates("example.com").await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].host, "example.com");
    }

    #[tokio::test]
    async fn test_no_records_falls_back_to_domain() {
        let relay = relay_with_mx(Ok(Vec::new()));
        let candidates = relay.candidates("example.net").await;
        assert_eq!(candidates[0].address(), "example.net:25");
    }

    #[tokio::test]
    async fn test_null_mx_fails_without_fallback() {
        let null_mx = || {
            Ok(vec![MxRecord {
                preference: 0,
                exchange: String::new(),
            }])
        };
        assert!(relay_with_mx(null_mx()).candidates("nomail.example").await.is_empty());

        let err = relay_with_mx(null_mx())
            .deliver("a@example.org", "b@nomail.example", b"x\r\n")
            .await
            .unwrap_err();
        match err {
            MailError::RelayExhausted { domain, attempts, last_error } => {
                assert_eq!(domain, "nomail.example");
                assert_eq!(attempts, 0);
                assert!(last_error.contains("null MX"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let candidate = MxCandidate {
            preference: 0,
            host: "::1".to_string(),
            port: 2525,
        };
        assert_eq!(candidate.address(), "[::1]:2525");
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        // Bind then drop to get ports that refuse connections
        let mut candidates = Vec::new();
        for preference in [10, 20] {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            candidates.push(MxCandidate {
                preference,
                host: "127.0.0.1".to_string(),
                port,
            });
        }

        let relay = OutboundRelay::new(
            Arc::new(MockDnsResolver::new()),
            RelayConfig::default(),
            "mail.example.org",
        );
        let err = relay
            .deliver_via("example.com", &candidates, "a@example.org", "b@example.com", b"x\r\n")
            .await
            .unwrap_err();

        match err {
            MailError::RelayExhausted { domain, attempts, .. } => {
                assert_eq!(domain, "example.com");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
