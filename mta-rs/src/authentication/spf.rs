//! SPF (Sender Policy Framework) evaluation
//!
//! Advisory only: the session logs the result and never rejects on it.
//! The policy is deliberately lenient. `+all`, `~all` and `?all` count as
//! a pass, and so does a record where no mechanism matched. Only an explicit
//! `-` match fails. Supported mechanisms: `ip4`, `ip6` (with CIDR), `a`,
//! `a:<domain>`, `all`; anything else is skipped.

use crate::dns::DnsResolver;
use crate::utils::domain_of;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// SPF validation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    /// Sender is authorized (including the lenient cases)
    Pass,
    /// An explicit `-` mechanism matched
    Fail,
    /// No `v=spf1` record published
    None,
    /// DNS failed while evaluating
    TempError,
    /// Sender has no domain to check
    PermError,
}

impl SpfResult {
    pub fn passes(&self) -> bool {
        matches!(self, SpfResult::Pass)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

impl std::fmt::Display for SpfResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn split(term: &str) -> (Self, &str) {
        match term.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &term[1..]),
            Some(b'-') => (Qualifier::Fail, &term[1..]),
            Some(b'~') => (Qualifier::SoftFail, &term[1..]),
            Some(b'?') => (Qualifier::Neutral, &term[1..]),
            _ => (Qualifier::Pass, term),
        }
    }

    fn result(self) -> SpfResult {
        match self {
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::Pass | Qualifier::SoftFail | Qualifier::Neutral => SpfResult::Pass,
        }
    }
}

pub struct SpfValidator {
    resolver: Arc<dyn DnsResolver>,
}

impl SpfValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Check whether `ip` may send mail for the domain of `sender`
    pub async fn check(&self, ip: IpAddr, sender: &str) -> SpfResult {
        let Some(domain) = domain_of(sender) else {
            debug!("SPF: sender {:?} has no domain", sender);
            return SpfResult::PermError;
        };

        let records = match self.resolver.txt(&domain).await {
            Ok(records) => records,
            Err(e) => {
                debug!("SPF: TXT lookup for {} failed: {}", domain, e);
                return SpfResult::TempError;
            }
        };

        let Some(record) = select_record(&records) else {
            debug!("SPF: no v=spf1 record for {}", domain);
            return SpfResult::None;
        };

        let result = self.evaluate(record, &domain, ip).await;
        debug!("SPF {} for {} from {} ({})", result, domain, ip, record);
        result
    }

    /// Evaluate one `v=spf1` record; first matching mechanism decides
    pub async fn evaluate(&self, record: &str, domain: &str, ip: IpAddr) -> SpfResult {
        for term in record.split_whitespace().skip(1) {
            let (qualifier, mechanism) = Qualifier::split(term);
            let (name, argument) = match mechanism.split_once(':') {
                Some((name, argument)) => (name, Some(argument)),
                None => (mechanism, None),
            };
            let base = name.split('/').next().unwrap_or(name);

            let matched = match base.to_lowercase().as_str() {
                "all" => true,
                "ip4" | "ip6" => argument.is_some_and(|network| ip_matches(network, ip)),
                "a" => self.a_matches(&mechanism[1..], domain, ip).await,
                other => {
                    debug!("SPF: skipping unsupported term {}", other);
                    false
                }
            };

            if matched {
                return qualifier.result();
            }
        }

        SpfResult::Pass
    }

    /// `a`, `a:host`, `a/24`, `a:host/24//64`; a failed lookup is no match
    async fn a_matches(&self, spec: &str, domain: &str, ip: IpAddr) -> bool {
        let (host, v4_prefix, v6_prefix) = parse_a_spec(spec, domain);
        match self.resolver.ips(host).await {
            Ok(addresses) => addresses.iter().any(|address| {
                let prefix = if address.is_ipv4() { v4_prefix } else { v6_prefix };
                IpNet::new(*address, prefix).is_ok_and(|net| net.contains(&ip))
            }),
            Err(e) => {
                debug!("SPF: A lookup for {} failed, treating as no match: {}", host, e);
                false
            }
        }
    }
}

/// Split what follows `a` into target host and the v4 / v6 prefix lengths
fn parse_a_spec<'a>(spec: &'a str, domain: &'a str) -> (&'a str, u8, u8) {
    let (host, cidr) = match spec.strip_prefix(':') {
        Some(rest) => match rest.find('/') {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, ""),
        },
        None => (domain, spec),
    };

    let (v4, v6) = match cidr.split_once("//") {
        Some((v4, v6)) => (v4, Some(v6)),
        None => (cidr, None),
    };
    let v4 = v4.strip_prefix('/').and_then(|p| p.parse().ok()).unwrap_or(32);
    let v6 = v6.and_then(|p| p.parse().ok()).unwrap_or(128);
    (host, v4, v6)
}

fn select_record(records: &[String]) -> Option<&str> {
    records
        .iter()
        .map(|r| r.trim())
        .find(|r| r.eq_ignore_ascii_case("v=spf1") || r.to_lowercase().starts_with("v=spf1 "))
}

/// `network` is an address or CIDR; a bare address matches exactly
fn ip_matches(network: &str, ip: IpAddr) -> bool {
    if let Ok(net) = network.parse::<IpNet>() {
        return net.contains(&ip);
    }
    match network.parse::<IpAddr>() {
        Ok(address) => address == ip,
        Err(_) => {
            debug!("SPF: malformed network {}", network);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockDnsResolver;
    use crate::error::MailError;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn validator_with_txt(records: Vec<String>) -> SpfValidator {
        let mut resolver = MockDnsResolver::new();
        resolver
            .expect_txt()
            .returning(move |_| Ok(records.clone()));
        resolver
            .expect_ips()
            .returning(|host| match host {
                "example.org" => Ok(vec!["192.0.2.1".parse().unwrap()]),
                "mail.example.org" => Ok(vec!["2001:db8::25".parse().unwrap()]),
                _ => Ok(Vec::new()),
            });
        SpfValidator::new(Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_ip4_cidr_pass_and_hard_fail() {
        let validator = validator_with_txt(vec![
            "google-site-verification=abc".to_string(),
            "v=spf1 ip4:203.0.113.0/24 -all".to_string(),
        ]);

        assert_eq!(validator.check(ip("203.0.113.77"), "a@example.org").await, SpfResult::Pass);
        assert_eq!(validator.check(ip("198.51.100.1"), "a@example.org").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_lenient_all_qualifiers() {
        for record in ["v=spf1 ~all", "v=spf1 ?all", "v=spf1 +all", "v=spf1 ip4:10.0.0.1"] {
            let validator = validator_with_txt(vec![record.to_string()]);
            assert_eq!(
                validator.check(ip("198.51.100.1"), "a@example.org").await,
                SpfResult::Pass,
                "{}",
                record
            );
        }
    }

    #[tokio::test]
    async fn test_a_mechanisms_and_ip6() {
        let validator = validator_with_txt(vec![
            "v=spf1 a a:mail.example.org ip6:2001:db8:1::/48 -all".to_string(),
        ]);

        assert!(validator.check(ip("192.0.2.1"), "x@example.org").await.passes());
        assert!(validator.check(ip("2001:db8::25"), "x@example.org").await.passes());
        assert!(validator.check(ip("2001:db8:1::99"), "x@example.org").await.passes());
        assert_eq!(validator.check(ip("192.0.2.2"), "x@example.org").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_failed_a_lookup_does_not_stop_evaluation() {
        let mut resolver = MockDnsResolver::new();
        resolver
            .expect_txt()
            .returning(|_| Ok(vec!["v=spf1 a:gone.example ip4:198.51.100.0/24 -all".to_string()]));
        resolver
            .expect_ips()
            .returning(|host| Err(MailError::DnsLookup(format!("NXDOMAIN {}", host))));
        let validator = SpfValidator::new(Arc::new(resolver));

        assert_eq!(validator.check(ip("198.51.100.7"), "a@example.org").await, SpfResult::Pass);
        assert_eq!(validator.check(ip("203.0.113.7"), "a@example.org").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_a_mechanism_with_prefix() {
        let validator = validator_with_txt(vec!["v=spf1 a/24 a:mail.example.org//64 -all".to_string()]);

        assert!(validator.check(ip("192.0.2.200"), "x@example.org").await.passes());
        assert!(validator.check(ip("2001:db8::ffff"), "x@example.org").await.passes());
        assert_eq!(validator.check(ip("192.0.3.1"), "x@example.org").await, SpfResult::Fail);
        assert_eq!(validator.check(ip("2001:db8:0:1::1"), "x@example.org").await, SpfResult::Fail);
    }

    #[test]
    fn test_parse_a_spec() {
        assert_eq!(parse_a_spec("", "example.org"), ("example.org", 32, 128));
        assert_eq!(parse_a_spec("/24", "example.org"), ("example.org", 24, 128));
        assert_eq!(parse_a_spec(":mx.example.org/28//64", "example.org"), ("mx.example.org", 28, 64));
        assert_eq!(parse_a_spec("//48", "example.org"), ("example.org", 32, 48));
    }

    #[tokio::test]
    async fn test_dash_qualified_match_fails() {
        let validator = validator_with_txt(vec!["v=spf1 -ip4:192.0.2.9 +all".to_string()]);
        assert_eq!(validator.check(ip("192.0.2.9"), "a@example.org").await, SpfResult::Fail);
        assert_eq!(validator.check(ip("192.0.2.8"), "a@example.org").await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn test_no_record_and_dns_error() {
        let validator = validator_with_txt(vec!["unrelated".to_string()]);
        let result = validator.check(ip("192.0.2.1"), "a@example.org").await;
        assert_eq!(result, SpfResult::None);
        assert!(!result.passes());

        let mut resolver = MockDnsResolver::new();
        resolver
            .expect_txt()
            .returning(|_| Err(MailError::DnsLookup("SERVFAIL".to_string())));
        let validator = SpfValidator::new(Arc::new(resolver));
        assert_eq!(validator.check(ip("192.0.2.1"), "a@example.org").await, SpfResult::TempError);
        assert_eq!(validator.check(ip("192.0.2.1"), "nodomain").await, SpfResult::PermError);
    }
}
