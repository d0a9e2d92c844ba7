//! Rate & abuse guard
//!
//! Front door for the SMTP session: block-list checks always run first and
//! short-circuit, so a blocked IP or sender never touches a rate counter.

use super::blocklist::Blocklist;
use super::rate_limit::RateLimiter;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// Outcome of a guard check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Block list hit (554)
    Blocked,
    /// Quota exhausted (421)
    RateLimited,
}

pub struct Guard {
    blocklist: Arc<Blocklist>,
    limiter: Arc<RateLimiter>,
}

impl Guard {
    pub fn new(blocklist: Arc<Blocklist>, limiter: Arc<RateLimiter>) -> Self {
        Self { blocklist, limiter }
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Checked once per connection; trusted origins skip the quota
    pub async fn admit_connection(&self, ip: &IpAddr, trusted: bool) -> Verdict {
        if self.blocklist.is_ip_blocked(ip).await {
            warn!("Connection from blocked IP {}", ip);
            return Verdict::Blocked;
        }

        if trusted {
            return Verdict::Allow;
        }

        if !self.limiter.check_connection(ip).await {
            return Verdict::RateLimited;
        }

        Verdict::Allow
    }

    /// Checked on MAIL FROM for untrusted connections
    pub async fn admit_sender(&self, sender: &str) -> Verdict {
        if self.blocklist.is_sender_blocked(sender).await {
            warn!("Rejected blocked sender {}", sender);
            return Verdict::Blocked;
        }

        if !self.limiter.check_sender(sender).await {
            return Verdict::RateLimited;
        }

        Verdict::Allow
    }
}
