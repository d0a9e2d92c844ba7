//! Rate limiting for inbound SMTP
//!
//! Two independent fixed-window counter tables:
//! - connections per IP (default: per hour)
//! - messages per sender address (default: per day, case-insensitive)
//!
//! A counter past its reset time is treated as absent and recreated rather
//! than incremented. Expired counters are removed by [`RateLimiter::sweep`],
//! which [`RateLimiter::spawn_sweeper`] runs on a fixed interval.
//!
//! # Example
//! ```no_run
//! use mta_rs::security::rate_limit::RateLimiter;
//! use std::net::IpAddr;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::default();
//! let ip: IpAddr = "192.0.2.1".parse()?;
//!
//! if limiter.check_connection(&ip).await {
//!     println!("Connection allowed");
//! } else {
//!     println!("Too many connections");
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::GuardConfig;
use crate::utils::normalize_address;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Count and reset time for one key
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_at: Instant,
}

impl RateLimitEntry {
    fn new(window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: Instant::now() + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.reset_at
    }
}

/// Limit and window for one counter table
#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    pub max: u32,
    pub window: Duration,
}

/// One table of fixed-window counters behind a single lock
struct CounterTable<K> {
    limit: WindowLimit,
    entries: RwLock<HashMap<K, RateLimitEntry>>,
}

impl<K: Eq + Hash + Clone> CounterTable<K> {
    fn new(limit: WindowLimit) -> Self {
        Self {
            limit,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn try_increment(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| RateLimitEntry::new(self.limit.window));

        if entry.is_expired(now) {
            *entry = RateLimitEntry::new(self.limit.window);
        }

        if entry.count >= self.limit.max {
            return false;
        }

        entry.count += 1;
        true
    }

    async fn count(&self, key: &K) -> u32 {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.count,
            _ => 0,
        }
    }

    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn reset(&self, key: &K) {
        self.entries.write().await.remove(key);
    }
}

/// Per-IP connection and per-sender message limiter
pub struct RateLimiter {
    connections: CounterTable<IpAddr>,
    senders: CounterTable<String>,
}

impl RateLimiter {
    pub fn new(connections: WindowLimit, senders: WindowLimit) -> Self {
        Self {
            connections: CounterTable::new(connections),
            senders: CounterTable::new(senders),
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(
            WindowLimit {
                max: config.connections_per_hour,
                window: HOUR,
            },
            WindowLimit {
                max: config.messages_per_day,
                window: DAY,
            },
        )
    }

    /// Count a new connection from `ip`; `false` once the quota is used up
    pub async fn check_connection(&self, ip: &IpAddr) -> bool {
        let allowed = self.connections.try_increment(ip).await;
        if !allowed {
            warn!(
                "Connection limit exceeded for IP {} ({} per {:?})",
                ip, self.connections.limit.max, self.connections.limit.window
            );
        }
        allowed
    }

    /// Count a new message from `sender`; `false` once the daily cap is reached
    pub async fn check_sender(&self, sender: &str) -> bool {
        let key = normalize_address(sender);
        let allowed = self.senders.try_increment(&key).await;
        if !allowed {
            warn!(
                "Message limit exceeded for sender {} ({} per {:?})",
                key, self.senders.limit.max, self.senders.limit.window
            );
        }
        allowed
    }

    pub async fn connection_count(&self, ip: &IpAddr) -> u32 {
        self.connections.count(ip).await
    }

    pub async fn sender_count(&self, sender: &str) -> u32 {
        self.senders.count(&normalize_address(sender)).await
    }

    pub async fn reset_connection(&self, ip: &IpAddr) {
        self.connections.reset(ip).await;
        debug!("Reset connection counter for {}", ip);
    }

    pub async fn reset_sender(&self, sender: &str) {
        self.senders.reset(&normalize_address(sender)).await;
    }

    /// Number of live counter entries across both tables
    pub async fn tracked_entries(&self) -> usize {
        self.connections.len().await + self.senders.len().await
    }

    /// Remove every expired counter; returns how many were dropped
    pub async fn sweep(&self) -> usize {
        let removed = self.connections.sweep().await + self.senders.sweep().await;
        if removed > 0 {
            debug!("Rate limiter sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}
