//! Security module
//!
//! Abuse defences for the inbound server:
//! - [`blocklist`]: persistent sender / IP block list
//! - [`rate_limit`]: per-IP connection and per-sender message counters
//! - [`guard`]: ordering of the two (block list first, then quotas)

pub mod blocklist;
pub mod guard;
pub mod rate_limit;

pub use blocklist::{Blocklist, BlocklistDocument};
pub use guard::{Guard, Verdict};
pub use rate_limit::{RateLimitEntry, RateLimiter, WindowLimit};
