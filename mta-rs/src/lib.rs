//! mta-rs: mail transfer and threading engine
//!
//! Receives mail over SMTP, relays outbound mail straight to the recipient's
//! MX hosts, DKIM-signs what it sends, and keeps a flat message log from
//! which per-identity conversation threads are rebuilt.
//!
//! # Features
//!
//! - **Inbound SMTP** (RFC 5321): not an open relay; only trusted origins
//!   may target external recipients
//! - **Abuse guard**: per-IP connection and per-sender daily quotas, plus a
//!   persistent block list checked before any counter moves
//! - **Outbound relay**: MX fallback in preference order under one deadline
//! - **Content decoding**: multipart, base64 / quoted-printable, gzip / ZIP
//!   DMARC reports, PGP blocks
//! - **Threading**: `thread_id` and inboxes derived from the log alone
//!
//! # Example
//!
//! ```no_run
//! use mta_rs::config::Config;
//! use mta_rs::directory::StaticDirectory;
//! use mta_rs::mime::ContentDecoder;
//! use mta_rs::security::{Blocklist, Guard, RateLimiter};
//! use mta_rs::smtp::{SmtpContext, SmtpServer};
//! use mta_rs::storage::MessageStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mta_rs::Result<()> {
//!     let config = Config::default();
//!     let guard = Guard::new(
//!         Arc::new(Blocklist::in_memory()),
//!         Arc::new(RateLimiter::from_config(&config.guard)),
//!     );
//!
//!     let ctx = SmtpContext {
//!         directory: Arc::new(StaticDirectory::new(&config.accounts)),
//!         decoder: Arc::new(ContentDecoder::new(&config.decoder)),
//!         store: Arc::new(MessageStore::open(&config.storage.message_log_path).await?),
//!         guard: Arc::new(guard),
//!         config: Arc::new(config),
//!         spf: None,
//!         outbound: None,
//!     };
//!
//!     SmtpServer::new(ctx).run().await
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: Inbound server, outbound relay, mailer and queue
//! - [`storage`]: Message log, threading, artifacts
//! - [`mime`]: Content decoding
//! - [`authentication`]: DKIM signing, SPF evaluation
//! - [`security`]: Rate limits and block list
//! - [`dns`]: MX / TXT / address lookups
//! - [`directory`]: Local account lookup
//! - [`utils`]: Address validation helpers

pub mod authentication;
pub mod config;
pub mod directory;
pub mod dns;
pub mod error;
pub mod mime;
pub mod security;
pub mod smtp;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};

use config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber; `RUST_LOG` overrides `logging.level`
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mta_rs={}", config.level, config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        "compact" => registry.with(fmt::layer().compact()).init(),
        _ => registry.with(fmt::layer().pretty()).init(),
    }
}
