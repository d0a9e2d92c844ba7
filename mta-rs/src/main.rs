use mta_rs::authentication::{DkimSigner, SpfValidator};
use mta_rs::config::Config;
use mta_rs::directory::StaticDirectory;
use mta_rs::dns::SystemResolver;
use mta_rs::mime::ContentDecoder;
use mta_rs::security::{Blocklist, Guard, RateLimiter};
use mta_rs::smtp::{Mailer, OutboundQueue, OutboundRelay, QueueWorker, SmtpContext, SmtpServer};
use mta_rs::storage::{ArtifactStore, MessageStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Jobs buffered between sessions and the relay worker, at least one
/// transaction's worth of recipients
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let (mut config, loaded) = if Path::new(&config_path).exists() {
        (Config::from_file(&config_path)?, true)
    } else {
        (Config::default(), false)
    };

    mta_rs::init_logging(&config.logging);
    info!("Starting mta-rs v{}", env!("CARGO_PKG_VERSION"));
    if loaded {
        info!("Configuration loaded from {}", config_path);
    } else {
        info!("No config file at {}, using defaults", config_path);
    }

    if config.server.hostname.trim().is_empty() {
        config.server.hostname = gethostname::gethostname().to_string_lossy().to_string();
    }

    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Domain: {}", config.server.domain);
    info!("  Message log: {}", config.storage.message_log_path);

    // Abuse guard
    let blocklist = match &config.guard.blocklist_path {
        Some(path) => Blocklist::load(path).await?,
        None => Blocklist::in_memory(),
    };
    let limiter = Arc::new(RateLimiter::from_config(&config.guard));
    limiter
        .clone()
        .spawn_sweeper(Duration::from_secs(config.guard.sweep_interval_secs));
    let guard = Arc::new(Guard::new(Arc::new(blocklist), limiter));

    // Storage
    let store = Arc::new(MessageStore::open(&config.storage.message_log_path).await?);
    let artifacts = Arc::new(ArtifactStore::new(&config.storage.artifacts_path));
    info!("  {} stored message(s)", store.len().await);

    let directory = Arc::new(StaticDirectory::new(&config.accounts));
    if directory.is_empty() {
        warn!("No [[accounts]] configured, every local recipient will be rejected");
    }

    let decoder = Arc::new(ContentDecoder::new(&config.decoder).with_artifacts(artifacts));

    // Outbound path
    let resolver = Arc::new(SystemResolver::new());
    let spf = config
        .guard
        .spf_enabled
        .then(|| Arc::new(SpfValidator::new(resolver.clone())));
    let relay = Arc::new(OutboundRelay::new(
        resolver,
        config.relay.clone(),
        &config.server.hostname,
    ));

    let mut mailer = Mailer::new(
        config.server.clone(),
        directory.clone(),
        store.clone(),
        relay,
    );
    match DkimSigner::from_config(&config.dkim).await {
        Ok(Some(signer)) => mailer = mailer.with_signer(Arc::new(signer)),
        Ok(None) => info!("DKIM signing disabled"),
        Err(e) => warn!("DKIM signer unavailable, sending unsigned: {}", e),
    }

    let (outbound, receiver) = OutboundQueue::channel(OUTBOUND_QUEUE_CAPACITY.max(config.smtp.max_recipients));
    QueueWorker::new(receiver, Arc::new(mailer), store.clone()).spawn();

    let ctx = SmtpContext {
        config: Arc::new(config),
        guard,
        store,
        directory,
        decoder,
        spf,
        outbound: Some(outbound),
    };

    let server = SmtpServer::new(ctx);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("SMTP server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
