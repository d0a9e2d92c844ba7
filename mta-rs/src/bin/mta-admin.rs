//! Operator CLI for mta-rs
//!
//! Works directly on the persisted documents, so it can run while the server
//! is stopped. A running server picks up block-list edits on restart.
//!
//! # Usage
//!
//! ```bash
//! # Block every sender of a domain
//! mta-admin block-email '*@spam.example'
//!
//! # Block / unblock a client IP
//! mta-admin block-ip 203.0.113.7
//! mta-admin unblock-ip 203.0.113.7
//!
//! # Show the TXT record to publish for DKIM
//! mta-admin --config /etc/mta-rs/config.toml dkim-record
//!
//! # Inspect the threads of one identity
//! mta-admin threads bob
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mta_rs::authentication::DkimSigner;
use mta_rs::config::Config;
use mta_rs::security::Blocklist;
use mta_rs::storage::MessageStore;
use std::path::Path;

#[derive(Parser)]
#[command(name = "mta-admin")]
#[command(about = "Manage the mta-rs block list, DKIM record and message log", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Block a sender (`user@domain` or `*@domain`)
    BlockEmail {
        pattern: String,
    },
    /// Remove a sender pattern from the block list
    UnblockEmail {
        pattern: String,
    },
    /// Block a client IP address
    BlockIp {
        ip: String,
    },
    /// Remove an IP address from the block list
    UnblockIp {
        ip: String,
    },
    /// Print the block list
    ListBlocks,
    /// Print the DKIM TXT record for the configured key
    DkimRecord,
    /// List the threads of an identity, newest first
    Threads {
        /// Username for local accounts, address for external ones
        identity: String,
    },
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Ok(Config::from_file(path)?)
    } else {
        Ok(Config::default())
    }
}

async fn open_blocklist(config: &Config) -> anyhow::Result<Blocklist> {
    let Some(path) = &config.guard.blocklist_path else {
        bail!("guard.blocklist_path is not set, nothing to manage");
    };
    Blocklist::load(path)
        .await
        .with_context(|| format!("Failed to load block list {}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::BlockEmail { pattern } => {
            let blocklist = open_blocklist(&config).await?;
            if blocklist.block_email(&pattern).await? {
                println!("✓ Blocked {}", pattern);
            } else {
                println!("{} was already blocked", pattern);
            }
        }
        Commands::UnblockEmail { pattern } => {
            let blocklist = open_blocklist(&config).await?;
            if blocklist.unblock_email(&pattern).await? {
                println!("✓ Unblocked {}", pattern);
            } else {
                eprintln!("Error: {} is not blocked", pattern);
                std::process::exit(1);
            }
        }
        Commands::BlockIp { ip } => {
            let blocklist = open_blocklist(&config).await?;
            if blocklist.block_ip(&ip).await? {
                println!("✓ Blocked {}", ip);
            } else {
                println!("{} was already blocked", ip);
            }
        }
        Commands::UnblockIp { ip } => {
            let blocklist = open_blocklist(&config).await?;
            if blocklist.unblock_ip(&ip).await? {
                println!("✓ Unblocked {}", ip);
            } else {
                eprintln!("Error: {} is not blocked", ip);
                std::process::exit(1);
            }
        }
        Commands::ListBlocks => {
            let snapshot = open_blocklist(&config).await?.snapshot().await;
            println!("Blocked senders ({}):", snapshot.emails.len());
            for email in &snapshot.emails {
                println!("  {}", email);
            }
            println!("Blocked IPs ({}):", snapshot.ips.len());
            for ip in &snapshot.ips {
                println!("  {}", ip);
            }
        }
        Commands::DkimRecord => {
            let Some(signer) = DkimSigner::from_config(&config.dkim).await? else {
                bail!("DKIM is disabled or has no private_key_path");
            };
            println!("{} IN TXT \"{}\"", signer.dns_name(), signer.public_key_record()?);
        }
        Commands::Threads { identity } => {
            let store = MessageStore::open(&config.storage.message_log_path).await?;
            let inbox = store.inbox(&identity).await;

            println!(
                "{}: {} thread(s), {} unread",
                identity,
                inbox.threads.len(),
                inbox.unread_count
            );
            for thread in inbox.threads_by_recency() {
                println!(
                    "{} {} [{} message(s)] {} {}",
                    if thread.has_unread { "*" } else { " " },
                    thread.latest.created_at.format("%Y-%m-%d %H:%M"),
                    thread.messages.len(),
                    thread.root.from,
                    thread.root.subject
                );
            }
        }
    }

    Ok(())
}
