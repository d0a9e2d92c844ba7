//! Persistent sender / IP block list
//!
//! Two sets: email patterns (`user@domain` or `*@domain`) and IP addresses
//! in canonical text form. Every mutation rewrites the whole document.

use crate::error::{MailError, Result};
use crate::utils::{domain_of, normalize_address};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// On-disk shape of the block list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistDocument {
    #[serde(default)]
    pub emails: BTreeSet<String>,
    #[serde(default)]
    pub ips: BTreeSet<String>,
}

impl BlocklistDocument {
    fn matches_sender(&self, sender: &str) -> bool {
        let sender = normalize_address(sender);
        if self.emails.contains(&sender) {
            return true;
        }
        match domain_of(&sender) {
            Some(domain) => self.emails.contains(&format!("*@{}", domain)),
            None => false,
        }
    }

    /// Rewrite hand-edited IP entries into canonical form
    fn canonicalize(&mut self) {
        self.ips = std::mem::take(&mut self.ips)
            .into_iter()
            .map(|entry| match canonical_ip(&entry) {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("Ignoring unparseable block list IP {:?}", entry);
                    entry
                }
            })
            .collect();
    }
}

pub struct Blocklist {
    path: Option<PathBuf>,
    document: RwLock<BlocklistDocument>,
}

impl Blocklist {
    /// Block list that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: RwLock::new(BlocklistDocument::default()),
        }
    }

    /// Load the document at `path`; a missing file is an empty list
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut document: BlocklistDocument = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No block list at {}, starting empty", path.display());
                BlocklistDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        document.canonicalize();

        info!(
            "Block list loaded: {} address pattern(s), {} IP(s)",
            document.emails.len(),
            document.ips.len()
        );

        Ok(Self {
            path: Some(path),
            document: RwLock::new(document),
        })
    }

    pub async fn is_sender_blocked(&self, sender: &str) -> bool {
        self.document.read().await.matches_sender(sender)
    }

    /// IPv4-mapped IPv6 peers match their IPv4 entry
    pub async fn is_ip_blocked(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical().to_string();
        self.document.read().await.ips.contains(&ip)
    }

    /// Block an exact address or a whole domain (`*@domain`)
    pub async fn block_email(&self, pattern: &str) -> Result<bool> {
        let pattern = validate_pattern(pattern)?;
        let added = self.update(|doc| doc.emails.insert(pattern.clone())).await?;
        if added {
            info!("Blocked sender pattern {}", pattern);
        }
        Ok(added)
    }

    pub async fn unblock_email(&self, pattern: &str) -> Result<bool> {
        let pattern = normalize_address(pattern);
        let removed = self.update(|doc| doc.emails.remove(&pattern)).await?;
        if removed {
            info!("Unblocked sender pattern {}", pattern);
        }
        Ok(removed)
    }

    pub async fn block_ip(&self, ip: &str) -> Result<bool> {
        let ip = canonical_ip(ip)?;
        let added = self.update(|doc| doc.ips.insert(ip.clone())).await?;
        if added {
            info!("Blocked IP {}", ip);
        }
        Ok(added)
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<bool> {
        let ip = canonical_ip(ip).unwrap_or_else(|_| ip.trim().to_string());
        let removed = self.update(|doc| doc.ips.remove(&ip)).await?;
        if removed {
            info!("Unblocked IP {}", ip);
        }
        Ok(removed)
    }

    pub async fn snapshot(&self) -> BlocklistDocument {
        self.document.read().await.clone()
    }

    /// Apply `change` to a copy, persist it, then swap it in
    ///
    /// Nothing is written and memory is untouched when `change` reports no
    /// difference or when the write fails.
    async fn update<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut BlocklistDocument) -> bool,
    {
        let mut document = self.document.write().await;
        let mut next = document.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next).await?;
        *document = next;
        Ok(true)
    }

    /// Write the whole document: temp file first, then rename over the target
    async fn persist(&self, document: &BlocklistDocument) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(document)?).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

fn canonical_ip(ip: &str) -> Result<String> {
    let ip = ip.trim();
    ip.parse::<IpAddr>()
        .map(|addr| addr.to_canonical().to_string())
        .map_err(|_| MailError::Parse(format!("Invalid IP address: {}", ip)))
}

fn validate_pattern(pattern: &str) -> Result<String> {
    let pattern = normalize_address(pattern);
    match pattern.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            if local.contains('*') && local != "*" {
                return Err(MailError::Parse(format!(
                    "Only whole-domain wildcards are supported: {}",
                    pattern
                )));
            }
            Ok(pattern)
        }
        _ => Err(MailError::InvalidEmail(format!(
            "Block pattern must be user@domain or *@domain: {}",
            pattern
        ))),
    }
}
