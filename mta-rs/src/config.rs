use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub relay: RelayConfig,
    pub dkim: DkimConfig,
    pub guard: GuardConfig,
    pub decoder: DecoderConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Mail domain this server is the final destination for
    pub domain: String,
    /// Name used in the greeting banner and in EHLO when relaying
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub max_errors: usize,
    pub command_timeout_secs: u64,
    pub data_timeout_secs: u64,
    /// Peer IPs treated as pre-authenticated local callers
    pub trusted_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Budget shared by every MX attempt of a single delivery
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DkimConfig {
    pub enabled: bool,
    pub domain: String,
    pub selector: String,
    pub private_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    pub connections_per_hour: u32,
    pub messages_per_day: u32,
    pub sweep_interval_secs: u64,
    pub blocklist_path: Option<String>,
    pub spf_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Senders whose compressed attachments are unpacked (DMARC reporters)
    pub trusted_reporters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub message_log_path: String,
    pub artifacts_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub username: String,
    #[serde(default = "default_can_receive")]
    pub can_receive: bool,
}

fn default_can_receive() -> bool {
    true
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::MailError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| crate::error::MailError::Config(e.to_string()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            hostname: "mail.localhost".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            max_message_size: 10 * 1024 * 1024, // 10MB
            max_recipients: 100,
            max_errors: 10,
            command_timeout_secs: 300,
            data_timeout_secs: 600,
            trusted_origins: vec!["127.0.0.1".to_string(), "::1".to_string()],
        }
    }
}

impl SmtpConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 25,
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
            deadline_secs: 300,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            connections_per_hour: 100,
            messages_per_day: 500,
            sweep_interval_secs: 300,
            blocklist_path: Some("data/blocklist.json".to_string()),
            spf_enabled: true,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            trusted_reporters: vec![
                "noreply-dmarc-support@google.com".to_string(),
                "dmarcreport@microsoft.com".to_string(),
                "dmarc_support@corp.mail.ru".to_string(),
            ],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            message_log_path: "data/messages.json".to_string(),
            artifacts_path: "data/artifacts".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            domain = "example.org"

            [[accounts]]
            username = "bob"

            [[accounts]]
            username = "frozen"
            can_receive = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.domain, "example.org");
        assert_eq!(config.server.hostname, "mail.localhost");
        assert_eq!(config.smtp.max_recipients, 100);
        assert_eq!(config.accounts.len(), 2);
        assert!(config.accounts[0].can_receive);
        assert!(!config.accounts[1].can_receive);
    }

    #[test]
    fn test_default_trusts_loopback() {
        let config = Config::default();
        assert!(config.smtp.trusted_origins.contains(&"127.0.0.1".to_string()));
        assert!(!config.dkim.enabled);
    }
}
