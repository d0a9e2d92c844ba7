//! Application-facing send path
//!
//! A send between two local accounts never touches the wire. Anything else
//! is authorised by the [`CreditGate`], composed, DKIM-signed when a signer
//! is configured, relayed, and only then recorded in the store.

use crate::authentication::{sign_or_passthrough, DkimSigner};
use crate::config::ServerConfig;
use crate::directory::AccountDirectory;
use crate::error::{MailError, Result};
use crate::smtp::relay::{DeliveryReport, OutboundRelay};
use crate::storage::{generate_id, Message, MessageStore, NewMessage};
use crate::utils::{domain_of, local_part, normalize_address, validate_email};
use async_trait::async_trait;
use mail_builder::MessageBuilder;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ancestors walked when building `References`
const MAX_REFERENCES: usize = 32;

/// Metering hook consulted before every non-local send
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditGate: Send + Sync {
    /// `false` refuses the send
    async fn authorize(&self, sender: &str, recipient: &str) -> bool;
}

/// Gate that authorises everything
#[derive(Debug, Default)]
pub struct UnmeteredCredits;

#[async_trait]
impl CreditGate for UnmeteredCredits {
    async fn authorize(&self, _sender: &str, _recipient: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMail {
    /// Local username of the sender
    pub from_user: String,
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub html: bool,
    /// Stored id of the message being answered
    pub reply_to: Option<String>,
}

pub struct Mailer {
    server: ServerConfig,
    directory: Arc<dyn AccountDirectory>,
    store: Arc<MessageStore>,
    relay: Arc<OutboundRelay>,
    signer: Option<Arc<DkimSigner>>,
    credits: Arc<dyn CreditGate>,
}

impl Mailer {
    pub fn new(
        server: ServerConfig,
        directory: Arc<dyn AccountDirectory>,
        store: Arc<MessageStore>,
        relay: Arc<OutboundRelay>,
    ) -> Self {
        Self {
            server,
            directory,
            store,
            relay,
            signer: None,
            credits: Arc::new(UnmeteredCredits),
        }
    }

    pub fn with_signer(mut self, signer: Arc<DkimSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_credits(mut self, credits: Arc<dyn CreditGate>) -> Self {
        self.credits = credits;
        self
    }

    fn is_local(&self, address: &str) -> bool {
        domain_of(address).is_some_and(|d| d.eq_ignore_ascii_case(&self.server.domain))
    }

    fn address_of(&self, username: &str) -> String {
        format!("{}@{}", username, self.server.domain)
    }

    /// Send `mail`, returning the stored copy
    pub async fn send(&self, mail: OutgoingMail) -> Result<Message> {
        let recipient = normalize_address(&mail.to);
        validate_email(&recipient)?;

        let parent = match mail.reply_to.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(
                self.store
                    .get(id)
                    .await
                    .ok_or_else(|| MailError::NotFound(format!("Message {}", id)))?,
            ),
            None => None,
        };

        let message_id = format!("{}@{}", generate_id(), self.server.domain);

        if self.is_local(&recipient) {
            return self.deliver_local(mail, &recipient, message_id).await;
        }

        let sender = self.address_of(&mail.from_user);
        if !self.credits.authorize(&mail.from_user, &recipient).await {
            warn!("Send from {} to {} refused by credit gate", sender, recipient);
            return Err(MailError::SendDenied(format!(
                "{} may not send to {}",
                mail.from_user, recipient
            )));
        }

        let references = match &parent {
            Some(parent) => self.references_for(parent).await,
            None => Vec::new(),
        };
        let raw = self.compose(&mail, &sender, &recipient, &message_id, &references)?;

        self.relay_raw(&sender, &recipient, raw).await?;

        let stored = self
            .store
            .append(NewMessage {
                from: mail.from_name,
                from_id: mail.from_user,
                to: recipient.clone(),
                to_id: recipient,
                subject: mail.subject,
                body: mail.body,
                reply_to: mail.reply_to,
                message_id: Some(format!("<{}>", message_id)),
            })
            .await?;

        Ok(stored)
    }

    /// Sign (best effort) and relay an already composed message
    pub async fn relay_raw(&self, sender: &str, recipient: &str, data: Vec<u8>) -> Result<DeliveryReport> {
        let signed = sign_or_passthrough(self.signer.as_deref(), data);
        self.relay.deliver(sender, recipient, &signed).await
    }

    async fn deliver_local(&self, mail: OutgoingMail, recipient: &str, message_id: String) -> Result<Message> {
        let username = local_part(recipient).to_lowercase();
        let account = self
            .directory
            .lookup(&username)
            .await
            .filter(|a| a.can_receive)
            .ok_or_else(|| MailError::NotFound(format!("User {}", recipient)))?;

        debug!("Local delivery from {} to {}", mail.from_user, account.username);
        let stored = self
            .store
            .append(NewMessage {
                from: mail.from_name,
                from_id: mail.from_user,
                to: recipient.to_string(),
                to_id: account.username,
                subject: mail.subject,
                body: mail.body,
                reply_to: mail.reply_to,
                message_id: Some(format!("<{}>", message_id)),
            })
            .await?;

        info!("Delivered {} locally", stored.id);
        Ok(stored)
    }

    /// Message-IDs from the root down to `parent`, bare (no brackets)
    async fn references_for(&self, parent: &Message) -> Vec<String> {
        let mut references = Vec::new();
        let mut current = Some(parent.clone());

        while let Some(message) = current.take() {
            if references.len() >= MAX_REFERENCES {
                break;
            }
            if !message.message_id.is_empty() {
                references.push(bare(&message.message_id).to_string());
            }
            if !message.reply_to.is_empty() {
                current = self.store.get(&message.reply_to).await;
            }
        }

        references.reverse();
        references
    }

    fn compose(
        &self,
        mail: &OutgoingMail,
        sender: &str,
        recipient: &str,
        message_id: &str,
        references: &[String],
    ) -> Result<Vec<u8>> {
        let mut builder = MessageBuilder::new()
            .from((mail.from_name.as_str(), sender))
            .to(recipient)
            .subject(mail.subject.as_str())
            .message_id(message_id);

        // The last reference is the direct parent
        if let Some(parent) = references.last() {
            builder = builder
                .in_reply_to(parent.as_str())
                .references(references.to_vec());
        }

        builder = if mail.html {
            builder.html_body(mail.body.as_str())
        } else {
            builder.text_body(mail.body.as_str())
        };

        builder
            .write_to_vec()
            .map_err(|e| MailError::SmtpProtocol(format!("Failed to compose message: {}", e)))
    }
}

fn bare(message_id: &str) -> &str {
    message_id.trim().trim_start_matches('<').trim_end_matches('>')
}
