//! DKIM (DomainKeys Identified Mail) Signing
//!
//! RFC 6376 signatures with `a=rsa-sha256` and `c=relaxed/relaxed`. The
//! `DKIM-Signature` header is prepended to the message bytes untouched
//! otherwise. The matching public key is published out of band as a TXT
//! record at `<selector>._domainkey.<domain>`; [`DkimSigner::public_key_record`]
//! produces its value.

use crate::config::DkimConfig;
use crate::error::{MailError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Headers signed when present, in `h=` order
pub const SIGNED_HEADERS: &[&str] = &[
    "from",
    "to",
    "subject",
    "date",
    "message-id",
    "in-reply-to",
    "references",
    "mime-version",
    "content-type",
];

/// DKIM signer for outgoing emails
pub struct DkimSigner {
    /// Domain to sign for (d= parameter)
    domain: String,
    /// Selector (s= parameter)
    selector: String,
    private_key: RsaPrivateKey,
}

impl DkimSigner {
    /// Build a signer from a PKCS#8 or PKCS#1 PEM private key
    pub fn new(domain: &str, selector: &str, private_key_pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| MailError::Config(format!("Failed to parse DKIM private key: {}", e)))?;

        Ok(Self::from_key(domain, selector, private_key))
    }

    pub fn from_key(domain: &str, selector: &str, private_key: RsaPrivateKey) -> Self {
        info!("DKIM signer initialized for domain: {}, selector: {}", domain, selector);
        Self {
            domain: domain.to_lowercase(),
            selector: selector.to_string(),
            private_key,
        }
    }

    /// `None` when signing is disabled or no key is configured
    pub async fn from_config(config: &DkimConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(path) = &config.private_key_path else {
            warn!("DKIM enabled but no private_key_path set, mail goes out unsigned");
            return Ok(None);
        };
        if config.domain.is_empty() || config.selector.is_empty() {
            return Err(MailError::Config(
                "DKIM needs both domain and selector".to_string(),
            ));
        }

        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            MailError::Config(format!("Failed to read DKIM key {}: {}", path, e))
        })?;
        Self::new(&config.domain, &config.selector, &pem).map(Some)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// DNS name the public key must be published under
    pub fn dns_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }

    /// TXT record value: `v=DKIM1; k=rsa; p=<base64 SubjectPublicKeyInfo>`
    pub fn public_key_record(&self) -> Result<String> {
        let der = self
            .private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| MailError::Dkim(format!("Failed to encode public key: {}", e)))?;
        Ok(format!("v=DKIM1; k=rsa; p={}", BASE64.encode(der.as_bytes())))
    }

    /// Return `message` with a `DKIM-Signature` header prepended
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(message)
            .map_err(|_| MailError::Dkim("Message is not valid UTF-8".to_string()))?;
        let (header_block, body) = split_message(text);
        let fields = parse_fields(header_block);

        if !fields.iter().any(|(name, _)| name.eq_ignore_ascii_case("from")) {
            return Err(MailError::Dkim("Message has no From header".to_string()));
        }

        let body_hash = BASE64.encode(Sha256::digest(canonicalize_body_relaxed(body).as_bytes()));

        let timestamp = chrono::Utc::now().timestamp();
        let (signed_names, canonical_headers) = select_headers(&fields);

        let template = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={}; s={}; t={}; h={}; bh={}; b=",
            self.domain,
            self.selector,
            timestamp,
            signed_names.join(":"),
            body_hash
        );

        let signature = self.sign_data(signing_input(&canonical_headers, &template).as_bytes())?;
        let header = format!("DKIM-Signature: {}{}\r\n", template, BASE64.encode(signature));

        let mut signed = Vec::with_capacity(header.len() + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(message);

        debug!("Signed message with DKIM for {} ({} header(s))", self.domain, signed_names.len());
        Ok(signed)
    }

    /// RSASSA-PKCS1-v1_5 over the SHA-256 digest of `data`
    fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let hashed = Sha256::digest(data);
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
            .map_err(|e| MailError::Dkim(format!("DKIM signing failed: {}", e)))
    }
}

/// Sign when a signer is configured; failures are logged and the message
/// goes out unsigned
pub fn sign_or_passthrough(signer: Option<&DkimSigner>, message: Vec<u8>) -> Vec<u8> {
    let Some(signer) = signer else {
        return message;
    };
    match signer.sign(&message) {
        Ok(signed) => signed,
        Err(e) => {
            warn!("DKIM signing failed, sending unsigned: {}", e);
            message
        }
    }
}

fn split_message(text: &str) -> (&str, &str) {
    if let Some(pos) = text.find("\r\n\r\n") {
        (&text[..pos + 2], &text[pos + 4..])
    } else if let Some(pos) = text.find("\n\n") {
        (&text[..pos + 1], &text[pos + 2..])
    } else {
        (text, "")
    }
}

/// Header fields as (name, raw value including folding)
fn parse_fields(block: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push_str("\r\n");
                value.push_str(line);
            }
        } else if let Some((name, value)) = line.split_once(':') {
            fields.push((name.to_string(), value.to_string()));
        }
    }

    fields
}

/// Pick the last instance of each signed header that is present
fn select_headers(fields: &[(String, String)]) -> (Vec<&'static str>, String) {
    let mut names = Vec::new();
    let mut canonical = String::new();

    for name in SIGNED_HEADERS {
        if let Some((raw_name, value)) = fields
            .iter()
            .rev()
            .find(|(field, _)| field.trim().eq_ignore_ascii_case(name))
        {
            canonical.push_str(&canonicalize_header_relaxed(raw_name, value));
            names.push(*name);
        }
    }

    (names, canonical)
}

fn signing_input(canonical_headers: &str, template: &str) -> String {
    let own = canonicalize_header_relaxed("DKIM-Signature", template);
    format!("{}{}", canonical_headers, own.trim_end_matches("\r\n"))
}

/// Relaxed header canonicalization (RFC 6376 3.4.2)
pub fn canonicalize_header_relaxed(name: &str, value: &str) -> String {
    let unfolded = value.replace("\r\n", "").replace('\n', "");
    format!(
        "{}:{}\r\n",
        name.trim().to_lowercase(),
        collapse_whitespace(&unfolded).trim()
    )
}

/// Relaxed body canonicalization (RFC 6376 3.4.4)
pub fn canonicalize_body_relaxed(body: &str) -> String {
    let mut lines: Vec<String> = body
        .split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            collapse_whitespace(line).trim_end().to_string()
        })
        .collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return String::new();
    }

    let mut canonical = lines.join("\r\n");
    canonical.push_str("\r\n");
    canonical
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c == ' ' || c == '\t' {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}
