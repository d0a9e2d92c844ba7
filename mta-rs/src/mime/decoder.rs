//! Turns a raw message into the render-ready body that gets stored
//!
//! Preference: HTML part, then plain text, then the first non-text part.
//! Remaining attachments are appended as one marker line each, with the
//! payload parked in the artifact store.

use super::parser::MimeParser;
use super::sniff::{is_archive, Content, Sniffer};
use super::types::MimePart;
use crate::config::DecoderConfig;
use crate::storage::ArtifactStore;
use crate::utils::{domain_of, normalize_address};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;
use tracing::{debug, warn};

const PGP_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
const PGP_END: &str = "-----END PGP MESSAGE-----";

/// Minimum length before a body is considered for speculative base64
const SPECULATIVE_MIN_LEN: usize = 20;

/// Decrypts one ASCII-armored PGP block to cleartext
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PgpDecryptor: Send + Sync {
    async fn decrypt(&self, armored: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSummary {
    pub content_type: String,
    pub filename: Option<String>,
    pub size: usize,
    /// `artifact:<sha256>` when the payload was stored
    pub reference: Option<String>,
}

impl AttachmentSummary {
    fn from_part(part: &MimePart, reference: Option<String>) -> Self {
        Self {
            content_type: part.mime_type(),
            filename: part.filename.clone(),
            size: part.body.len(),
            reference,
        }
    }

    pub fn marker(&self) -> String {
        let name = self
            .filename
            .as_deref()
            .map(|f| format!(" \"{}\"", f))
            .unwrap_or_default();
        match &self.reference {
            Some(reference) => format!(
                "[attachment {}{} {} bytes -> {}]",
                self.content_type, name, self.size, reference
            ),
            None => format!("[attachment {}{} {} bytes]", self.content_type, name, self.size),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBody {
    pub body: String,
    /// The body came from a `text/html` part
    pub is_html: bool,
    pub attachments: Vec<AttachmentSummary>,
}

pub struct ContentDecoder {
    trusted_reporters: Vec<String>,
    sniffer: Sniffer,
    artifacts: Option<Arc<ArtifactStore>>,
    pgp: Option<Arc<dyn PgpDecryptor>>,
}

impl ContentDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            trusted_reporters: config
                .trusted_reporters
                .iter()
                .map(|r| normalize_address(r))
                .collect(),
            sniffer: Sniffer::default(),
            artifacts: None,
            pgp: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_pgp(mut self, pgp: Arc<dyn PgpDecryptor>) -> Self {
        self.pgp = Some(pgp);
        self
    }

    /// Senders whose archives are unpacked: exact addresses, or bare domains
    pub fn is_trusted_reporter(&self, sender: &str) -> bool {
        let sender = normalize_address(sender);
        let domain = domain_of(&sender);
        self.trusted_reporters.iter().any(|entry| {
            if entry.contains('@') {
                *entry == sender
            } else {
                domain.as_deref() == Some(entry.as_str())
            }
        })
    }

    pub async fn decode(&self, sender: &str, raw: &[u8]) -> DecodedBody {
        let parsed = match MimeParser::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("MIME parse failed ({}), keeping escaped raw text", e);
                return DecodedBody {
                    body: escape_html(&String::from_utf8_lossy(raw)),
                    ..Default::default()
                };
            }
        };

        let trusted = self.is_trusted_reporter(sender);
        let speculative = !parsed.multipart && parsed.transfer_encoding().is_none();
        let mut remaining: Vec<MimePart> = parsed.attachments;
        let mut decoded = DecodedBody::default();

        if let Some(html) = parsed.html_body {
            decoded.body = html;
            decoded.is_html = true;
        } else if let Some(text) = parsed.text_body {
            decoded.body = if speculative {
                speculative_base64(&text).unwrap_or(text)
            } else {
                text
            };
        } else if !remaining.is_empty() {
            let primary = remaining.remove(0);
            decoded.body = self.render_primary(&primary, trusted, &mut decoded.attachments).await;
        }

        if let Some(pgp) = &self.pgp {
            decoded.body = replace_pgp_blocks(pgp.as_ref(), &decoded.body).await;
        }

        for part in &remaining {
            let mut extracted = false;
            let appended = match self.sniff_part(part, trusted) {
                Content::DmarcReport(report) => report.render(),
                // Unpacked from a trusted reporter's archive
                Content::Text(text) if trusted && is_archive(&part.body) => {
                    extracted = true;
                    text
                }
                _ => {
                    let summary = self.park(part).await;
                    let marker = summary.marker();
                    decoded.attachments.push(summary);
                    marker
                }
            };

            if !decoded.body.is_empty() {
                decoded.body.push_str("\n\n");
            }
            if decoded.is_html || extracted {
                decoded.body.push_str(&escape_html(&appended));
            } else {
                decoded.body.push_str(&appended);
            }
        }

        decoded
    }

    /// The body when the message has no text part at all
    async fn render_primary(
        &self,
        part: &MimePart,
        trusted: bool,
        attachments: &mut Vec<AttachmentSummary>,
    ) -> String {
        match self.sniff_part(part, trusted) {
            Content::DmarcReport(report) => escape_html(&report.render()),
            Content::Text(text) => escape_html(&text),
            Content::Binary => {
                let summary = self.park(part).await;
                let marker = escape_html(&summary.marker());
                attachments.push(summary);
                marker
            }
        }
    }

    fn sniff_part(&self, part: &MimePart, trusted: bool) -> Content {
        self.sniffer.sniff(&part.body, trusted)
    }

    /// Store the payload and describe it; storage failure keeps the marker
    async fn park(&self, part: &MimePart) -> AttachmentSummary {
        let reference = match &self.artifacts {
            Some(store) => match store.put(&part.body).await {
                Ok(reference) => Some(reference),
                Err(e) => {
                    warn!("Failed to store attachment ({} bytes): {}", part.body.len(), e);
                    None
                }
            },
            None => None,
        };
        AttachmentSummary::from_part(part, reference)
    }
}

/// Decode `text` as base64 when it very likely is base64 of readable text
///
/// Needs at least 20 characters, 90% of them from the base64 alphabet
/// (line breaks ignored), and a decoded result that is UTF-8 with 90%
/// printable or whitespace characters. Anything else returns `None`.
pub fn speculative_base64(text: &str) -> Option<String> {
    let compact: String = text.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let compact = compact.trim();
    let total = compact.chars().count();
    if total < SPECULATIVE_MIN_LEN {
        return None;
    }

    let alphabet = compact
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .count();
    if alphabet * 10 < total * 9 {
        return None;
    }

    let bytes = general_purpose::STANDARD.decode(compact).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    if !super::sniff::is_mostly_printable(&decoded) {
        return None;
    }

    debug!("Body decoded as unlabelled base64 ({} -> {} chars)", total, decoded.len());
    Some(decoded)
}

/// Replace each armored block with its cleartext; failures leave the block
pub async fn replace_pgp_blocks(pgp: &dyn PgpDecryptor, body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find(PGP_BEGIN) {
        let Some(end_offset) = rest[start..].find(PGP_END) else {
            break;
        };
        let end = start + end_offset + PGP_END.len();
        let block = &rest[start..end];

        out.push_str(&rest[..start]);
        match pgp.decrypt(block).await {
            Ok(cleartext) => out.push_str(&cleartext),
            Err(e) => {
                warn!("PGP block could not be decrypted: {}", e);
                out.push_str(block);
            }
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::dmarc::tests::SAMPLE;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn decoder() -> ContentDecoder {
        ContentDecoder::new(&DecoderConfig {
            trusted_reporters: vec![
                "noreply-dmarc-support@google.com".to_string(),
                "reports.example.net".to_string(),
            ],
        })
    }

    #[test]
    fn test_speculative_base64_roundtrip_of_utf8() {
        let original = "Bonjour, ceci est un message encodé en base64 sans en-tête.";
        let encoded = general_purpose::STANDARD.encode(original);
        let wrapped = format!("{}\r\n{}", &encoded[..40], &encoded[40..]);

        assert_eq!(speculative_base64(&wrapped).as_deref(), Some(original));
    }

    #[test]
    fn test_speculative_base64_leaves_prose_alone() {
        assert_eq!(speculative_base64("This is just a normal sentence, nothing encoded."), None);
        assert_eq!(speculative_base64("short"), None);
        // valid base64 of binary junk is rejected too
        let junk = general_purpose::STANDARD.encode([0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(speculative_base64(&junk), None);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_trusted_reporter_matching() {
        let decoder = decoder();
        assert!(decoder.is_trusted_reporter("NoReply-DMARC-Support@google.com"));
        assert!(decoder.is_trusted_reporter("dmarc@reports.example.net"));
        assert!(!decoder.is_trusted_reporter("someone@google.com"));
    }

    #[tokio::test]
    async fn test_multipart_prefers_html() {
        let raw = b"From: a@example.org\r\nContent-Type: multipart/alternative; boundary=sep\r\n\r\n--sep\r\nContent-Type: text/plain\r\n\r\nplain version\r\n--sep\r\nContent-Type: text/html\r\n\r\n<p>html version</p>\r\n--sep--\r\n";
        let decoded = decoder().decode("a@example.org", raw).await;

        assert!(decoded.is_html);
        assert_eq!(decoded.body, "<p>html version</p>");
    }

    #[tokio::test]
    async fn test_single_part_unlabelled_base64() {
        let encoded = general_purpose::STANDARD.encode("A message that somebody base64'd without saying so.");
        let raw = format!("From: a@example.org\r\nSubject: hi\r\n\r\n{}\r\n", encoded);
        let decoded = decoder().decode("a@example.org", raw.as_bytes()).await;

        assert_eq!(decoded.body, "A message that somebody base64'd without saying so.");
    }

    #[tokio::test]
    async fn test_declared_encoding_skips_speculation() {
        let encoded = general_purpose::STANDARD.encode("already decoded once, looks like base64");
        let double = general_purpose::STANDARD.encode(&encoded);
        let raw = format!(
            "From: a@example.org\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n",
            double
        );
        let decoded = decoder().decode("a@example.org", raw.as_bytes()).await;
        assert_eq!(decoded.body, encoded);
    }

    #[tokio::test]
    async fn test_attachment_is_parked_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = decoder().with_artifacts(Arc::new(ArtifactStore::new(dir.path())));

        let raw = b"From: a@example.org\nContent-Type: multipart/mixed; boundary=m\n\n--m\nContent-Type: text/plain\n\nsee attached\n--m\nContent-Type: application/octet-stream\nContent-Disposition: attachment; filename=\"blob.bin\"\nContent-Transfer-Encoding: base64\n\nAAECAwQF\n--m--\n";
        let decoded = decoder.decode("a@example.org", raw).await;

        assert_eq!(decoded.attachments.len(), 1);
        let summary = &decoded.attachments[0];
        assert_eq!(summary.size, 6);
        assert_eq!(summary.filename.as_deref(), Some("blob.bin"));
        let reference = summary.reference.clone().unwrap();
        assert!(decoded.body.starts_with("see attached\n\n[attachment application/octet-stream \"blob.bin\" 6 bytes -> artifact:"));
        assert!(decoded.body.ends_with(&format!("{}]", reference)));
    }

    #[tokio::test]
    async fn test_gzipped_dmarc_report_is_rendered_for_trusted_sender() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let packed = general_purpose::STANDARD.encode(encoder.finish().unwrap());

        let raw = format!(
            "From: noreply-dmarc-support@google.com\r\nContent-Type: application/gzip; name=\"report.xml.gz\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n",
            packed
        );

        let trusted = decoder()
            .decode("noreply-dmarc-support@google.com", raw.as_bytes())
            .await;
        assert!(trusted.body.contains("DMARC aggregate report from google.com"));
        assert!(trusted.attachments.is_empty());

        let untrusted = decoder().decode("mallory@example.com", raw.as_bytes()).await;
        assert!(untrusted.body.starts_with("[attachment application/gzip &quot;report.xml.gz&quot;"));
        assert_eq!(untrusted.attachments.len(), 1);
    }

    #[tokio::test]
    async fn test_archived_text_from_trusted_reporter_is_shown_escaped() {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("notes.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<notes><note>hi</note></notes>").unwrap();
        let packed = writer.finish().unwrap().into_inner();
        let raw = format!(
            "From: dmarc@reports.example.net\r\nContent-Type: multipart/mixed; boundary=m\r\n\r\n--m\r\nContent-Type: text/plain\r\n\r\nReport attached\r\n--m\r\nContent-Type: application/zip\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n--m--\r\n",
            general_purpose::STANDARD.encode(&packed)
        );

        let trusted = decoder().decode("dmarc@reports.example.net", raw.as_bytes()).await;
        assert_eq!(
            trusted.body,
            "Report attached\n\n&lt;notes&gt;&lt;note&gt;hi&lt;/note&gt;&lt;/notes&gt;"
        );
        assert!(trusted.attachments.is_empty());

        let untrusted = decoder().decode("mallory@example.com", raw.as_bytes()).await;
        assert!(untrusted.body.contains("[attachment application/zip"));
        assert!(!untrusted.body.contains("notes"));
    }

    #[tokio::test]
    async fn test_pgp_block_replaced() {
        let mut pgp = MockPgpDecryptor::new();
        pgp.expect_decrypt()
            .withf(|armored| armored.starts_with(PGP_BEGIN) && armored.ends_with(PGP_END))
            .times(1)
            .returning(|_| Ok("secret plans".to_string()));

        let decoder = decoder().with_pgp(Arc::new(pgp));
        let raw = format!(
            "From: a@example.org\n\nbefore\n{}\nhQEMA...\n{}\nafter",
            PGP_BEGIN, PGP_END
        );
        let decoded = decoder.decode("a@example.org", raw.as_bytes()).await;
        assert_eq!(decoded.body, "before\nsecret plans\nafter");
    }

    #[tokio::test]
    async fn test_pgp_failure_keeps_block() {
        let mut pgp = MockPgpDecryptor::new();
        pgp.expect_decrypt()
            .returning(|_| Err(anyhow::anyhow!("no key")));

        let body = format!("{}\nabc\n{}", PGP_BEGIN, PGP_END);
        assert_eq!(replace_pgp_blocks(&pgp, &body).await, body);
    }
}
