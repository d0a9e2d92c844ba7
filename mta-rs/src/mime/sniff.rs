//! Binary payload classification
//!
//! A fixed-priority chain of classifiers. Each one either claims the payload
//! or passes; archives (gzip, ZIP) unwrap and feed their content back through
//! the chain. Anything nobody claims is [`Content::Binary`].

use super::dmarc::DmarcReport;
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use tracing::{debug, warn};

/// Decompressed output larger than this is not inspected
pub const MAX_EXPANDED_SIZE: u64 = 16 * 1024 * 1024;

const MAX_ARCHIVE_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    DmarcReport(DmarcReport),
    Text(String),
    /// Nothing recognised it (or it is an archive from an untrusted sender)
    Binary,
}

#[derive(Debug, Clone, Copy)]
pub struct SniffContext {
    /// Sender is allowed to have archives unpacked
    pub trusted: bool,
    pub depth: usize,
}

pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` passes the payload to the next classifier
    fn classify(&self, data: &[u8], ctx: SniffContext, chain: &Sniffer) -> Option<Content>;
}

pub struct GzipClassifier;

impl Classifier for GzipClassifier {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn classify(&self, data: &[u8], ctx: SniffContext, chain: &Sniffer) -> Option<Content> {
        if !data.starts_with(&[0x1f, 0x8b]) {
            return None;
        }
        if !ctx.trusted {
            debug!("gzip payload from untrusted sender left packed");
            return Some(Content::Binary);
        }

        let mut expanded = Vec::new();
        let decoder = GzDecoder::new(data);
        if let Err(e) = decoder.take(MAX_EXPANDED_SIZE).read_to_end(&mut expanded) {
            warn!("gzip payload could not be decompressed: {}", e);
            return Some(Content::Binary);
        }

        Some(chain.sniff_nested(&expanded, ctx))
    }
}

pub struct ZipClassifier;

impl Classifier for ZipClassifier {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn classify(&self, data: &[u8], ctx: SniffContext, chain: &Sniffer) -> Option<Content> {
        if !data.starts_with(b"PK\x03\x04") {
            return None;
        }
        if !ctx.trusted {
            debug!("ZIP payload from untrusted sender left packed");
            return Some(Content::Binary);
        }

        let mut archive = match zip::ZipArchive::new(Cursor::new(data)) {
            Ok(archive) => archive,
            Err(e) => {
                warn!("ZIP payload could not be opened: {}", e);
                return Some(Content::Binary);
            }
        };

        // First entry that yields something readable wins
        for index in 0..archive.len() {
            let mut entry = match archive.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("ZIP entry {} unreadable: {}", index, e);
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }

            let mut expanded = Vec::new();
            let extracted = (&mut entry).take(MAX_EXPANDED_SIZE).read_to_end(&mut expanded);
            if let Err(e) = extracted {
                warn!("ZIP entry {} could not be extracted: {}", entry.name(), e);
                continue;
            }

            match chain.sniff_nested(&expanded, ctx) {
                Content::Binary => continue,
                content => return Some(content),
            }
        }

        Some(Content::Binary)
    }
}

/// XML whose root is `<feedback>`
pub struct DmarcXmlClassifier;

impl Classifier for DmarcXmlClassifier {
    fn name(&self) -> &'static str {
        "dmarc-xml"
    }

    fn classify(&self, data: &[u8], _ctx: SniffContext, _chain: &Sniffer) -> Option<Content> {
        let text = std::str::from_utf8(data).ok()?;
        if !DmarcReport::looks_like(text) {
            return None;
        }

        match DmarcReport::parse(text) {
            Ok(report) => Some(Content::DmarcReport(report)),
            Err(e) => {
                debug!("Looked like a DMARC report but did not parse: {}", e);
                None
            }
        }
    }
}

/// UTF-8 that is at least 90% printable or whitespace
pub struct TextClassifier;

impl Classifier for TextClassifier {
    fn name(&self) -> &'static str {
        "text"
    }

    fn classify(&self, data: &[u8], _ctx: SniffContext, _chain: &Sniffer) -> Option<Content> {
        let text = std::str::from_utf8(data).ok()?;
        if is_mostly_printable(text) {
            Some(Content::Text(text.to_string()))
        } else {
            None
        }
    }
}

pub struct Sniffer {
    classifiers: Vec<Box<dyn Classifier>>,
}

impl Default for Sniffer {
    fn default() -> Self {
        Self {
            classifiers: vec![
                Box::new(GzipClassifier),
                Box::new(ZipClassifier),
                Box::new(DmarcXmlClassifier),
                Box::new(TextClassifier),
            ],
        }
    }
}

impl Sniffer {
    pub fn new(classifiers: Vec<Box<dyn Classifier>>) -> Self {
        Self { classifiers }
    }

    pub fn sniff(&self, data: &[u8], trusted: bool) -> Content {
        self.run(data, SniffContext { trusted, depth: 0 })
    }

    fn sniff_nested(&self, data: &[u8], ctx: SniffContext) -> Content {
        if ctx.depth >= MAX_ARCHIVE_DEPTH {
            warn!("Archive nesting deeper than {}, not unpacking further", MAX_ARCHIVE_DEPTH);
            return Content::Binary;
        }
        self.run(
            data,
            SniffContext {
                depth: ctx.depth + 1,
                ..ctx
            },
        )
    }

    fn run(&self, data: &[u8], ctx: SniffContext) -> Content {
        for classifier in &self.classifiers {
            if let Some(content) = classifier.classify(data, ctx, self) {
                debug!("Payload of {} bytes classified as {}", data.len(), classifier.name());
                return content;
            }
        }
        Content::Binary
    }
}

/// gzip or ZIP magic
pub fn is_archive(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b]) || data.starts_with(b"PK\x03\x04")
}

/// At least 90% of characters are printable or whitespace
pub fn is_mostly_printable(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return true;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count();
    printable * 10 >= total * 9
}
