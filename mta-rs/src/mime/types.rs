use std::collections::HashMap;

/// A leaf MIME part, body already transfer-decoded
#[derive(Debug, Clone)]
pub struct MimePart {
    /// Content-Type header value
    pub content_type: String,
    /// Content-Disposition header value (e.g., "attachment")
    pub content_disposition: Option<String>,
    /// Filename from Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// Declared Content-Transfer-Encoding, if any
    pub encoding: Option<String>,
    pub body: Vec<u8>,
    /// Explicit attachment disposition or non-text type
    pub is_attachment: bool,
}

impl Default for MimePart {
    fn default() -> Self {
        MimePart {
            content_type: "text/plain".to_string(),
            content_disposition: None,
            filename: None,
            encoding: None,
            body: Vec::new(),
            is_attachment: false,
        }
    }
}

impl MimePart {
    /// Lower-cased `type/subtype` without parameters
    pub fn mime_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase()
    }

    pub fn is_text(&self) -> bool {
        self.mime_type().starts_with("text/")
    }
}

/// Parsed email with the body candidates separated
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    /// Non-text parts in message order
    pub attachments: Vec<MimePart>,
    /// True when the top level was a multipart container
    pub multipart: bool,
}

impl ParsedEmail {
    pub fn new() -> Self {
        ParsedEmail::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Top-level transfer encoding, lower-cased
    pub fn transfer_encoding(&self) -> Option<String> {
        self.header("content-transfer-encoding")
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
    }

    pub fn total_attachment_size(&self) -> usize {
        self.attachments.iter().map(|a| a.body.len()).sum()
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}
