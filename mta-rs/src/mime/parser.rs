use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;
use tracing::debug;

use super::types::{MimePart, ParsedEmail};

/// Nested multipart containers deeper than this are ignored
const MAX_NESTING: usize = 8;

/// MIME message parser
pub struct MimeParser;

impl MimeParser {
    /// Parse a raw email message into structured parts
    ///
    /// Multipart containers are walked recursively and every leaf body is
    /// transfer-decoded. The first `text/html` and `text/plain` leaves become
    /// the body candidates; every other leaf is kept as an attachment.
    pub fn parse(message: &[u8]) -> Result<ParsedEmail> {
        let message_str = String::from_utf8_lossy(message);

        let (headers_str, body_str) = Self::split_headers_body(&message_str);
        let headers = Self::parse_headers(headers_str);
        if headers.is_empty() {
            return Err(anyhow!("Message has no headers"));
        }

        let mut parsed = ParsedEmail {
            headers: headers.clone(),
            ..Default::default()
        };

        let content_type = headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "text/plain".to_string());

        if content_type.to_lowercase().contains("multipart/") {
            if let Some(boundary) = Self::extract_parameter(&content_type, "boundary") {
                parsed.multipart = true;
                Self::walk_multipart(&mut parsed, &boundary, body_str, 0);
                return Ok(parsed);
            }
            debug!("Multipart message without boundary, treating as plain text");
        }

        let part = Self::build_part(&headers, body_str);
        Self::categorize_part(&mut parsed, part);
        Ok(parsed)
    }

    /// Split message into headers and body
    fn split_headers_body(message: &str) -> (&str, &str) {
        // Headers end with double CRLF or double LF
        let crlf = message.find("\r\n\r\n").map(|pos| (pos, 4));
        let lf = message.find("\n\n").map(|pos| (pos, 2));

        let split = match (crlf, lf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };

        match split {
            Some((pos, len)) => (&message[..pos], &message[pos + len..]),
            // No body separator found, treat entire message as headers
            None => (message, ""),
        }
    }

    /// Parse email headers into HashMap keyed by lower-cased name
    fn parse_headers(headers_str: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        let mut current_header: Option<(String, String)> = None;

        for line in headers_str.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation of previous header (folded header)
                if let Some((_, ref mut value)) = current_header {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some(colon_pos) = line.find(':') {
                if let Some((name, value)) = current_header.take() {
                    headers.insert(name, value);
                }

                let name = line[..colon_pos].trim().to_lowercase();
                let value = line[colon_pos + 1..].trim().to_string();
                current_header = Some((name, value));
            }
        }

        if let Some((name, value)) = current_header {
            headers.insert(name, value);
        }

        headers
    }

    /// Extract parameter value from header (e.g., filename="file.txt")
    fn extract_parameter(header: &str, param_name: &str) -> Option<String> {
        let prefix = format!("{}=", param_name);
        for part in header.split(';') {
            let part = part.trim();
            if part.len() > prefix.len() && part[..prefix.len()].eq_ignore_ascii_case(&prefix) {
                let value = part[prefix.len()..].trim_matches('"').trim_matches('\'');
                return Some(value.to_string());
            }
        }
        None
    }

    /// Split a multipart body on `--boundary` lines and recurse into sections
    fn walk_multipart(parsed: &mut ParsedEmail, boundary: &str, body: &str, depth: usize) {
        if depth >= MAX_NESTING {
            debug!("Multipart nesting deeper than {}, ignoring the rest", MAX_NESTING);
            return;
        }

        let delimiter = format!("--{}", boundary);
        let close = format!("--{}--", boundary);

        let mut sections: Vec<Vec<&str>> = Vec::new();
        let mut current: Option<Vec<&str>> = None;

        for line in body.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let marker = line.trim_end();

            if marker == close {
                if let Some(section) = current.take() {
                    sections.push(section);
                }
                break;
            }
            if marker == delimiter {
                if let Some(section) = current.take() {
                    sections.push(section);
                }
                current = Some(Vec::new());
                continue;
            }

            // Lines before the first delimiter are preamble
            if let Some(section) = current.as_mut() {
                section.push(line);
            }
        }

        // Unterminated final section
        if let Some(section) = current.take() {
            sections.push(section);
        }

        for section in sections {
            let section = section.join("\n");
            let (part_headers_str, part_body) = Self::split_headers_body(&section);
            let part_headers = Self::parse_headers(part_headers_str);

            let content_type = part_headers
                .get("content-type")
                .map(String::as_str)
                .unwrap_or("text/plain");

            if content_type.to_lowercase().starts_with("multipart/") {
                match Self::extract_parameter(content_type, "boundary") {
                    Some(inner) => Self::walk_multipart(parsed, &inner, part_body, depth + 1),
                    None => debug!("Nested multipart without boundary skipped"),
                }
                continue;
            }

            let part = Self::build_part(&part_headers, part_body);
            Self::categorize_part(parsed, part);
        }
    }

    fn build_part(headers: &HashMap<String, String>, body: &str) -> MimePart {
        let mut part = MimePart::default();

        if let Some(content_type) = headers.get("content-type") {
            part.content_type = content_type.clone();
            if let Some(name) = Self::extract_parameter(content_type, "name") {
                part.filename = Some(name);
            }
        }

        if let Some(disposition) = headers.get("content-disposition") {
            part.content_disposition = Some(disposition.clone());
            if disposition.to_lowercase().starts_with("attachment") {
                part.is_attachment = true;
            }
            if let Some(filename) = Self::extract_parameter(disposition, "filename") {
                part.filename = Some(filename);
            }
        }

        if !part.is_text() {
            part.is_attachment = true;
        }

        part.encoding = headers
            .get("content-transfer-encoding")
            .map(|e| e.trim().to_lowercase());

        let raw = body.trim_end_matches(['\r', '\n']).as_bytes();
        part.body = match Self::decode_body(part.encoding.as_deref(), raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Keeping undecodable part as-is: {}", e);
                raw.to_vec()
            }
        };

        part
    }

    /// File a leaf into the body candidates or the attachment list
    fn categorize_part(parsed: &mut ParsedEmail, part: MimePart) {
        if part.is_attachment {
            parsed.attachments.push(part);
            return;
        }

        match part.mime_type().as_str() {
            "text/html" if parsed.html_body.is_none() => {
                parsed.html_body = Some(String::from_utf8_lossy(&part.body).into_owned());
            }
            "text/plain" if parsed.text_body.is_none() => {
                parsed.text_body = Some(String::from_utf8_lossy(&part.body).into_owned());
            }
            _ => parsed.attachments.push(part),
        }
    }

    /// Decode a body by its declared Content-Transfer-Encoding
    pub fn decode_body(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>> {
        match encoding.map(str::to_lowercase) {
            Some(e) if e.contains("base64") => Self::decode_base64(body),
            Some(e) if e.contains("quoted-printable") => Ok(Self::decode_quoted_printable(body)),
            // 7bit, 8bit, binary - no decoding needed
            _ => Ok(body.to_vec()),
        }
    }

    /// Decode base64 content, ignoring whitespace
    pub fn decode_base64(content: &[u8]) -> Result<Vec<u8>> {
        let cleaned: Vec<u8> = content
            .iter()
            .filter(|&&b| !b.is_ascii_whitespace())
            .copied()
            .collect();

        general_purpose::STANDARD
            .decode(&cleaned)
            .map_err(|e| anyhow!("Base64 decode error: {}", e))
    }

    /// Decode quoted-printable content
    pub fn decode_quoted_printable(content: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(content.len());
        let mut i = 0;

        while i < content.len() {
            let byte = content[i];
            if byte != b'=' {
                result.push(byte);
                i += 1;
                continue;
            }

            // Soft line break: "=\r\n" or "=\n"
            match content.get(i + 1) {
                Some(b'\r') if content.get(i + 2) == Some(&b'\n') => {
                    i += 3;
                    continue;
                }
                Some(b'\n') => {
                    i += 2;
                    continue;
                }
                _ => {}
            }

            let hex = content.get(i + 1..i + 3);
            match hex
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                Some(decoded) => {
                    result.push(decoded);
                    i += 3;
                }
                None => {
                    // Invalid encoding, keep as-is
                    result.push(b'=');
                    i += 1;
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_headers_body_crlf() {
        let message = "From: test@example.com\r\nSubject: Test\r\n\r\nBody content";
        let (headers, body) = MimeParser::split_headers_body(message);
        assert!(headers.contains("From:"));
        assert_eq!(body, "Body content");
    }

    #[test]
    fn test_split_headers_body_lf() {
        let message = "From: test@example.com\nSubject: Test\n\nBody content";
        let (headers, body) = MimeParser::split_headers_body(message);
        assert!(headers.contains("From:"));
        assert_eq!(body, "Body content");
    }

    #[test]
    fn test_parse_headers_folded() {
        let headers_str = "Subject: This is a very long subject\n that spans multiple lines";
        let headers = MimeParser::parse_headers(headers_str);

        assert_eq!(
            headers.get("subject"),
            Some(&"This is a very long subject that spans multiple lines".to_string())
        );
    }

    #[test]
    fn test_extract_parameter() {
        assert_eq!(
            MimeParser::extract_parameter("multipart/mixed; Boundary=\"----=_Part_123\"", "boundary"),
            Some("----=_Part_123".to_string())
        );
        assert_eq!(
            MimeParser::extract_parameter("attachment; filename=\"document.pdf\"", "filename"),
            Some("document.pdf".to_string())
        );
        assert_eq!(MimeParser::extract_parameter("text/plain", "charset"), None);
    }

    #[test]
    fn test_decode_base64_with_whitespace() {
        let decoded = MimeParser::decode_base64(b"SGVs bG8g\nV29y bGQ=").unwrap();
        assert_eq!(decoded, b"Hello World");
    }

    #[test]
    fn test_decode_quoted_printable() {
        assert_eq!(MimeParser::decode_quoted_printable(b"Hello=20World=21"), b"Hello World!");
        assert_eq!(MimeParser::decode_quoted_printable(b"Hello=\r\nWorld"), b"HelloWorld");
        assert_eq!(MimeParser::decode_quoted_printable(b"caf=C3=A9"), "café".as_bytes());
        assert_eq!(MimeParser::decode_quoted_printable(b"a=zz"), b"a=zz");
    }

    #[test]
    fn test_parse_simple_text_email() {
        let message = b"From: sender@example.com\nTo: recipient@example.com\nSubject: Test\n\nHello World";
        let parsed = MimeParser::parse(message).unwrap();

        assert_eq!(parsed.header("From"), Some("sender@example.com"));
        assert_eq!(parsed.text_body.as_deref(), Some("Hello World"));
        assert!(!parsed.multipart);
        assert!(!parsed.has_attachments());
    }

    #[test]
    fn test_parse_rejects_headerless_input() {
        assert!(MimeParser::parse(b"\n\njust a body").is_err());
    }

    #[test]
    fn test_parse_alternative_keeps_both_bodies() {
        let message = b"Content-Type: multipart/alternative; boundary=\"b1\"\r\n\r\npreamble\r\n--b1\r\nContent-Type: text/plain\r\n\r\nText part\r\n--b1\r\nContent-Type: text/html\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\n<p>HTML=20part</p>\r\n--b1--\r\nepilogue";
        let parsed = MimeParser::parse(message).unwrap();

        assert!(parsed.multipart);
        assert_eq!(parsed.text_body.as_deref(), Some("Text part"));
        assert_eq!(parsed.html_body.as_deref(), Some("<p>HTML part</p>"));
    }

    #[test]
    fn test_parse_nested_multipart_with_attachment() {
        let message = b"Content-Type: multipart/mixed; boundary=outer\n\n--outer\nContent-Type: multipart/alternative; boundary=inner\n\n--inner\nContent-Type: text/plain\n\nplain\n--inner\nContent-Type: text/html\n\n<b>html</b>\n--inner--\n--outer\nContent-Type: application/pdf\nContent-Disposition: attachment; filename=\"file.pdf\"\nContent-Transfer-Encoding: base64\n\nJVBERi0xLjQ=\n--outer--\n";
        let parsed = MimeParser::parse(message).unwrap();

        assert_eq!(parsed.text_body.as_deref(), Some("plain"));
        assert_eq!(parsed.html_body.as_deref(), Some("<b>html</b>"));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename.as_deref(), Some("file.pdf"));
        assert_eq!(parsed.attachments[0].body, b"%PDF-1.4");
    }

    #[test]
    fn test_non_text_part_is_attachment_without_disposition() {
        let message = b"Content-Type: multipart/mixed; boundary=x\n\n--x\nContent-Type: application/gzip; name=report.xml.gz\n\nabc\n--x--";
        let parsed = MimeParser::parse(message).unwrap();

        assert!(parsed.text_body.is_none());
        assert_eq!(parsed.attachments.len(), 1);
        assert!(parsed.attachments[0].is_attachment);
        assert_eq!(parsed.attachments[0].filename.as_deref(), Some("report.xml.gz"));
    }
}
