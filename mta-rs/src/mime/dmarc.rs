//! DMARC aggregate report (RFC 7489 appendix C) parsing and rendering

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmarcRecord {
    pub source_ip: String,
    pub count: u64,
    pub disposition: String,
    pub dkim: String,
    pub spf: String,
    pub header_from: String,
}

impl DmarcRecord {
    pub fn passes(&self) -> bool {
        self.dkim == "pass" || self.spf == "pass"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmarcReport {
    pub org_name: String,
    pub email: String,
    pub report_id: String,
    pub date_begin: Option<i64>,
    pub date_end: Option<i64>,
    pub domain: String,
    pub policy: String,
    pub records: Vec<DmarcRecord>,
}

impl DmarcReport {
    /// Quick check before a full parse
    pub fn looks_like(text: &str) -> bool {
        let head: String = text.chars().take(512).collect();
        head.contains("<feedback")
    }

    /// Parse a `<feedback>` document
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut report = DmarcReport::default();
        let mut path: Vec<String> = Vec::new();
        let mut record: Option<DmarcRecord> = None;
        let mut saw_root = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(tag)) => {
                    let name = String::from_utf8_lossy(tag.local_name().as_ref()).into_owned();
                    if path.is_empty() {
                        if name != "feedback" {
                            return Err(anyhow!("Root element is <{}>, not <feedback>", name));
                        }
                        saw_root = true;
                    }
                    if name == "record" && path.len() == 1 {
                        record = Some(DmarcRecord::default());
                    }
                    path.push(name);
                }
                Ok(Event::End(_)) => {
                    if path.len() == 2 && path[1] == "record" {
                        if let Some(done) = record.take() {
                            report.records.push(done);
                        }
                    }
                    path.pop();
                }
                Ok(Event::Text(text)) => {
                    let value = text
                        .unescape()
                        .map_err(|e| anyhow!("Invalid DMARC XML text: {}", e))?
                        .trim()
                        .to_string();
                    let keys: Vec<&str> = path.iter().skip(1).map(String::as_str).collect();
                    report.assign(&keys, value, record.as_mut());
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(anyhow!(
                        "DMARC XML error at position {}: {}",
                        reader.buffer_position(),
                        e
                    ))
                }
            }
        }

        if !saw_root {
            return Err(anyhow!("No <feedback> element found"));
        }
        Ok(report)
    }

    fn assign(&mut self, keys: &[&str], value: String, record: Option<&mut DmarcRecord>) {
        match keys {
            ["report_metadata", "org_name"] => self.org_name = value,
            ["report_metadata", "email"] => self.email = value,
            ["report_metadata", "report_id"] => self.report_id = value,
            ["report_metadata", "date_range", "begin"] => self.date_begin = value.parse().ok(),
            ["report_metadata", "date_range", "end"] => self.date_end = value.parse().ok(),
            ["policy_published", "domain"] => self.domain = value,
            ["policy_published", "p"] => self.policy = value,
            ["record", rest @ ..] => {
                let Some(record) = record else { return };
                match rest {
                    ["row", "source_ip"] => record.source_ip = value,
                    ["row", "count"] => record.count = value.parse().unwrap_or(0),
                    ["row", "policy_evaluated", "disposition"] => record.disposition = value,
                    ["row", "policy_evaluated", "dkim"] => record.dkim = value,
                    ["row", "policy_evaluated", "spf"] => record.spf = value,
                    ["identifiers", "header_from"] => record.header_from = value,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    pub fn total_messages(&self) -> u64 {
        self.records.iter().map(|r| r.count).sum()
    }

    pub fn failing_messages(&self) -> u64 {
        self.records.iter().filter(|r| !r.passes()).map(|r| r.count).sum()
    }

    /// Plain-text summary of the report
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "DMARC aggregate report from {} (report id {})",
            or_unknown(&self.org_name),
            or_unknown(&self.report_id)
        );
        let _ = writeln!(
            out,
            "Domain: {}  policy: p={}",
            or_unknown(&self.domain),
            or_unknown(&self.policy)
        );
        if let (Some(begin), Some(end)) = (self.date_begin, self.date_end) {
            let _ = writeln!(out, "Period: {} to {}", format_timestamp(begin), format_timestamp(end));
        }

        let _ = writeln!(out);
        for record in &self.records {
            let _ = writeln!(
                out,
                "{:<40} x{:<6} disposition={} dkim={} spf={} from={}",
                record.source_ip,
                record.count,
                or_unknown(&record.disposition),
                or_unknown(&record.dkim),
                or_unknown(&record.spf),
                or_unknown(&record.header_from)
            );
        }

        let _ = writeln!(
            out,
            "\nTotal: {} message(s), {} failing DKIM and SPF",
            self.total_messages(),
            self.failing_messages()
        );
        out
    }
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "?"
    } else {
        value
    }
}

fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}
