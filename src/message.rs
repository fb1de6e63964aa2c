//! Normalized message model and its defensive builder.
//!
//! Everything downstream of the transport reads one immutable
//! [`NormalizedMessage`]. The builder is the security boundary: it bounds
//! every field, preserves duplicate headers, sanitizes filenames before any
//! extension-based decision, and verifies attachment signatures eagerly so
//! no analyzer ever selects a parser from an unchecked extension claim.

use crate::config::{Config, LimitsConfig};
use crate::filetype::{self, SignatureStatus};
use crate::sanitize;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;

/// Header map preserving every occurrence of repeated header names.
///
/// Collapsing duplicates would let a second forged `From` or an extra
/// `Authentication-Results` slip past the checks that must see all of them.
#[derive(Debug, Clone, Default)]
pub struct HeaderMultiMap {
    entries: HashMap<String, Vec<String>>,
}

impl HeaderMultiMap {
    pub fn insert(&mut self, name: &str, value: String) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value);
    }

    /// All values for a header, in arrival order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tagged outcome of a limit predicate; callers branch on this instead of
/// catching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    Ok,
    Truncated,
    Dropped,
}

/// Which fields were cut down during normalization. A set flag always
/// surfaces as an indicator so no report looks cleaner than the analysis
/// actually was.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncationFlags {
    pub subject: bool,
    pub body_text: bool,
    pub body_html: bool,
    pub mime_parts: bool,
    pub attachments_dropped: bool,
    pub attachment_bytes: bool,
}

impl TruncationFlags {
    pub fn any(&self) -> bool {
        self.subject
            || self.body_text
            || self.body_html
            || self.mime_parts
            || self.attachments_dropped
            || self.attachment_bytes
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub raw_filename: String,
    /// Never contains path separators, NUL bytes, or leading/trailing dot
    /// and whitespace ambiguity. All extension checks run on this form.
    pub sanitized_filename: String,
    pub declared_mime: String,
    /// Declared/original size; `payload` may be shorter when truncated.
    pub byte_size: u64,
    pub payload: Vec<u8>,
    pub truncated: bool,
    /// Computed once at build time, before anything branches on extension.
    pub signature: SignatureStatus,
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub date: DateTime<Utc>,
    pub body_text: String,
    pub body_html: String,
    pub headers: HeaderMultiMap,
    pub attachments: Vec<AttachmentRecord>,
    pub truncation: TruncationFlags,
}

/// Inbound interface from the transport collaborator: raw header lines,
/// raw body parts, and raw attachment streams, exactly as fetched.
#[derive(Debug, Clone, Default)]
pub struct RawMail {
    pub raw_headers: Vec<(String, String)>,
    pub body_parts: Vec<RawMimePart>,
    pub attachments: Vec<RawAttachment>,
    pub announced_total_size: u64,
}

#[derive(Debug, Clone)]
pub struct RawMimePart {
    /// e.g. "text/plain" or "text/html"; anything else is skipped.
    pub content_type: String,
    /// Undecoded bytes; size limits apply before any decoding cost is paid.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub filename: String,
    pub declared_mime: String,
    pub data: Vec<u8>,
    pub declared_size: u64,
}

impl RawMail {
    /// Refuse-before-fetch contract: the transport collaborator checks the
    /// announced size here before retrieving any payload bytes.
    pub fn within_size_budget(announced_total_size: u64, limits: &LimitsConfig) -> bool {
        announced_total_size <= limits.max_message_bytes()
    }
}

pub fn check_text_limit(len: usize, max: usize) -> LimitOutcome {
    if len > max {
        LimitOutcome::Truncated
    } else {
        LimitOutcome::Ok
    }
}

/// Admission predicate for one more attachment given current totals.
pub fn check_attachment_limit(
    current_count: usize,
    current_total: u64,
    incoming_size: u64,
    limits: &LimitsConfig,
) -> LimitOutcome {
    if current_count >= limits.max_attachment_count {
        return LimitOutcome::Dropped;
    }
    if current_total + incoming_size > limits.max_total_attachment_bytes {
        return LimitOutcome::Dropped;
    }
    if incoming_size > limits.max_attachment_bytes as u64 {
        return LimitOutcome::Truncated;
    }
    LimitOutcome::Ok
}

/// Filename sanitization pipeline. Step order matters: separators are
/// unified before taking the base name, so `..\..\evil.exe` cannot dodge a
/// Unix-only basename split.
pub fn sanitize_filename(raw: &str) -> String {
    const FALLBACK: &str = "unnamed_attachment";
    if raw.is_empty() {
        return FALLBACK.to_string();
    }

    let unified = raw.replace('\\', "/");
    let base = unified.rsplit('/').next().unwrap_or("");
    let without_nul: String = base.chars().filter(|c| *c != '\0').collect();
    let trimmed = without_nul.trim_end_matches(['.', ' ', '\t']);

    let mut filtered: String = trimmed
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_'))
        .collect();
    while filtered.contains("..") {
        filtered = filtered.replace("..", ".");
    }
    let cleaned = filtered.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        return FALLBACK.to_string();
    }

    // CON.txt and friends are reserved on Windows regardless of extension.
    const WINDOWS_RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = cleaned.split('.').next().unwrap_or("").to_ascii_uppercase();
    let mut result = if WINDOWS_RESERVED.contains(&stem.as_str()) {
        format!("_{}", cleaned)
    } else {
        cleaned.to_string()
    };

    if result.len() > 255 {
        let mut cut = 255;
        while cut > 0 && !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
    }
    result
}

/// Builds one [`NormalizedMessage`] per raw transport fetch.
pub struct MessageBuilder {
    limits: LimitsConfig,
    encoded_word: Regex,
}

impl MessageBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            limits: config.limits.clone(),
            // RFC 2047 encoded-word; bounded quantifiers only.
            encoded_word: Regex::new(r"=\?[^?\s]{1,40}\?([bBqQ])\?([^?\s]{0,998})\?=")
                .expect("static encoded-word pattern"),
        }
    }

    /// Pre-fetch gate: the transport collaborator checks the announced size
    /// here before retrieving the payload at all.
    pub fn admits_announced_size(&self, announced: u64) -> bool {
        announced <= self.limits.max_message_bytes()
    }

    pub fn build(&self, raw: RawMail) -> NormalizedMessage {
        let mut truncation = TruncationFlags::default();

        let mut headers = HeaderMultiMap::default();
        for (name, value) in &raw.raw_headers {
            headers.insert(name, self.decode_header_value(value));
        }

        let subject = self.extract_subject(&headers, &mut truncation);
        let sender = headers.get_first("from").unwrap_or("").to_string();
        let recipient = headers.get_first("to").unwrap_or("").to_string();
        let date = headers
            .get_first("date")
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let message_id = headers.get_first("message-id").unwrap_or("").to_string();

        let (body_text, body_html) = self.assemble_bodies(&raw.body_parts, &mut truncation);
        let attachments = self.collect_attachments(raw.attachments, &mut truncation);

        NormalizedMessage {
            message_id,
            subject,
            sender,
            recipient,
            date,
            body_text,
            body_html,
            headers,
            attachments,
            truncation,
        }
    }

    fn extract_subject(&self, headers: &HeaderMultiMap, truncation: &mut TruncationFlags) -> String {
        let raw = headers.get_first("subject").unwrap_or("");
        match check_text_limit(raw.chars().count(), self.limits.max_subject_len) {
            LimitOutcome::Ok => raw.to_string(),
            _ => {
                truncation.subject = true;
                log::warn!(
                    "subject truncated to {} chars: {}",
                    self.limits.max_subject_len,
                    sanitize::for_log(raw)
                );
                raw.chars().take(self.limits.max_subject_len).collect()
            }
        }
    }

    /// Linear-time body assembly: one growing buffer per body kind, with the
    /// raw-byte budget checked before any decode cost is paid, and a part
    /// ceiling against MIME bombs.
    fn assemble_bodies(
        &self,
        parts: &[RawMimePart],
        truncation: &mut TruncationFlags,
    ) -> (String, String) {
        let mut text = String::new();
        let mut html = String::new();
        let mut text_len = 0usize;
        let mut html_len = 0usize;

        for (index, part) in parts.iter().enumerate() {
            if index >= self.limits.max_mime_parts {
                truncation.mime_parts = true;
                log::warn!(
                    "message exceeds {} MIME parts; remaining parts skipped",
                    self.limits.max_mime_parts
                );
                break;
            }

            let content_type = part.content_type.to_ascii_lowercase();
            let (buffer, used, flag): (&mut String, &mut usize, &mut bool) =
                if content_type.starts_with("text/html") {
                    (&mut html, &mut html_len, &mut truncation.body_html)
                } else if content_type.starts_with("text/plain") {
                    (&mut text, &mut text_len, &mut truncation.body_text)
                } else {
                    continue;
                };

            let remaining = self.limits.max_body_bytes.saturating_sub(*used);
            if remaining == 0 {
                *flag = true;
                continue;
            }
            let raw_slice = if part.data.len() > remaining {
                *flag = true;
                &part.data[..remaining]
            } else {
                &part.data[..]
            };
            let decoded = String::from_utf8_lossy(raw_slice);
            *used += raw_slice.len();
            buffer.push_str(&decoded);
        }

        (text, html)
    }

    fn collect_attachments(
        &self,
        raw: Vec<RawAttachment>,
        truncation: &mut TruncationFlags,
    ) -> Vec<AttachmentRecord> {
        let mut records = Vec::new();
        let mut total_bytes = 0u64;

        for attachment in raw {
            let size = attachment.data.len() as u64;
            match check_attachment_limit(records.len(), total_bytes, size, &self.limits) {
                LimitOutcome::Dropped => {
                    truncation.attachments_dropped = true;
                    log::warn!(
                        "attachment dropped by count/size ceiling: {}",
                        sanitize::for_log(&attachment.filename)
                    );
                    continue;
                }
                LimitOutcome::Truncated => {
                    truncation.attachment_bytes = true;
                }
                LimitOutcome::Ok => {}
            }

            let mut payload = attachment.data;
            let truncated = payload.len() > self.limits.max_attachment_bytes;
            if truncated {
                payload.truncate(self.limits.max_attachment_bytes);
            }

            let raw_filename = self.decode_header_value(&attachment.filename);
            let sanitized_filename = sanitize_filename(&raw_filename);
            let signature =
                filetype::verify_signature(&attachment.declared_mime, &sanitized_filename, &payload);

            total_bytes += payload.len() as u64;
            records.push(AttachmentRecord {
                raw_filename,
                sanitized_filename,
                declared_mime: attachment.declared_mime,
                byte_size: size.max(attachment.declared_size),
                payload,
                truncated,
                signature,
            });
        }

        records
    }

    /// Decode RFC 2047 encoded-words in a header value, falling back to the
    /// raw text for any malformed word.
    fn decode_header_value(&self, value: &str) -> String {
        if !value.contains("=?") {
            return value.to_string();
        }
        self.encoded_word
            .replace_all(value, |caps: &regex::Captures| {
                let encoding = &caps[1];
                let payload = &caps[2];
                let decoded = if encoding.eq_ignore_ascii_case("b") {
                    general_purpose::STANDARD
                        .decode(payload)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .ok()
                } else {
                    Some(decode_quoted_printable(payload))
                };
                decoded.unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

fn decode_quoted_printable(payload: &str) -> String {
    let mut out = Vec::with_capacity(payload.len());
    let bytes = payload.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push((h * 16 + l) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
