//! Sanitization of untrusted message-derived text.
//!
//! Every string that originates in a message (subject, sender, filenames,
//! indicator evidence) passes through here before it is logged or embedded
//! in a channel payload. All transforms are idempotent.

/// Returns true for characters that must never reach a log line or an
/// alert payload: ASCII/Latin-1 control codes and the Unicode format
/// characters used for text-direction spoofing.
fn is_disallowed(ch: char) -> bool {
    let code = ch as u32;
    matches!(code,
        0x00..=0x08 | 0x0B..=0x1F | 0x7F..=0x9F // control, minus \t \n \r handled separately
        | 0x200B..=0x200F                        // zero-width + directional marks
        | 0x202A..=0x202E                        // bidi embedding/override
        | 0x2060..=0x2064                        // word joiner, invisible operators
        | 0x2066..=0x2069                        // bidi isolates
        | 0xFEFF                                 // zero-width no-break space / BOM
        | 0xFFF9..=0xFFFB
    )
}

/// Sanitize text for embedding into an alert payload or console line.
/// Newlines and tabs become single spaces; control and format characters
/// are dropped entirely.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' | '\r' | '\t' => out.push(' '),
            c if is_disallowed(c) => {}
            c => out.push(c),
        }
    }
    out
}

/// Sanitize text for logging: like [`clean_text`] but newlines are escaped
/// visibly (so a forged header cannot fake additional log lines) and the
/// result is truncated to `max_len` characters.
pub fn for_log(text: &str) -> String {
    const MAX_LOG_LEN: usize = 255;
    let mut out = String::with_capacity(text.len().min(MAX_LOG_LEN + 8));
    for ch in text.chars() {
        if out.len() >= MAX_LOG_LEN {
            out.push_str("...");
            break;
        }
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if is_disallowed(c) => {}
            c => out.push(c),
        }
    }
    out
}

/// Guard against spreadsheet formula injection when alert text may end up
/// in an exported CSV. A leading `=`, `+`, `-`, `@` or `|` (after optional
/// whitespace) gets a quote prefix. Already-quoted text is left alone.
pub fn csv_safe(text: &str) -> String {
    let stripped = text.trim_start();
    let dangerous = stripped.starts_with(['=', '+', '-', '@', '|'])
        || text.starts_with(['\t', '\r']);
    if dangerous && !text.starts_with('\'') {
        format!("'{}", text)
    } else {
        text.to_string()
    }
}

/// Escape the characters Slack's message markup treats specially.
/// Applied after [`clean_text`]; double-escaping is avoided by checking
/// for already-escaped entities.
pub fn slack_escape(text: &str) -> String {
    // `&` only when it does not already start an entity we produce.
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let ch = text[i..].chars().next().unwrap();
        match ch {
            '&' => {
                let rest = &text[i..];
                if rest.starts_with("&amp;") || rest.starts_with("&lt;") || rest.starts_with("&gt;")
                {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
            }
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
        i += ch.len_utf8();
    }
    out
}

/// Redact credential-bearing query parameters and webhook tokens from a URL
/// before it appears in an alert payload or error message.
pub fn redact_url_secrets(raw: &str) -> String {
    let mut parsed = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };

    const SENSITIVE_KEYS: [&str; 11] = [
        "password", "token", "secret", "key", "apikey", "api_key", "access_token", "auth",
        "authorization", "sig", "signature",
    ];

    let redacted_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            if SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.into_owned(), "[REDACTED]".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    if parsed.query().is_some() {
        let q: Vec<String> = redacted_pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        parsed.set_query(Some(&q.join("&")));
    }

    // Slack and Discord webhook URLs carry the token as the last path segment.
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let slack_hook = (host == "hooks.slack.com" || host.ends_with(".slack.com"))
        && parsed.path().starts_with("/services/");
    let discord_hook = (host == "discord.com" || host.ends_with(".discord.com"))
        && parsed.path().starts_with("/api/webhooks/");
    if slack_hook || discord_hook {
        let mut segments: Vec<String> = parsed
            .path_segments()
            .map(|s| s.map(str::to_string).collect())
            .unwrap_or_default();
        if segments.len() >= 3 {
            if let Some(last) = segments.last_mut() {
                if *last != "[REDACTED]" {
                    *last = "[REDACTED]".to_string();
                }
            }
            parsed.set_path(&segments.join("/"));
        }
    }

    parsed.to_string()
}
