//! Header, URL, and keyword spam scoring.
//!
//! Authentication checks parse the outcome tokens carried in
//! `Received-SPF` and `Authentication-Results`, never just the presence of a
//! signature header. All free-text patterns use bounded repetition and a
//! combined pre-check gates the per-pattern identification pass.

use crate::config::{Config, SpamConfig};
use crate::message::NormalizedMessage;
use crate::report::{AnalysisResult, Indicator, IndicatorCategory, Layer};
use regex::{Regex, RegexSet};
use std::collections::HashMap;
use std::sync::Mutex;

const SPAM_KEYWORDS: [&str; 8] = [
    r"(?i)\b(viagra|cialis|pharmacy|pills)\b",
    r"(?i)\b(winner|congratulations|prize|lottery)\b",
    r"(?i)\b(urgent|immediate|action required|act now)\b",
    r"(?i)\b(click here|click now|limited time)\b",
    r"(?i)\b(free money|make money|earn cash)\b",
    r"(?i)\b(nigerian prince|inheritance|beneficiary)\b",
    r"(?i)\b(enlarge|enhancement|weight loss)\b",
    r"(?i)\b(casino|poker|gambling)\b",
];

const SUSPICIOUS_URL_PATTERNS: [&str; 6] = [
    r"(?i)bit\.ly",
    r"(?i)tinyurl",
    r"(?i)t\.co",
    r"(?i)goo\.gl",
    r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
    r"[a-z0-9\-]{30,100}",
];

const FREEMAIL_PROVIDERS: [&str; 7] = [
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "aol.com",
    "mail.com",
    "protonmail.com",
];

const CORPORATE_TITLES: [&str; 4] = ["ceo", "president", "director", "manager"];

const REQUIRED_HEADERS: [&str; 4] = ["from", "to", "date", "message-id"];

#[derive(Debug, Clone, Copy)]
struct UrlVerdict {
    score: f64,
    suspicious: bool,
}

pub struct SpamAnalyzer {
    config: SpamConfig,
    keyword_set: RegexSet,
    keyword_patterns: Vec<Regex>,
    url_extraction: Regex,
    money: Regex,
    img_tag: Regex,
    hidden_text: Regex,
    email_address: Regex,
    sender_domain: Regex,
    display_name: Regex,
    suspicious_url_set: RegexSet,
    shortener: Regex,
    // Memo of per-URL verdicts across messages; keyed by the URL string
    // itself and bounded so a URL flood cannot grow it without limit.
    url_cache: Mutex<HashMap<String, UrlVerdict>>,
}

impl SpamAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.spam.clone(),
            keyword_set: RegexSet::new(SPAM_KEYWORDS).expect("static keyword patterns"),
            keyword_patterns: SPAM_KEYWORDS
                .iter()
                .map(|p| Regex::new(p).expect("static keyword pattern"))
                .collect(),
            url_extraction: Regex::new(r#"(?i)https?://[^\s<>"]{1,2048}"#)
                .expect("static url pattern"),
            money: Regex::new(r"(?i)\$\d{1,12}|\d{1,12}\s*(dollar|usd|euro)")
                .expect("static money pattern"),
            img_tag: Regex::new(r"(?i)<img\b").expect("static img pattern"),
            hidden_text: Regex::new(
                r"(?i)font-size:\s*[0-2]px|color:\s*#fff.{0,100}background.{0,100}#fff",
            )
            .expect("static hidden-text pattern"),
            email_address: Regex::new(r"[A-Za-z0-9._%+\-]{1,64}@[A-Za-z0-9.\-]{1,100}")
                .expect("static address pattern"),
            sender_domain: Regex::new(r"[A-Za-z0-9._%+\-]{1,64}@([A-Za-z0-9.\-]{1,100})")
                .expect("static domain pattern"),
            display_name: Regex::new(r"^([^<]{1,100})<").expect("static display-name pattern"),
            suspicious_url_set: RegexSet::new(SUSPICIOUS_URL_PATTERNS)
                .expect("static url patterns"),
            shortener: Regex::new(r"(?i)(bit\.ly|tinyurl|t\.co|goo\.gl)")
                .expect("static shortener pattern"),
            url_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn analyze(&self, message: &NormalizedMessage) -> AnalysisResult {
        let mut result = AnalysisResult::new(Layer::Spam);

        self.analyze_subject(&message.subject, &mut result);

        // URLs are extracted once and shared between body heuristics and the
        // per-URL checks.
        let mut urls: Vec<&str> = self
            .url_extraction
            .find_iter(&message.body_text)
            .map(|m| m.as_str())
            .collect();
        urls.extend(
            self.url_extraction
                .find_iter(&message.body_html)
                .map(|m| m.as_str()),
        );
        let link_count = urls.len();

        self.analyze_body(&message.body_text, &message.body_html, link_count, &mut result);

        if self.config.check_urls {
            self.check_urls(&urls, &mut result);
        }
        if self.config.check_headers {
            self.analyze_headers(message, &mut result);
        }
        self.check_sender(&message.sender, &mut result);

        // This layer reads subject and bodies, so it reports their cuts.
        if message.truncation.subject
            || message.truncation.body_text
            || message.truncation.body_html
            || message.truncation.mime_parts
        {
            result.push(Indicator::new(
                IndicatorCategory::PartialAnalysis,
                "analysis input truncated",
                0.5,
                "subject or body was cut to size limits before analysis",
            ));
        }

        log::debug!("spam analysis complete: score={:.2}", result.score);
        result
    }

    fn analyze_subject(&self, subject: &str, result: &mut AnalysisResult) {
        let has_upper = subject.chars().any(char::is_uppercase);
        let has_lower = subject.chars().any(char::is_lowercase);
        if has_upper && !has_lower && subject.chars().count() > 10 {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "subject in all caps",
                1.0,
                subject,
            ));
        }

        if subject.matches('!').count() > 2 {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "excessive exclamation marks",
                0.5,
                subject,
            ));
        }

        // Set match is the cheap gate; only matched patterns get a second look.
        for index in self.keyword_set.matches(subject) {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "spam keyword in subject",
                1.5,
                SPAM_KEYWORDS[index],
            ));
        }

        if self.money.is_match(subject) {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "money mentioned in subject",
                0.5,
                subject,
            ));
        }
    }

    fn analyze_body(&self, text: &str, html: &str, link_count: usize, result: &mut AnalysisResult) {
        let mut keyword_matches = 0usize;
        for (body, matched) in [
            (text, self.keyword_set.matches(text)),
            (html, self.keyword_set.matches(html)),
        ] {
            for index in matched {
                keyword_matches += self.keyword_patterns[index].find_iter(body).count();
            }
        }
        if keyword_matches > 0 {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "spam keywords in body",
                keyword_matches as f64 * 0.5,
                &format!("{} keyword matches", keyword_matches),
            ));
        }

        if link_count > 10 {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "excessive links",
                1.0,
                &format!("{} links", link_count),
            ));
        }

        if !html.is_empty() && text.trim().chars().count() < 50 {
            let img_count = self.img_tag.find_iter(html).count();
            if img_count > 2 {
                result.push(Indicator::new(
                    IndicatorCategory::SpamContent,
                    "image-heavy body with little text",
                    1.0,
                    &format!("{} images", img_count),
                ));
            }
        }

        if !html.is_empty() && self.hidden_text.is_match(html) {
            result.push(Indicator::new(
                IndicatorCategory::SpamContent,
                "hidden text detected",
                2.0,
                "tiny or background-matching font styling",
            ));
        }
    }

    /// Each unique URL is judged once per message regardless of repetition;
    /// the verdict memo persists across messages up to the configured size.
    fn check_urls(&self, urls: &[&str], result: &mut AnalysisResult) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for url in urls {
            *counts.entry(url).or_insert(0) += 1;
        }

        for (url, count) in counts {
            let verdict = self.check_single_url(url);
            if verdict.suspicious {
                result.push(Indicator::new(
                    IndicatorCategory::SuspiciousUrl,
                    "suspicious url",
                    verdict.score * count as f64,
                    url,
                ));
            }
        }
    }

    fn check_single_url(&self, url: &str) -> UrlVerdict {
        if let Ok(cache) = self.url_cache.lock() {
            if let Some(hit) = cache.get(url) {
                return *hit;
            }
        }

        let verdict = match url::Url::parse(url) {
            Ok(parsed) => {
                let domain = parsed.host_str().unwrap_or("");
                let mut score = 0.0;
                if self.suspicious_url_set.is_match(domain) {
                    score += 0.5;
                }
                if self.shortener.is_match(domain) {
                    score += 0.5;
                }
                UrlVerdict {
                    score,
                    suspicious: score > 0.0,
                }
            }
            Err(_) => UrlVerdict {
                score: 0.0,
                suspicious: false,
            },
        };

        if let Ok(mut cache) = self.url_cache.lock() {
            if cache.len() < self.config.url_cache_size {
                cache.insert(url.to_string(), verdict);
            }
        }
        verdict
    }

    fn analyze_headers(&self, message: &NormalizedMessage, result: &mut AnalysisResult) {
        let headers = &message.headers;

        // Received-SPF is the primary SPF signal. Only the leading result
        // token counts; "fail" inside a comment or a domain name is not an
        // outcome.
        let mut spf_fail = false;
        let mut spf_softfail = false;
        for value in headers.get_all("received-spf") {
            let token = value
                .split_whitespace()
                .next()
                .unwrap_or("")
                .trim_end_matches(';')
                .to_ascii_lowercase();
            match token.as_str() {
                "softfail" => spf_softfail = true,
                "fail" => spf_fail = true,
                _ => {}
            }
        }
        if spf_fail {
            result.push(Indicator::new(
                IndicatorCategory::AuthFailure,
                "spf check failed",
                2.0,
                "Received-SPF reports fail",
            ));
        } else if spf_softfail {
            result.push(Indicator::new(
                IndicatorCategory::AuthFailure,
                "spf soft fail",
                1.0,
                "Received-SPF reports softfail",
            ));
        }

        // Authentication-Results outcome tokens. dkim=neutral usually means
        // the signature failed to verify, so it is penalized like a failure.
        let mut dkim_auth_fail = false;
        let mut spf_auth_fail = false;
        let mut dmarc_fail = false;
        for value in headers.get_all("authentication-results") {
            let lower = value.to_ascii_lowercase();
            if lower.contains("dkim=fail")
                || lower.contains("dkim=permerror")
                || lower.contains("dkim=neutral")
            {
                dkim_auth_fail = true;
            }
            if lower.contains("spf=fail") || lower.contains("spf=permerror") {
                spf_auth_fail = true;
            }
            if lower.contains("dmarc=fail") {
                dmarc_fail = true;
            }
        }
        // An explicit failure token outranks the mere presence of a
        // DKIM-Signature header.
        if dkim_auth_fail {
            result.push(Indicator::new(
                IndicatorCategory::AuthFailure,
                "dkim verification failed",
                2.5,
                "Authentication-Results reports a dkim failure token",
            ));
        }
        // Already caught by Received-SPF above; no double counting.
        if spf_auth_fail && !spf_fail {
            result.push(Indicator::new(
                IndicatorCategory::AuthFailure,
                "spf verification failed",
                2.0,
                "Authentication-Results reports an spf failure token",
            ));
        }
        // DMARC expresses domain alignment and is scored on its own: a
        // message can pass SPF and DKIM individually and still fail it.
        if dmarc_fail {
            result.push(Indicator::new(
                IndicatorCategory::AuthFailure,
                "dmarc verification failed",
                2.5,
                "Authentication-Results reports dmarc=fail",
            ));
        }

        if !headers.contains("dkim-signature") {
            result.push(Indicator::new(
                IndicatorCategory::AuthFailure,
                "missing dkim signature",
                0.5,
                "no DKIM-Signature header present",
            ));
        }

        for name in REQUIRED_HEADERS {
            if !headers.contains(name) {
                result.push(Indicator::new(
                    IndicatorCategory::HeaderAnomaly,
                    "missing required header",
                    0.5,
                    name,
                ));
            }
        }

        let hops = headers.get_all("received").len();
        if hops > 10 {
            result.push(Indicator::new(
                IndicatorCategory::HeaderAnomaly,
                "excessive hops in delivery path",
                1.0,
                &format!("{} Received headers", hops),
            ));
        }

        let from_headers = headers.get_all("from");
        if from_headers.len() > 1 {
            result.push(Indicator::new(
                IndicatorCategory::HeaderAnomaly,
                "multiple from headers",
                2.0,
                &format!("{} From headers", from_headers.len()),
            ));
        }

        if let (Some(from), Some(return_path)) =
            (from_headers.first(), headers.get_first("return-path"))
        {
            let from_lower = from.to_ascii_lowercase();
            let return_lower = return_path.to_ascii_lowercase();
            let from_addr = self.email_address.find(&from_lower);
            let return_addr = self.email_address.find(&return_lower);
            if let (Some(f), Some(r)) = (from_addr, return_addr) {
                if f.as_str() != r.as_str() {
                    result.push(Indicator::new(
                        IndicatorCategory::HeaderAnomaly,
                        "from and return-path mismatch",
                        1.5,
                        &format!("{} vs {}", f.as_str(), r.as_str()),
                    ));
                }
            }
        }
    }

    fn check_sender(&self, sender: &str, result: &mut AnalysisResult) {
        let sender_lower = sender.to_ascii_lowercase();

        if let Some(caps) = self.sender_domain.captures(&sender_lower) {
            let domain = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let claims_title = CORPORATE_TITLES.iter().any(|t| sender_lower.contains(t));
            let freemail = FREEMAIL_PROVIDERS.iter().any(|p| domain.contains(p));
            if claims_title && freemail {
                result.push(Indicator::new(
                    IndicatorCategory::SenderAnomaly,
                    "corporate title with freemail provider",
                    1.5,
                    sender,
                ));
            }
        }

        if let Some(caps) = self.display_name.captures(sender) {
            let display = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            // A display name shaped like an address is a common lure.
            if display.contains('@') || display.contains('.') {
                result.push(Indicator::new(
                    IndicatorCategory::SenderAnomaly,
                    "suspicious display name format",
                    1.0,
                    sender,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBuilder, RawMail, RawMimePart};

    fn analyzer() -> SpamAnalyzer {
        SpamAnalyzer::new(&Config::default())
    }

    fn build(headers: Vec<(&str, &str)>, text: &str, html: &str) -> NormalizedMessage {
        let mut body_parts = Vec::new();
        if !text.is_empty() {
            body_parts.push(RawMimePart {
                content_type: "text/plain".to_string(),
                data: text.as_bytes().to_vec(),
            });
        }
        if !html.is_empty() {
            body_parts.push(RawMimePart {
                content_type: "text/html".to_string(),
                data: html.as_bytes().to_vec(),
            });
        }
        let raw = RawMail {
            raw_headers: headers
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body_parts,
            ..Default::default()
        };
        MessageBuilder::new(&Config::default()).build(raw)
    }

    fn full_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("From", "alice@example.com"),
            ("To", "bob@example.com"),
            ("Date", "Mon, 01 Jan 2024 00:00:00 +0000"),
            ("Message-ID", "<m1@example.com>"),
            ("DKIM-Signature", "v=1; a=rsa-sha256; d=example.com"),
        ]
    }

    fn has_label(result: &AnalysisResult, label: &str) -> bool {
        result.indicators.iter().any(|i| i.label == label)
    }

    #[test]
    fn clean_message_scores_near_zero() {
        let message = build(full_headers(), "see you at the meeting tomorrow", "");
        let result = analyzer().analyze(&message);
        assert_eq!(result.score, 0.0);
        assert!(result.indicators.is_empty());
    }

    #[test]
    fn dkim_fail_token_penalizes_despite_signature_header() {
        let mut headers = full_headers();
        headers.push(("Authentication-Results", "mx.example.com; dkim=fail; spf=pass"));
        let message = build(headers, "hello", "");
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "dkim verification failed"));
        assert!(result.score >= 2.5);
    }

    #[test]
    fn spf_failure_is_not_double_counted_across_headers() {
        let mut headers = full_headers();
        headers.push(("Received-SPF", "fail (sender not permitted)"));
        headers.push(("Authentication-Results", "mx; spf=fail"));
        let message = build(headers, "hello", "");
        let result = analyzer().analyze(&message);
        let spf_indicators = result
            .indicators
            .iter()
            .filter(|i| i.label.starts_with("spf"))
            .count();
        assert_eq!(spf_indicators, 1);
        assert!(has_label(&result, "spf check failed"));
    }

    #[test]
    fn softfail_is_scored_lower_than_fail() {
        let mut headers = full_headers();
        headers.push(("Received-SPF", "softfail (transitioning)"));
        let message = build(headers, "hello", "");
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "spf soft fail"));
        assert!(!has_label(&result, "spf check failed"));
    }

    #[test]
    fn spf_pass_with_fail_in_comment_is_not_penalized() {
        let mut headers = full_headers();
        headers.push((
            "Received-SPF",
            "pass (domain of bounce.mailfail.example designates sender)",
        ));
        let message = build(headers, "hello", "");
        let result = analyzer().analyze(&message);
        assert!(!has_label(&result, "spf check failed"));
        assert!(!has_label(&result, "spf soft fail"));
    }

    #[test]
    fn address_patterns_match_long_real_world_addresses() {
        let analyzer = analyzer();
        let sender = format!("{}@{}.example.com", "a".repeat(64), "b".repeat(80));
        assert!(analyzer.email_address.is_match(&sender));
        let caps = analyzer
            .sender_domain
            .captures(&sender)
            .expect("domain capture");
        assert!(caps.get(1).unwrap().as_str().ends_with("example.com"));
    }

    #[test]
    fn dmarc_failure_is_scored_independently() {
        let mut headers = full_headers();
        headers.push(("Authentication-Results", "mx; spf=pass; dkim=pass; dmarc=fail"));
        let message = build(headers, "hello", "");
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "dmarc verification failed"));
        assert!(!has_label(&result, "dkim verification failed"));
    }

    #[test]
    fn missing_required_headers_are_each_flagged() {
        let message = build(vec![("From", "a@example.com")], "hello", "");
        let result = analyzer().analyze(&message);
        let missing = result
            .indicators
            .iter()
            .filter(|i| i.label == "missing required header")
            .count();
        assert_eq!(missing, 3); // to, date, message-id
    }

    #[test]
    fn repeated_from_and_return_path_mismatch_are_flagged() {
        let mut headers = full_headers();
        headers.push(("From", "second@evil.test"));
        headers.push(("Return-Path", "<bounce@evil.test>"));
        let message = build(headers, "hello", "");
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "multiple from headers"));
        assert!(has_label(&result, "from and return-path mismatch"));
    }

    #[test]
    fn spam_keywords_raise_subject_and_body_scores() {
        let mut headers = full_headers();
        headers.push(("Subject", "CONGRATULATIONS WINNER!!! CLAIM YOUR PRIZE"));
        let message = build(
            headers,
            "You are a winner! Claim the lottery prize with free money now.",
            "",
        );
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "subject in all caps"));
        assert!(has_label(&result, "excessive exclamation marks"));
        assert!(has_label(&result, "spam keyword in subject"));
        assert!(has_label(&result, "spam keywords in body"));
        assert!(result.score >= 5.0);
    }

    #[test]
    fn duplicate_urls_are_judged_once_with_count_applied() {
        let body = "visit http://bit.ly/x now http://bit.ly/x and http://bit.ly/x";
        let message = build(full_headers(), body, "");
        let result = analyzer().analyze(&message);
        let url_indicators: Vec<_> = result
            .indicators
            .iter()
            .filter(|i| i.label == "suspicious url")
            .collect();
        assert_eq!(url_indicators.len(), 1);
        // shortener + suspicious pattern, times three occurrences
        assert_eq!(url_indicators[0].weight, 3.0);
    }

    #[test]
    fn url_cache_never_exceeds_its_bound() {
        let mut config = Config::default();
        config.spam.url_cache_size = 2;
        let analyzer = SpamAnalyzer::new(&config);
        for i in 0..10 {
            let body = format!("link http://host{}.test/page", i);
            let message = build(full_headers(), &body, "");
            analyzer.analyze(&message);
        }
        assert!(analyzer.url_cache.lock().unwrap().len() <= 2);
    }

    #[test]
    fn hidden_text_and_image_only_html_are_flagged() {
        let html = r#"<img src=a><img src=b><img src=c><p style="font-size: 1px">buy</p>"#;
        let message = build(full_headers(), "hi", html);
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "hidden text detected"));
        assert!(has_label(&result, "image-heavy body with little text"));
    }

    #[test]
    fn corporate_title_from_freemail_is_flagged() {
        let mut headers = full_headers();
        headers[0] = ("From", "CEO J. Smith <ceo@gmail.com>");
        let message = build(headers, "wire the funds", "");
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "corporate title with freemail provider"));
        assert!(has_label(&result, "suspicious display name format"));
    }

    #[test]
    fn truncated_input_is_visible_in_the_result() {
        let mut config = Config::default();
        config.limits.max_body_bytes = 8;
        let builder = MessageBuilder::new(&config);
        let raw = RawMail {
            raw_headers: full_headers()
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body_parts: vec![RawMimePart {
                content_type: "text/plain".to_string(),
                data: vec![b'a'; 100],
            }],
            ..Default::default()
        };
        let message = builder.build(raw);
        let result = analyzer().analyze(&message);
        assert!(has_label(&result, "analysis input truncated"));
    }
}
