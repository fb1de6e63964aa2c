//! Linguistic threat scoring: social engineering, urgency, authority
//! impersonation, and psychological manipulation language, with an optional
//! pluggable classifier on top.
//!
//! The pattern scan is one combined pass over subject + body. Pattern and
//! model scores are each capped before the configured weighting so neither
//! source can dominate unexpectedly.

use crate::config::{Config, NlpConfig};
use crate::message::NormalizedMessage;
use crate::report::{AnalysisResult, Indicator, IndicatorCategory, Layer};
use anyhow::Result;
use regex::{Regex, RegexSet};
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

const SOCIAL_ENGINEERING_PATTERNS: [(&str, &str); 5] = [
    (
        r"(?i)\b(verify|confirm|update|validate)\s{1,8}(your\s{1,8})?(account|password|information|details|credentials)\b",
        "account verification request",
    ),
    (
        r"(?i)\b(suspended|locked|disabled|restricted|blocked)\s{1,8}(account|access)\b",
        "account suspension threat",
    ),
    (
        r"(?i)\b(unusual|suspicious|unauthorized)\s{1,8}(activity|login|access|transaction)\b",
        "suspicious activity claim",
    ),
    (
        r"(?i)\b(security\s{1,8})(alert|warning|notice|breach|threat)\b",
        "security alert",
    ),
    (
        r"(?i)\b(reset|change|update)\s{1,8}your\s{1,8}password\b",
        "password reset request",
    ),
];

const URGENCY_PATTERNS: [(&str, &str); 5] = [
    (
        r"(?i)\b(urgent|immediate|asap|emergency|critical|time[-\s]sensitive)\b",
        "urgency keyword",
    ),
    (
        r"(?i)\b(within\s{1,8}\d{1,4}\s{1,8}(hours?|minutes?|days?))\b",
        "time pressure",
    ),
    (r"(?i)\b(expire[sd]?|expiring|expiration)\b", "expiration warning"),
    (
        r"(?i)\b(act\s{1,8}now|respond\s{1,8}immediately|don't\s{1,8}delay)\b",
        "action pressure",
    ),
    (
        r"(?i)\b(limited\s{1,8}time|last\s{1,8}chance|final\s{1,8}(warning|notice))\b",
        "scarcity tactic",
    ),
];

const AUTHORITY_PATTERNS: [(&str, &str); 5] = [
    (
        r"(?i)\b(bank|paypal|amazon|microsoft|apple|google|irs|fbi|police)\b",
        "authority entity mention",
    ),
    (
        r"(?i)\b(ceo|president|director|manager|supervisor|administrator)\b",
        "authority title",
    ),
    (
        r"(?i)\b(official|authorized|legitimate|certified)\b",
        "authority claim",
    ),
    (
        r"(?i)\b(government|federal|national|department of)\b",
        "government entity",
    ),
    (
        r"(?i)\b(court|legal|lawsuit|subpoena|warrant)\b",
        "legal threat",
    ),
];

const PSYCHOLOGICAL_PATTERNS: [(&str, &str); 5] = [
    (
        r"(?i)\b(free|bonus|gift|reward|prize|win|won|winner)\b",
        "reward temptation",
    ),
    (
        r"(?i)\b(fear|worry|concern|risk|danger|threat)\b",
        "fear appeal",
    ),
    (
        r"(?i)\b(opportunity|exclusive|special|limited)\b",
        "exclusivity appeal",
    ),
    (
        r"(?i)\b(guarantee|certified|approved|verified)\b",
        "trust signal",
    ),
    (
        r"(?i)\b(secret|confidential|private|insider)\b",
        "secrecy appeal",
    ),
];

const SOCIAL_ENGINEERING_WEIGHT: f64 = 2.0;
const URGENCY_WEIGHT: f64 = 1.5;
const PSYCHOLOGICAL_WEIGHT: f64 = 1.0;
const AUTHORITY_MATCH_WEIGHT: f64 = 0.5;
const AUTHORITY_MISMATCH_WEIGHT: f64 = 2.5;

/// Fixed capability interface for an optional classification model.
///
/// `Ok(None)` means no model is configured; `Err` means the model exists but
/// the call failed. Either way the analyzer degrades to pattern-only scoring
/// instead of failing.
pub trait TextClassifier: Send + Sync {
    /// Threat probability in `[0, 1]` for the (already truncated) text.
    fn classify(&self, text: &str) -> Result<Option<f64>>;
}

/// Default variant: no model configured.
pub struct NoopClassifier;

impl TextClassifier for NoopClassifier {
    fn classify(&self, _text: &str) -> Result<Option<f64>> {
        Ok(None)
    }
}

struct CompiledPattern {
    regex: Regex,
    category: IndicatorCategory,
    label: &'static str,
    per_occurrence_weight: f64,
}

pub struct NlpThreatAnalyzer {
    config: NlpConfig,
    gate: RegexSet,
    patterns: Vec<CompiledPattern>,
    caps_words: Regex,
    sender_domain: Regex,
    classifier: Arc<dyn TextClassifier>,
    // Probability memo keyed by the truncated text, bounded in entry count.
    inference_cache: Mutex<HashMap<String, f64>>,
}

impl NlpThreatAnalyzer {
    pub fn new(config: &Config, classifier: Box<dyn TextClassifier>) -> Self {
        let mut sources: Vec<(&str, IndicatorCategory, &'static str, f64)> = Vec::new();
        for (pattern, label) in SOCIAL_ENGINEERING_PATTERNS {
            sources.push((
                pattern,
                IndicatorCategory::SocialEngineering,
                label,
                SOCIAL_ENGINEERING_WEIGHT,
            ));
        }
        for (pattern, label) in URGENCY_PATTERNS {
            sources.push((pattern, IndicatorCategory::Urgency, label, URGENCY_WEIGHT));
        }
        for (pattern, label) in AUTHORITY_PATTERNS {
            sources.push((
                pattern,
                IndicatorCategory::AuthorityImpersonation,
                label,
                AUTHORITY_MATCH_WEIGHT,
            ));
        }
        for (pattern, label) in PSYCHOLOGICAL_PATTERNS {
            sources.push((
                pattern,
                IndicatorCategory::Psychological,
                label,
                PSYCHOLOGICAL_WEIGHT,
            ));
        }

        let gate = RegexSet::new(sources.iter().map(|(p, _, _, _)| *p))
            .expect("static pattern set");
        let patterns = sources
            .into_iter()
            .map(|(pattern, category, label, weight)| CompiledPattern {
                regex: Regex::new(pattern).expect("static pattern"),
                category,
                label,
                per_occurrence_weight: weight,
            })
            .collect();

        Self {
            config: config.nlp.clone(),
            gate,
            patterns,
            caps_words: Regex::new(r"\b[A-Z]{4,64}\b").expect("static caps pattern"),
            sender_domain: Regex::new(r"@([A-Za-z0-9.\-]{1,100})").expect("static domain pattern"),
            classifier: Arc::from(classifier),
            inference_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn analyze(&self, message: &NormalizedMessage) -> AnalysisResult {
        let mut result = AnalysisResult::new(Layer::Nlp);
        let text = format!("{} {}", message.subject, message.body_text);

        // One set scan decides which patterns get a counting pass at all.
        if self.gate.is_match(&text) {
            let sender_domain = self
                .sender_domain
                .captures(&message.sender.to_ascii_lowercase())
                .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
                .unwrap_or_default();

            for index in self.gate.matches(&text) {
                let pattern = &self.patterns[index];
                if pattern.category == IndicatorCategory::AuthorityImpersonation {
                    self.score_authority(pattern, &text, &sender_domain, &mut result);
                } else {
                    let count = pattern.regex.find_iter(&text).count();
                    if count > 0 {
                        result.push(Indicator::new(
                            pattern.category,
                            pattern.label,
                            count as f64 * pattern.per_occurrence_weight,
                            &format!("{} occurrences", count),
                        ));
                    }
                }
            }
        }

        self.score_shouting(&text, &mut result);

        let pattern_score = result.score;
        let model_raw = self.model_score(&text, &mut result);

        // Each source is capped before weighting.
        let cap = self.config.source_score_cap;
        result.score = self.config.pattern_weight * pattern_score.min(cap)
            + self.config.model_weight * model_raw.min(cap);

        log::debug!(
            "nlp analysis complete: pattern={:.2} model={:.2} score={:.2}",
            pattern_score,
            model_raw,
            result.score
        );
        result
    }

    /// Authority mentions that do not match the sender's domain score much
    /// higher than ones that do: "PayPal" from paypal.com is branding,
    /// "PayPal" from evil.test is impersonation.
    fn score_authority(
        &self,
        pattern: &CompiledPattern,
        text: &str,
        sender_domain: &str,
        result: &mut AnalysisResult,
    ) {
        let matches: Vec<&str> = pattern.regex.find_iter(text).map(|m| m.as_str()).collect();
        if matches.is_empty() {
            return;
        }

        let mismatch = sender_domain.is_empty()
            || matches
                .iter()
                .any(|m| !sender_domain.contains(&m.to_ascii_lowercase()));

        if mismatch {
            result.push(Indicator::new(
                pattern.category,
                pattern.label,
                matches.len() as f64 * AUTHORITY_MISMATCH_WEIGHT,
                &format!("domain mismatch: {}", matches.join(", ")),
            ));
        } else {
            result.push(Indicator::new(
                pattern.category,
                pattern.label,
                matches.len() as f64 * AUTHORITY_MATCH_WEIGHT,
                &matches.join(", "),
            ));
        }
    }

    fn score_shouting(&self, text: &str, result: &mut AnalysisResult) {
        let exclamations = text.matches('!').count();
        if exclamations > 2 {
            result.push(Indicator::new(
                IndicatorCategory::Urgency,
                "excessive exclamation marks",
                exclamations as f64 * 0.5,
                &format!("{} exclamation marks", exclamations),
            ));
        }

        let caps_words = self.caps_words.find_iter(text).count();
        if caps_words > 3 {
            result.push(Indicator::new(
                IndicatorCategory::Urgency,
                "excessive caps words",
                caps_words as f64 * 0.3,
                &format!("{} all-caps words", caps_words),
            ));
        }
    }

    /// Runs the optional classifier over the truncated text and returns the
    /// raw model score (0 when absent, unavailable, or below the 0.5 line).
    /// Truncation happens before the memo key is computed so cache keys stay
    /// small. The call runs on its own thread under its own time budget, so
    /// a hanging model cannot consume the whole layer budget: an overrun
    /// degrades to pattern-only scoring like any other model failure.
    fn model_score(&self, text: &str, result: &mut AnalysisResult) -> f64 {
        let truncated = truncate_chars(text, self.config.classifier_max_chars);

        if let Some(hit) = self
            .inference_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(truncated).copied())
        {
            return self.apply_probability(hit, result);
        }

        let (tx, rx) = mpsc::channel();
        let classifier = Arc::clone(&self.classifier);
        let input = truncated.to_string();
        std::thread::spawn(move || {
            let _ = tx.send(classifier.classify(&input));
        });

        match rx.recv_timeout(Duration::from_millis(self.config.classifier_timeout_ms)) {
            Ok(Ok(Some(p))) => {
                let p = p.clamp(0.0, 1.0);
                if let Ok(mut cache) = self.inference_cache.lock() {
                    if cache.len() < self.config.inference_cache_size {
                        cache.insert(truncated.to_string(), p);
                    }
                }
                self.apply_probability(p, result)
            }
            Ok(Ok(None)) => 0.0,
            Ok(Err(e)) => {
                log::warn!("classifier unavailable, falling back to patterns: {}", e);
                result.push(Indicator::new(
                    IndicatorCategory::ModelSignal,
                    "classifier unavailable",
                    0.0,
                    "model inference failed; pattern-only score",
                ));
                0.0
            }
            Err(_) => {
                log::warn!(
                    "classifier exceeded {}ms, falling back to patterns",
                    self.config.classifier_timeout_ms
                );
                result.push(Indicator::new(
                    IndicatorCategory::ModelSignal,
                    "classifier timed out",
                    0.0,
                    "model inference exceeded its time budget; pattern-only score",
                ));
                0.0
            }
        }
    }

    fn apply_probability(&self, p: f64, result: &mut AnalysisResult) -> f64 {
        // Map (0.5, 1.0] onto (0, 10] points.
        if p > 0.5 {
            let raw = (p - 0.5) * 20.0;
            result.push(Indicator::new(
                IndicatorCategory::ModelSignal,
                "model threat signal",
                raw,
                &format!("threat probability {:.2}", p),
            ));
            raw
        } else {
            0.0
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBuilder, RawMail, RawMimePart};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn build(sender: &str, subject: &str, body: &str) -> NormalizedMessage {
        let raw = RawMail {
            raw_headers: vec![
                ("From".to_string(), sender.to_string()),
                ("Subject".to_string(), subject.to_string()),
            ],
            body_parts: vec![RawMimePart {
                content_type: "text/plain".to_string(),
                data: body.as_bytes().to_vec(),
            }],
            ..Default::default()
        };
        MessageBuilder::new(&Config::default()).build(raw)
    }

    fn analyzer() -> NlpThreatAnalyzer {
        NlpThreatAnalyzer::new(&Config::default(), Box::new(NoopClassifier))
    }

    struct RecordingClassifier {
        calls: Arc<AtomicUsize>,
        lengths: Arc<Mutex<Vec<usize>>>,
        probability: f64,
    }

    impl TextClassifier for RecordingClassifier {
        fn classify(&self, text: &str) -> Result<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.lengths.lock().unwrap().push(text.chars().count());
            Ok(Some(self.probability))
        }
    }

    struct FailingClassifier;

    impl TextClassifier for FailingClassifier {
        fn classify(&self, _text: &str) -> Result<Option<f64>> {
            Err(anyhow!("inference backend unreachable"))
        }
    }

    struct SlowClassifier;

    impl TextClassifier for SlowClassifier {
        fn classify(&self, _text: &str) -> Result<Option<f64>> {
            std::thread::sleep(std::time::Duration::from_millis(500));
            Ok(Some(0.99))
        }
    }

    #[test]
    fn neutral_text_scores_zero() {
        let message = build(
            "colleague@example.com",
            "lunch",
            "shall we grab lunch at noon",
        );
        let result = analyzer().analyze(&message);
        assert_eq!(result.score, 0.0);
        assert!(result.indicators.is_empty());
    }

    #[test]
    fn phishing_text_fires_multiple_categories() {
        let message = build(
            "support@evil.test",
            "Urgent: verify your account",
            "Your account will be suspended. Act now to verify your account within 24 hours.",
        );
        let result = analyzer().analyze(&message);
        assert!(result.has_category(IndicatorCategory::SocialEngineering));
        assert!(result.has_category(IndicatorCategory::Urgency));
        assert!(result.score > 5.0);
    }

    #[test]
    fn authority_mention_from_foreign_domain_scores_as_mismatch() {
        let message = build(
            "alerts@evil.test",
            "notice",
            "Your PayPal balance requires attention",
        );
        let result = analyzer().analyze(&message);
        let indicator = result
            .indicators
            .iter()
            .find(|i| i.category == IndicatorCategory::AuthorityImpersonation)
            .expect("authority indicator");
        assert_eq!(indicator.weight, AUTHORITY_MISMATCH_WEIGHT);
        assert!(indicator.evidence.contains("domain mismatch"));
    }

    #[test]
    fn authority_mention_from_matching_domain_scores_low() {
        let message = build(
            "service@paypal.com",
            "receipt",
            "Thanks for using paypal this month",
        );
        let result = analyzer().analyze(&message);
        let indicator = result
            .indicators
            .iter()
            .find(|i| i.category == IndicatorCategory::AuthorityImpersonation)
            .expect("authority indicator");
        assert_eq!(indicator.weight, AUTHORITY_MATCH_WEIGHT);
    }

    #[test]
    fn shouting_heuristics_fire() {
        let message = build(
            "a@example.com",
            "HELLO THERE FRIEND",
            "WIRE THE MONEY TODAY!!! DONT WAIT!!!",
        );
        let result = analyzer().analyze(&message);
        assert!(result
            .indicators
            .iter()
            .any(|i| i.label == "excessive exclamation marks"));
        assert!(result
            .indicators
            .iter()
            .any(|i| i.label == "excessive caps words"));
    }

    #[test]
    fn model_signal_is_added_above_the_half_line() {
        let classifier = RecordingClassifier {
            calls: Arc::new(AtomicUsize::new(0)),
            lengths: Arc::new(Mutex::new(Vec::new())),
            probability: 0.9,
        };
        let analyzer = NlpThreatAnalyzer::new(&Config::default(), Box::new(classifier));
        let message = build("a@example.com", "hi", "completely ordinary note");
        let result = analyzer.analyze(&message);
        let model = result
            .indicators
            .iter()
            .find(|i| i.category == IndicatorCategory::ModelSignal)
            .expect("model indicator");
        assert!((model.weight - 8.0).abs() < 1e-9); // (0.9 - 0.5) * 20
        assert!((result.score - 8.0).abs() < 1e-9);
    }

    #[test]
    fn failing_classifier_degrades_to_pattern_score() {
        let analyzer = NlpThreatAnalyzer::new(&Config::default(), Box::new(FailingClassifier));
        let message = build(
            "support@evil.test",
            "urgent",
            "verify your account immediately",
        );
        let result = analyzer.analyze(&message);
        assert!(result
            .indicators
            .iter()
            .any(|i| i.label == "classifier unavailable"));
        assert!(result.score > 0.0);
    }

    #[test]
    fn hanging_classifier_times_out_and_keeps_the_pattern_score() {
        let mut config = Config::default();
        config.nlp.classifier_timeout_ms = 10;
        let analyzer = NlpThreatAnalyzer::new(&config, Box::new(SlowClassifier));
        let message = build(
            "support@evil.test",
            "urgent",
            "verify your account immediately",
        );
        let result = analyzer.analyze(&message);
        assert!(result
            .indicators
            .iter()
            .any(|i| i.label == "classifier timed out"));
        assert!(!result
            .indicators
            .iter()
            .any(|i| i.label == "model threat signal"));
        assert!(result.score > 0.0);
    }

    #[test]
    fn sender_domain_pattern_handles_long_domains() {
        let message = build(
            &format!("alerts@{}.paypal.com", "p".repeat(60)),
            "receipt",
            "Thanks for using paypal this month",
        );
        let result = analyzer().analyze(&message);
        let indicator = result
            .indicators
            .iter()
            .find(|i| i.category == IndicatorCategory::AuthorityImpersonation)
            .expect("authority indicator");
        assert_eq!(indicator.weight, AUTHORITY_MATCH_WEIGHT);
    }

    #[test]
    fn inference_is_cached_per_truncated_text() {
        let calls = Arc::new(AtomicUsize::new(0));
        let classifier = RecordingClassifier {
            calls: Arc::clone(&calls),
            lengths: Arc::new(Mutex::new(Vec::new())),
            probability: 0.8,
        };
        let analyzer = NlpThreatAnalyzer::new(&Config::default(), Box::new(classifier));
        let message = build("a@example.com", "same", "same text each time");
        analyzer.analyze(&message);
        analyzer.analyze(&message);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn text_is_truncated_before_classification_and_caching() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let classifier = RecordingClassifier {
            calls: Arc::new(AtomicUsize::new(0)),
            lengths: Arc::clone(&lengths),
            probability: 0.2,
        };
        let mut config = Config::default();
        config.nlp.classifier_max_chars = 32;
        let analyzer = NlpThreatAnalyzer::new(&config, Box::new(classifier));
        let message = build("a@example.com", "s", &"long body ".repeat(100));
        analyzer.analyze(&message);
        assert_eq!(*lengths.lock().unwrap(), vec![32]);
        let cache = analyzer.inference_cache.lock().unwrap();
        assert!(cache.keys().all(|k| k.chars().count() <= 32));
    }

    #[test]
    fn sources_are_capped_before_weighting() {
        let mut config = Config::default();
        config.nlp.source_score_cap = 3.0;
        let analyzer = NlpThreatAnalyzer::new(&config, Box::new(NoopClassifier));
        let body = "verify your account. ".repeat(20);
        let message = build("support@evil.test", "urgent action required", &body);
        let result = analyzer.analyze(&message);
        assert!(result.score <= 3.0 * 2.0); // pattern cap + model cap, unit weights
    }
}
