//! Runtime configuration. One immutable [`Config`] is loaded and validated
//! at startup and handed by reference into every component constructor;
//! nothing reads limits or thresholds from anywhere else.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub spam: SpamConfig,
    pub nlp: NlpConfig,
    pub media: MediaConfig,
    pub scoring: ScoringConfig,
    pub timeouts: TimeoutConfig,
    pub alerts: AlertConfig,
    pub runtime: RuntimeConfig,
}

/// Size and shape ceilings applied during message normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_subject_len: usize,
    pub max_body_bytes: usize,
    pub max_mime_parts: usize,
    pub max_attachment_count: usize,
    pub max_attachment_bytes: usize,
    pub max_total_attachment_bytes: u64,
    pub max_archive_depth: usize,
    pub max_archive_entries: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subject_len: 1024,
            max_body_bytes: 1024 * 1024,
            max_mime_parts: 100,
            max_attachment_count: 10,
            max_attachment_bytes: 25 * 1024 * 1024,
            max_total_attachment_bytes: 100 * 1024 * 1024,
            max_archive_depth: 3,
            max_archive_entries: 64,
        }
    }
}

impl LimitsConfig {
    /// Overhead granted on top of the attachment budget for headers and
    /// bodies when gating a fetch by announced size.
    pub fn max_message_bytes(&self) -> u64 {
        self.max_total_attachment_bytes + 5 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub check_headers: bool,
    pub check_urls: bool,
    pub url_cache_size: usize,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            check_headers: true,
            check_urls: true,
            url_cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NlpConfig {
    /// Characters of text handed to the classifier; also the memo-cache key
    /// length, so keys stay small and hit rates stay meaningful.
    pub classifier_max_chars: usize,
    pub pattern_weight: f64,
    pub model_weight: f64,
    /// Each source score is clamped to this cap before weighting.
    pub source_score_cap: f64,
    pub inference_cache_size: usize,
    /// Budget for one classifier call; an overrun degrades the layer to
    /// pattern-only scoring instead of eating the whole layer budget.
    pub classifier_timeout_ms: u64,
}

impl Default for NlpConfig {
    fn default() -> Self {
        Self {
            classifier_max_chars: 4096,
            pattern_weight: 1.0,
            model_weight: 1.0,
            source_score_cap: 40.0,
            inference_cache_size: 1024,
            classifier_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    pub deepfake_enabled: bool,
    /// "simulator" or "disabled"; external providers plug in behind the
    /// same scanner interface.
    pub deepfake_provider: String,
    /// Per-attachment score at or above which media heuristics are skipped.
    pub fail_closed_score: f64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deepfake_enabled: true,
            deepfake_provider: "simulator".to_string(),
            fail_closed_score: 5.0,
        }
    }
}

/// Layer weights and verdict thresholds (ascending, closed-open intervals;
/// a score equal to a boundary lands in the higher tier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub spam_weight: f64,
    pub nlp_weight: f64,
    pub media_weight: f64,
    pub low_threshold: f64,
    pub medium_threshold: f64,
    pub high_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            spam_weight: 1.0,
            nlp_weight: 1.0,
            media_weight: 1.0,
            low_threshold: 5.0,
            medium_threshold: 10.0,
            high_threshold: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub spam_ms: u64,
    pub nlp_ms: u64,
    pub media_ms: u64,
    /// Budget for one attachment's signature/archive/heuristic steps.
    pub per_attachment_ms: u64,
    pub channel_secs: u64,
    /// Conservative score contributed by a layer that exceeds its budget.
    pub timeout_score: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            spam_ms: 5_000,
            nlp_ms: 10_000,
            media_ms: 60_000,
            per_attachment_ms: 10_000,
            channel_secs: 10,
            timeout_score: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub console: bool,
    /// Reports scoring below this are logged but not dispatched.
    pub min_alert_score: f64,
    pub webhook_enabled: bool,
    pub webhook_url: Option<String>,
    pub slack_enabled: bool,
    pub slack_webhook: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            console: true,
            min_alert_score: 5.0,
            webhook_enabled: false,
            webhook_url: None,
            slack_enabled: false,
            slack_webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_concurrent_messages: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 4,
        }
    }
}

fn is_https(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| u.scheme() == "https" && u.host_str().is_some())
        .unwrap_or(false)
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "/etc/mailsentry.yaml"
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Startup validation. Configuration errors are the only fatal errors in
    /// the system; everything after this degrades instead of failing.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if !(s.low_threshold < s.medium_threshold && s.medium_threshold < s.high_threshold) {
            bail!(
                "risk thresholds must be ascending: low={} medium={} high={}",
                s.low_threshold,
                s.medium_threshold,
                s.high_threshold
            );
        }
        if s.spam_weight < 0.0 || s.nlp_weight < 0.0 || s.media_weight < 0.0 {
            bail!("layer weights must be non-negative");
        }
        if self.limits.max_subject_len == 0
            || self.limits.max_body_bytes == 0
            || self.limits.max_mime_parts == 0
            || self.limits.max_attachment_count == 0
            || self.limits.max_attachment_bytes == 0
        {
            bail!("normalization limits must be greater than zero");
        }
        if self.limits.max_archive_depth == 0 || self.limits.max_archive_entries == 0 {
            bail!("archive inspection limits must be greater than zero");
        }
        if self.nlp.classifier_max_chars == 0 {
            bail!("nlp.classifier_max_chars must be greater than zero");
        }
        if self.nlp.classifier_timeout_ms == 0 {
            bail!("nlp.classifier_timeout_ms must be greater than zero");
        }
        if self.timeouts.timeout_score < 0.0 {
            bail!("timeouts.timeout_score must be non-negative");
        }
        if self.runtime.max_concurrent_messages == 0 {
            bail!("runtime.max_concurrent_messages must be greater than zero");
        }
        if self.alerts.webhook_enabled {
            match &self.alerts.webhook_url {
                Some(u) if is_https(u) => {}
                Some(_) => bail!("alerts.webhook_url must use https"),
                None => bail!("webhook alerts enabled but no URL configured"),
            }
        }
        if self.alerts.slack_enabled {
            match &self.alerts.slack_webhook {
                Some(u) if is_https(u) => {
                    if !u.contains("hooks.slack.com") {
                        bail!("alerts.slack_webhook must be a hooks.slack.com endpoint");
                    }
                }
                Some(_) => bail!("alerts.slack_webhook must use https"),
                None => bail!("slack alerts enabled but no webhook configured"),
            }
        }
        match self.media.deepfake_provider.as_str() {
            "simulator" | "disabled" => {}
            other => bail!("unknown deepfake provider: {}", other),
        }
        Ok(())
    }
}
