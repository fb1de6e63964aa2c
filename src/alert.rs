//! Alert dispatch over pluggable channels.
//!
//! Every channel sanitizes message-derived text itself at the point of
//! embedding; nothing here trusts earlier pipeline stages to have done it
//! (the transforms are idempotent, so double application is harmless).
//! Channel failures are collected per channel and never propagate to the
//! caller or to the other channels.

use crate::config::{AlertConfig, Config};
use crate::report::{RiskLevel, ThreatReport};
use crate::sanitize;
use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub delivered: bool,
    pub detail: String,
}

pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, report: &ThreatReport) -> Result<()>;
}

/// Fans one report out to every configured channel, collecting one outcome
/// per channel. Reports under the alert floor are acknowledged on the
/// console only.
pub struct AlertDispatcher {
    config: AlertConfig,
    channels: Vec<Box<dyn AlertChannel>>,
}

impl AlertDispatcher {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
        if config.alerts.console {
            channels.push(Box::new(ConsoleChannel));
        }
        if config.alerts.webhook_enabled {
            if let Some(url) = &config.alerts.webhook_url {
                channels.push(Box::new(WebhookChannel::new(
                    url.clone(),
                    config.timeouts.channel_secs,
                )?));
            }
        }
        if config.alerts.slack_enabled {
            if let Some(url) = &config.alerts.slack_webhook {
                channels.push(Box::new(SlackChannel::new(
                    url.clone(),
                    config.timeouts.channel_secs,
                )?));
            }
        }
        Ok(Self::with_channels(config.alerts.clone(), channels))
    }

    pub fn with_channels(config: AlertConfig, channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self { config, channels }
    }

    pub fn dispatch(&self, report: &ThreatReport) -> Vec<ChannelOutcome> {
        if report.overall_score < self.config.min_alert_score {
            if self.config.console {
                println!("{}", clean_report_line(report));
            }
            log::debug!(
                "report below alert floor ({:.2} < {:.2}), not dispatched",
                report.overall_score,
                self.config.min_alert_score
            );
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let outcome = match channel.deliver(report) {
                Ok(()) => {
                    log::info!("alert delivered via {}", channel.name());
                    ChannelOutcome {
                        channel: channel.name().to_string(),
                        delivered: true,
                        detail: String::new(),
                    }
                }
                Err(e) => {
                    log::error!(
                        "alert delivery via {} failed: {}",
                        channel.name(),
                        sanitize::for_log(&e.to_string())
                    );
                    ChannelOutcome {
                        channel: channel.name().to_string(),
                        delivered: false,
                        detail: sanitize::for_log(&e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Compact one-liner for messages under the alert floor.
fn clean_report_line(report: &ThreatReport) -> String {
    let subject = sanitize::csv_safe(&sanitize::clean_text(&report.message.subject));
    let short: String = subject.chars().take(50).collect();
    let ellipsis = if subject.chars().count() > 50 { "..." } else { "" };
    format!(
        "CLEAN | {} | score {:>5.1} | {}{}",
        report.generated_at.format("%H:%M:%S"),
        report.overall_score,
        short,
        ellipsis
    )
}

pub struct ConsoleChannel;

impl ConsoleChannel {
    /// Console lines may be exported to spreadsheets, so fields get the CSV
    /// formula guard on top of control stripping.
    fn render(report: &ThreatReport) -> String {
        let safe = |text: &str| sanitize::csv_safe(&sanitize::clean_text(text));
        let mut out = String::new();
        let bar = "=".repeat(78);

        out.push_str(&format!("{}\n", bar));
        out.push_str(&format!("SECURITY ALERT - {} RISK\n", report.risk_level));
        out.push_str(&format!("{}\n", bar));
        out.push_str(&format!("Time:    {}\n", report.generated_at.to_rfc3339()));
        out.push_str(&format!("Subject: {}\n", safe(&report.message.subject)));
        out.push_str(&format!("From:    {}\n", safe(&report.message.sender)));
        out.push_str(&format!("To:      {}\n", safe(&report.message.recipient)));
        out.push_str(&format!(
            "Score:   {:.2} ({})\n",
            report.overall_score, report.risk_level
        ));

        for (title, result) in [
            ("SPAM", &report.layers.spam),
            ("NLP", &report.layers.nlp),
            ("MEDIA", &report.layers.media),
        ] {
            out.push_str(&format!("{} ({:.2}):\n", title, result.score));
            if result.indicators.is_empty() {
                out.push_str("  - no findings\n");
            }
            for indicator in result.indicators.iter().take(5) {
                out.push_str(&format!(
                    "  - {} [{:.1}]: {}\n",
                    safe(&indicator.label),
                    indicator.weight,
                    safe(&indicator.evidence)
                ));
            }
        }

        out.push_str("RECOMMENDATIONS:\n");
        for recommendation in &report.recommendations {
            out.push_str(&format!("  > {}\n", safe(recommendation)));
        }
        out.push_str(&bar);
        out
    }
}

impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    fn deliver(&self, report: &ThreatReport) -> Result<()> {
        println!("{}", Self::render(report));
        Ok(())
    }
}

/// Copy of the report with URL evidence redacted and all strings re-cleaned,
/// safe to hand to a JSON consumer.
fn redacted_report(report: &ThreatReport) -> ThreatReport {
    let mut copy = report.clone();
    for result in [
        &mut copy.layers.spam,
        &mut copy.layers.nlp,
        &mut copy.layers.media,
    ] {
        for indicator in &mut result.indicators {
            indicator.evidence = sanitize::clean_text(&indicator.evidence);
            if indicator.category == crate::report::IndicatorCategory::SuspiciousUrl {
                indicator.evidence = sanitize::redact_url_secrets(&indicator.evidence);
            }
        }
    }
    copy.message.subject = sanitize::clean_text(&copy.message.subject);
    copy.message.sender = sanitize::clean_text(&copy.message.sender);
    copy.message.recipient = sanitize::clean_text(&copy.message.recipient);
    copy
}

pub struct WebhookChannel {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookChannel {
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("building webhook http client")?;
        Ok(Self { url, client })
    }

    fn payload(report: &ThreatReport) -> serde_json::Value {
        serde_json::to_value(redacted_report(report)).unwrap_or_else(|_| serde_json::json!({}))
    }
}

impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn deliver(&self, report: &ThreatReport) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(report))
            .send()
            // reqwest errors carry the URL, which may embed a token.
            .map_err(|e| anyhow::anyhow!("webhook POST failed: {}", e.without_url()))?;
        response
            .error_for_status()
            .map_err(|e| anyhow::anyhow!("webhook rejected alert: {}", e.without_url()))?;
        Ok(())
    }
}

pub struct SlackChannel {
    webhook: String,
    client: reqwest::blocking::Client,
}

impl SlackChannel {
    pub fn new(webhook: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("building slack http client")?;
        Ok(Self { webhook, client })
    }

    fn payload(report: &ThreatReport) -> serde_json::Value {
        let escape = |text: &str| sanitize::slack_escape(&sanitize::clean_text(text));
        let color = match report.risk_level {
            RiskLevel::Low => "#36a64f",
            RiskLevel::Medium => "#ff9900",
            RiskLevel::High => "#ff0000",
            RiskLevel::Critical => "#8b0000",
        };
        let top_recommendation = report
            .recommendations
            .first()
            .map(|r| escape(r))
            .unwrap_or_else(|| "Review message".to_string());

        serde_json::json!({
            "text": "New email security threat detected",
            "attachments": [{
                "color": color,
                "title": format!("Security Alert - {} Risk", report.risk_level),
                "fields": [
                    { "title": "Subject", "value": escape(&report.message.subject), "short": false },
                    { "title": "From", "value": escape(&report.message.sender), "short": true },
                    { "title": "Threat Score", "value": format!("{:.2}", report.overall_score), "short": true },
                    { "title": "Top Recommendation", "value": top_recommendation, "short": false },
                ],
                "footer": "mailsentry",
                "ts": report.generated_at.timestamp(),
            }]
        })
    }
}

impl AlertChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn deliver(&self, report: &ThreatReport) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook)
            .json(&Self::payload(report))
            .send()
            .map_err(|e| anyhow::anyhow!("slack POST failed: {}", e.without_url()))?;
        response
            .error_for_status()
            .map_err(|e| anyhow::anyhow!("slack rejected alert: {}", e.without_url()))?;
        Ok(())
    }
}
