//! Layer results, the aggregated threat verdict, and recommendation
//! generation. Aggregation is a pure function of the three layer results
//! and the scoring configuration: same inputs, bit-identical report.

use crate::config::ScoringConfig;
use crate::message::NormalizedMessage;
use crate::sanitize;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Layer {
    Spam,
    Nlp,
    Media,
}

/// What kind of signal an indicator represents. Recommendations are derived
/// from the set of fired categories, which keeps them reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndicatorCategory {
    AuthFailure,
    HeaderAnomaly,
    SuspiciousUrl,
    SpamContent,
    SenderAnomaly,
    SocialEngineering,
    Urgency,
    AuthorityImpersonation,
    Psychological,
    ModelSignal,
    DangerousAttachment,
    SignatureMismatch,
    ArchiveRisk,
    Deepfake,
    SizeAnomaly,
    PartialAnalysis,
    AnalyzerTimeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct Indicator {
    pub label: String,
    pub category: IndicatorCategory,
    pub weight: f64,
    pub evidence: String,
}

impl Indicator {
    /// Weights are clamped non-negative so no indicator can ever lower a
    /// layer score; evidence is sanitized at creation.
    pub fn new(category: IndicatorCategory, label: &str, weight: f64, evidence: &str) -> Self {
        Self {
            label: label.to_string(),
            category,
            weight: weight.max(0.0),
            evidence: sanitize::clean_text(evidence),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub layer: Layer,
    pub score: f64,
    pub indicators: Vec<Indicator>,
}

impl AnalysisResult {
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            score: 0.0,
            indicators: Vec::new(),
        }
    }

    pub fn push(&mut self, indicator: Indicator) {
        self.score += indicator.weight;
        self.indicators.push(indicator);
    }

    pub fn has_category(&self, category: IndicatorCategory) -> bool {
        self.indicators.iter().any(|i| i.category == category)
    }

    /// Conservative stand-in for a layer that exceeded its time budget.
    pub fn timed_out(layer: Layer, weight: f64) -> Self {
        let mut result = Self::new(layer);
        result.push(Indicator::new(
            IndicatorCategory::AnalyzerTimeout,
            "analyzer timed out",
            weight,
            "layer analysis exceeded its time budget; scored conservatively",
        ));
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Flat, already-sanitized message reference for delivery collaborators;
/// nothing downstream needs to re-sanitize these fields.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub date: String,
}

impl MessageSummary {
    pub fn from_message(message: &NormalizedMessage) -> Self {
        Self {
            message_id: sanitize::clean_text(&message.message_id),
            subject: sanitize::clean_text(&message.subject),
            sender: sanitize::clean_text(&message.sender),
            recipient: sanitize::clean_text(&message.recipient),
            date: message.date.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerResults {
    pub spam: AnalysisResult,
    pub nlp: AnalysisResult,
    pub media: AnalysisResult,
}

impl LayerResults {
    pub fn get(&self, layer: Layer) -> &AnalysisResult {
        match layer {
            Layer::Spam => &self.spam,
            Layer::Nlp => &self.nlp,
            Layer::Media => &self.media,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &AnalysisResult> {
        [&self.spam, &self.nlp, &self.media].into_iter()
    }

    fn any_category(&self, category: IndicatorCategory) -> bool {
        self.iter().any(|r| r.has_category(category))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatReport {
    pub message: MessageSummary,
    pub overall_score: f64,
    pub risk_level: RiskLevel,
    pub layers: LayerResults,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Combines the three layer results into one verdict.
#[derive(Debug, Clone)]
pub struct Aggregator {
    scoring: ScoringConfig,
}

impl Aggregator {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }

    pub fn aggregate(
        &self,
        summary: MessageSummary,
        spam: AnalysisResult,
        nlp: AnalysisResult,
        media: AnalysisResult,
    ) -> ThreatReport {
        let layers = LayerResults { spam, nlp, media };
        let overall_score = self.scoring.spam_weight * layers.spam.score
            + self.scoring.nlp_weight * layers.nlp.score
            + self.scoring.media_weight * layers.media.score;
        let risk_level = self.risk_level_for(overall_score);
        let recommendations = recommendations_for(&layers);

        ThreatReport {
            message: summary,
            overall_score,
            risk_level,
            layers,
            recommendations,
            generated_at: Utc::now(),
        }
    }

    /// Closed-open threshold intervals; a score exactly on a boundary takes
    /// the higher tier.
    pub fn risk_level_for(&self, score: f64) -> RiskLevel {
        if score >= self.scoring.high_threshold {
            RiskLevel::Critical
        } else if score >= self.scoring.medium_threshold {
            RiskLevel::High
        } else if score >= self.scoring.low_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Deterministic: same fired categories, same recommendation list, in the
/// same order.
fn recommendations_for(layers: &LayerResults) -> Vec<String> {
    let mut out = Vec::new();

    if layers.any_category(IndicatorCategory::SignatureMismatch)
        || layers.any_category(IndicatorCategory::DangerousAttachment)
    {
        out.push("Dangerous attachment detected: do not open attachments".to_string());
    }
    if layers.any_category(IndicatorCategory::SocialEngineering) {
        out.push("Potential phishing: do not click links or provide credentials".to_string());
    }
    if layers.any_category(IndicatorCategory::AuthFailure) {
        out.push("Sender authentication failed: treat the sender identity as unverified".to_string());
    }
    if layers.any_category(IndicatorCategory::SuspiciousUrl) {
        out.push("Suspicious URLs detected: verify links before clicking".to_string());
    }
    if layers.any_category(IndicatorCategory::AuthorityImpersonation) {
        out.push("Authority impersonation suspected: verify sender identity out of band".to_string());
    }
    if layers.any_category(IndicatorCategory::Urgency) {
        out.push("Urgency tactics detected: take time to verify before acting".to_string());
    }
    if layers.any_category(IndicatorCategory::ArchiveRisk) {
        out.push("Archive could not be fully inspected: treat contents as untrusted".to_string());
    }
    if layers.any_category(IndicatorCategory::Deepfake) {
        out.push("Possible synthetic media: verify recordings through another channel".to_string());
    }
    if layers.any_category(IndicatorCategory::PartialAnalysis)
        || layers.any_category(IndicatorCategory::AnalyzerTimeout)
    {
        out.push("Message was only partially analyzed; review manually".to_string());
    }
    if out.is_empty() {
        out.push("Review message carefully before taking action".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;

    fn aggregator() -> Aggregator {
        Aggregator::new(ScoringConfig::default())
    }

    fn summary() -> MessageSummary {
        MessageSummary {
            message_id: "<t@example>".to_string(),
            subject: "subject".to_string(),
            sender: "a@example.com".to_string(),
            recipient: "b@example.com".to_string(),
            date: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn result_with(layer: Layer, category: IndicatorCategory, weight: f64) -> AnalysisResult {
        let mut r = AnalysisResult::new(layer);
        r.push(Indicator::new(category, "test", weight, "evidence"));
        r
    }

    #[test]
    fn indicator_weights_cannot_reduce_a_score() {
        let mut r = AnalysisResult::new(Layer::Spam);
        r.push(Indicator::new(IndicatorCategory::SpamContent, "a", 2.0, ""));
        r.push(Indicator::new(IndicatorCategory::SpamContent, "b", -5.0, ""));
        assert_eq!(r.score, 2.0);
    }

    #[test]
    fn risk_level_is_monotonic_and_boundaries_take_the_higher_tier() {
        let agg = aggregator();
        // defaults: low=5, medium=10, high=20
        assert_eq!(agg.risk_level_for(0.0), RiskLevel::Low);
        assert_eq!(agg.risk_level_for(4.999), RiskLevel::Low);
        assert_eq!(agg.risk_level_for(5.0), RiskLevel::Medium);
        assert_eq!(agg.risk_level_for(10.0), RiskLevel::High);
        assert_eq!(agg.risk_level_for(19.999), RiskLevel::High);
        assert_eq!(agg.risk_level_for(20.0), RiskLevel::Critical);

        let mut previous = RiskLevel::Low;
        for step in 0..300 {
            let level = agg.risk_level_for(step as f64 / 10.0);
            assert!(level >= previous);
            previous = level;
        }
    }

    #[test]
    fn overall_score_applies_configured_weights() {
        let mut scoring = ScoringConfig::default();
        scoring.spam_weight = 2.0;
        scoring.nlp_weight = 0.5;
        scoring.media_weight = 1.0;
        let agg = Aggregator::new(scoring);
        let report = agg.aggregate(
            summary(),
            result_with(Layer::Spam, IndicatorCategory::SpamContent, 3.0),
            result_with(Layer::Nlp, IndicatorCategory::Urgency, 4.0),
            result_with(Layer::Media, IndicatorCategory::SizeAnomaly, 1.0),
        );
        assert_eq!(report.overall_score, 2.0 * 3.0 + 0.5 * 4.0 + 1.0);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let agg = aggregator();
        let build = || {
            agg.aggregate(
                summary(),
                result_with(Layer::Spam, IndicatorCategory::AuthFailure, 2.5),
                result_with(Layer::Nlp, IndicatorCategory::SocialEngineering, 6.0),
                result_with(Layer::Media, IndicatorCategory::SignatureMismatch, 5.0),
            )
        };
        let first = build();
        let second = build();
        assert_eq!(first.overall_score.to_bits(), second.overall_score.to_bits());
        assert_eq!(first.risk_level, second.risk_level);
        assert_eq!(first.recommendations, second.recommendations);
    }

    #[test]
    fn recommendations_follow_fired_categories() {
        let agg = aggregator();
        let report = agg.aggregate(
            summary(),
            result_with(Layer::Spam, IndicatorCategory::SuspiciousUrl, 1.0),
            result_with(Layer::Nlp, IndicatorCategory::SocialEngineering, 2.0),
            AnalysisResult::new(Layer::Media),
        );
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("phishing")));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("verify links")));
    }

    #[test]
    fn clean_message_still_gets_a_recommendation() {
        let agg = aggregator();
        let report = agg.aggregate(
            summary(),
            AnalysisResult::new(Layer::Spam),
            AnalysisResult::new(Layer::Nlp),
            AnalysisResult::new(Layer::Media),
        );
        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(report.risk_level, RiskLevel::Low);
    }

    #[test]
    fn timed_out_layer_scores_conservatively() {
        let result = AnalysisResult::timed_out(Layer::Media, 5.0);
        assert_eq!(result.score, 5.0);
        assert!(result.has_category(IndicatorCategory::AnalyzerTimeout));
    }
}
