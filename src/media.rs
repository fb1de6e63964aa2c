//! Attachment and media authenticity scoring.
//!
//! Each attachment walks one path: extension check (advisory), then the
//! signature verdict computed at build time, then exactly one of archive
//! inspection, media heuristics, or skip-high-risk. A signature mismatch is
//! fail-closed: the attachment is scored at the fail-closed threshold and
//! never handed to any type-specific parser. Nested archive entries go
//! through the same checks as top-level attachments.

use crate::config::{Config, LimitsConfig, MediaConfig};
use crate::filetype::{self, FileKind, SignatureStatus};
use crate::message::{sanitize_filename, AttachmentRecord, TruncationFlags};
use crate::report::{AnalysisResult, Indicator, IndicatorCategory, Layer};
use anyhow::Result;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

const DANGEROUS_EXTENSION_WEIGHT: f64 = 5.0;
const SUSPICIOUS_EXTENSION_WEIGHT: f64 = 3.0;
const DOUBLE_EXTENSION_WEIGHT: f64 = 1.5;
const LARGE_ATTACHMENT_WEIGHT: f64 = 1.5;
const SMALL_MEDIA_WEIGHT: f64 = 1.0;
const SMALL_VIDEO_WEIGHT: f64 = 0.5;
const DEEPFAKE_HIGH_WEIGHT: f64 = 3.0;
const DEEPFAKE_POSSIBLE_WEIGHT: f64 = 1.0;
const SMALL_MEDIA_BYTES: u64 = 1024;
const SMALL_VIDEO_BYTES: usize = 100 * 1024;

/// Pluggable deepfake probability provider. Scanners receive the media
/// payload as a private scoped temp file that is removed on every exit path.
pub trait DeepfakeScanner: Send + Sync {
    /// Deepfake probability in `[0, 1]`.
    fn probability(&self, filename: &str, media_path: &Path) -> Result<f64>;
}

/// Filename-keyed simulator used for testing and dry runs.
pub struct SimulatorScanner;

impl DeepfakeScanner for SimulatorScanner {
    fn probability(&self, filename: &str, _media_path: &Path) -> Result<f64> {
        let lower = filename.to_ascii_lowercase();
        if lower.contains("deepfake") || lower.contains("synthetic") {
            log::info!("simulator flagged synthetic content: {}", filename);
            return Ok(0.85);
        }
        if lower.contains("suspicious") {
            return Ok(0.5);
        }
        Ok(0.0)
    }
}

pub struct DisabledScanner;

impl DeepfakeScanner for DisabledScanner {
    fn probability(&self, _filename: &str, _media_path: &Path) -> Result<f64> {
        Ok(0.0)
    }
}

pub fn scanner_for(provider: &str) -> Box<dyn DeepfakeScanner> {
    match provider {
        "simulator" => Box::new(SimulatorScanner),
        _ => Box::new(DisabledScanner),
    }
}

/// Indicators and running score for one attachment; the message-level score
/// is the maximum across attachments, never the sum.
struct AttachmentVerdict {
    score: f64,
    indicators: Vec<Indicator>,
}

impl AttachmentVerdict {
    fn new() -> Self {
        Self {
            score: 0.0,
            indicators: Vec::new(),
        }
    }

    fn push(&mut self, indicator: Indicator) {
        self.score += indicator.weight;
        self.indicators.push(indicator);
    }
}

pub struct MediaAuthenticityAnalyzer {
    config: MediaConfig,
    limits: LimitsConfig,
    attachment_budget: Duration,
    scanner: Box<dyn DeepfakeScanner>,
}

impl MediaAuthenticityAnalyzer {
    pub fn new(config: &Config) -> Self {
        let scanner: Box<dyn DeepfakeScanner> = if config.media.deepfake_enabled {
            scanner_for(&config.media.deepfake_provider)
        } else {
            Box::new(DisabledScanner)
        };
        Self {
            config: config.media.clone(),
            limits: config.limits.clone(),
            attachment_budget: Duration::from_millis(config.timeouts.per_attachment_ms),
            scanner,
        }
    }

    pub fn analyze(
        &self,
        attachments: &[AttachmentRecord],
        truncation: TruncationFlags,
    ) -> AnalysisResult {
        let mut result = AnalysisResult::new(Layer::Media);
        if !self.config.enabled {
            return result;
        }

        let mut max_score = 0.0f64;
        for attachment in attachments {
            let verdict = self.score_attachment(attachment);
            max_score = max_score.max(verdict.score);
            for indicator in verdict.indicators {
                result.indicators.push(indicator);
            }
        }

        // One dangerous attachment is enough to flag the message.
        result.score = max_score;

        // This layer consumes the attachment set, so it reports any cuts the
        // builder made to it: a dropped attachment could have been the
        // dangerous one.
        if truncation.attachments_dropped || truncation.attachment_bytes {
            result.push(Indicator::new(
                IndicatorCategory::PartialAnalysis,
                "attachments dropped before scanning",
                0.5,
                "count or byte ceilings removed attachments from the scanned set",
            ));
        }

        log::debug!(
            "media analysis complete: {} attachments, score={:.2}",
            attachments.len(),
            result.score
        );
        result
    }

    fn score_attachment(&self, attachment: &AttachmentRecord) -> AttachmentVerdict {
        let deadline = Instant::now() + self.attachment_budget;
        let mut verdict = AttachmentVerdict::new();
        let name = &attachment.sanitized_filename;

        if attachment.truncated {
            verdict.push(Indicator::new(
                IndicatorCategory::PartialAnalysis,
                "attachment truncated before scanning",
                0.5,
                name,
            ));
        }

        self.extension_checks(name, &mut verdict);
        self.size_checks(attachment, &mut verdict);

        match attachment.signature {
            SignatureStatus::Mismatched => {
                // Fail closed: scored at the threshold and disqualified from
                // any type-specific processing.
                verdict.push(Indicator::new(
                    IndicatorCategory::SignatureMismatch,
                    "declared type contradicts file signature",
                    self.config.fail_closed_score,
                    &format!("{} ({})", name, attachment.declared_mime),
                ));
            }
            SignatureStatus::Verified(kind) if verdict.score >= self.config.fail_closed_score => {
                // Already high-risk; do not hand it to a heavier parser.
                log::debug!("skipping {:?} inspection of high-risk attachment {}", kind, name);
            }
            // Only zip containers are unpacked; gzip has no zip structure to
            // parse and is covered by the extension and size checks.
            SignatureStatus::Verified(FileKind::Zip) => {
                let mut entries_seen = 0usize;
                self.inspect_archive(
                    name,
                    &attachment.payload,
                    0,
                    deadline,
                    &mut entries_seen,
                    &mut verdict,
                );
            }
            SignatureStatus::Verified(kind) if kind.is_media() => {
                self.media_heuristics(attachment, kind, deadline, &mut verdict);
            }
            SignatureStatus::Verified(_) | SignatureStatus::Unknown => {}
        }

        verdict
    }

    /// Advisory extension checks; never sufficient on their own and never a
    /// reason to skip signature verification.
    fn extension_checks(&self, name: &str, verdict: &mut AttachmentVerdict) {
        if filetype::has_dangerous_extension(name) {
            verdict.push(Indicator::new(
                IndicatorCategory::DangerousAttachment,
                "dangerous file type",
                DANGEROUS_EXTENSION_WEIGHT,
                name,
            ));
        }
        if filetype::has_suspicious_extension(name) {
            verdict.push(Indicator::new(
                IndicatorCategory::DangerousAttachment,
                "macro-enabled document",
                SUSPICIOUS_EXTENSION_WEIGHT,
                name,
            ));
        }
        if filetype::has_double_extension(name) {
            verdict.push(Indicator::new(
                IndicatorCategory::DangerousAttachment,
                "multiple extensions",
                DOUBLE_EXTENSION_WEIGHT,
                name,
            ));
        }
    }

    fn size_checks(&self, attachment: &AttachmentRecord, verdict: &mut AttachmentVerdict) {
        let name = &attachment.sanitized_filename;

        if attachment.byte_size > self.limits.max_attachment_bytes as u64 {
            verdict.push(Indicator::new(
                IndicatorCategory::SizeAnomaly,
                "unusually large attachment",
                LARGE_ATTACHMENT_WEIGHT,
                &format!("{} ({} bytes declared)", name, attachment.byte_size),
            ));
        }

        let lower = name.to_ascii_lowercase();
        let is_media_name = filetype::MEDIA_EXTENSIONS
            .iter()
            .any(|ext| lower.ends_with(&format!(".{}", ext)));
        if is_media_name && attachment.byte_size < SMALL_MEDIA_BYTES {
            verdict.push(Indicator::new(
                IndicatorCategory::SizeAnomaly,
                "suspiciously small media file",
                SMALL_MEDIA_WEIGHT,
                &format!("{} ({} bytes)", name, attachment.byte_size),
            ));
        }
    }

    /// Recursive zip inspection. Every nested entry is re-checked with the
    /// same extension and signature logic as a top-level attachment; hitting
    /// the depth, entry-count, or time ceiling scores the archive high-risk
    /// instead of continuing to unpack.
    fn inspect_archive(
        &self,
        name: &str,
        data: &[u8],
        depth: usize,
        deadline: Instant,
        entries_seen: &mut usize,
        verdict: &mut AttachmentVerdict,
    ) {
        if depth >= self.limits.max_archive_depth {
            verdict.push(Indicator::new(
                IndicatorCategory::ArchiveRisk,
                "archive nesting exceeds depth limit",
                self.config.fail_closed_score,
                &format!("{} at depth {}", name, depth),
            ));
            return;
        }

        let mut archive = match zip::ZipArchive::new(Cursor::new(data)) {
            Ok(archive) => archive,
            Err(e) => {
                verdict.push(Indicator::new(
                    IndicatorCategory::ArchiveRisk,
                    "unreadable archive",
                    self.config.fail_closed_score,
                    &format!("{}: {}", name, e),
                ));
                return;
            }
        };

        for index in 0..archive.len() {
            if Instant::now() >= deadline {
                verdict.push(Indicator::new(
                    IndicatorCategory::AnalyzerTimeout,
                    "archive inspection deadline exceeded",
                    self.config.fail_closed_score,
                    name,
                ));
                return;
            }
            *entries_seen += 1;
            if *entries_seen > self.limits.max_archive_entries {
                verdict.push(Indicator::new(
                    IndicatorCategory::ArchiveRisk,
                    "archive entry count exceeds limit",
                    self.config.fail_closed_score,
                    &format!("{} ({} entries)", name, entries_seen),
                ));
                return;
            }

            let (entry_name, entry_data) = match archive.by_index(index) {
                Ok(file) => {
                    let entry_name = sanitize_filename(file.name());
                    let mut entry_data = Vec::new();
                    let mut bounded = file.take(self.limits.max_attachment_bytes as u64);
                    if let Err(e) = bounded.read_to_end(&mut entry_data) {
                        verdict.push(Indicator::new(
                            IndicatorCategory::ArchiveRisk,
                            "unreadable archive entry",
                            self.config.fail_closed_score,
                            &format!("{}: {}", entry_name, e),
                        ));
                        continue;
                    }
                    (entry_name, entry_data)
                }
                Err(e) => {
                    verdict.push(Indicator::new(
                        IndicatorCategory::ArchiveRisk,
                        "unreadable archive entry",
                        self.config.fail_closed_score,
                        &format!("{}: {}", name, e),
                    ));
                    continue;
                }
            };

            self.extension_checks(&entry_name, verdict);

            match filetype::verify_signature("", &entry_name, &entry_data) {
                SignatureStatus::Mismatched => {
                    verdict.push(Indicator::new(
                        IndicatorCategory::SignatureMismatch,
                        "archived file signature mismatch",
                        self.config.fail_closed_score,
                        &entry_name,
                    ));
                }
                SignatureStatus::Verified(FileKind::Exe) => {
                    // Covered by the dangerous-extension check above when the
                    // name is honest; a dishonest name is Mismatched instead.
                }
                SignatureStatus::Verified(FileKind::Zip) => {
                    self.inspect_archive(
                        &entry_name,
                        &entry_data,
                        depth + 1,
                        deadline,
                        entries_seen,
                        verdict,
                    );
                }
                _ => {}
            }
        }
    }

    /// Heuristics for signature-verified media. The payload goes to the
    /// deepfake provider as a scoped private temp file, removed when the
    /// handle drops no matter how this function exits.
    fn media_heuristics(
        &self,
        attachment: &AttachmentRecord,
        kind: FileKind,
        deadline: Instant,
        verdict: &mut AttachmentVerdict,
    ) {
        let name = &attachment.sanitized_filename;

        if Instant::now() >= deadline {
            verdict.push(Indicator::new(
                IndicatorCategory::AnalyzerTimeout,
                "media inspection deadline exceeded",
                self.config.fail_closed_score,
                name,
            ));
            return;
        }

        if matches!(kind, FileKind::Mp4 | FileKind::Avi)
            && attachment.payload.len() < SMALL_VIDEO_BYTES
        {
            verdict.push(Indicator::new(
                IndicatorCategory::Deepfake,
                "suspicious video size",
                SMALL_VIDEO_WEIGHT,
                &format!("{} ({} bytes)", name, attachment.payload.len()),
            ));
        }

        if !self.config.deepfake_enabled {
            return;
        }

        let probability = match self.scan_payload(name, &attachment.payload) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("deepfake scan failed for {}: {}", name, e);
                return;
            }
        };
        if probability > 0.7 {
            verdict.push(Indicator::new(
                IndicatorCategory::Deepfake,
                "high deepfake probability",
                DEEPFAKE_HIGH_WEIGHT,
                &format!("{} ({:.2})", name, probability),
            ));
        } else if probability > 0.4 {
            verdict.push(Indicator::new(
                IndicatorCategory::Deepfake,
                "possible deepfake content",
                DEEPFAKE_POSSIBLE_WEIGHT,
                &format!("{} ({:.2})", name, probability),
            ));
        }
    }

    fn scan_payload(&self, name: &str, payload: &[u8]) -> Result<f64> {
        let mut scratch = tempfile::NamedTempFile::new()?;
        scratch.write_all(payload)?;
        scratch.flush()?;
        self.scanner.probability(name, scratch.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filetype::SignatureStatus;

    fn analyzer() -> MediaAuthenticityAnalyzer {
        MediaAuthenticityAnalyzer::new(&Config::default())
    }

    fn record(name: &str, mime: &str, payload: Vec<u8>) -> AttachmentRecord {
        let sanitized = sanitize_filename(name);
        let signature = filetype::verify_signature(mime, &sanitized, &payload);
        AttachmentRecord {
            raw_filename: name.to_string(),
            sanitized_filename: sanitized,
            declared_mime: mime.to_string(),
            byte_size: payload.len() as u64,
            payload,
            truncated: false,
            signature,
        }
    }

    fn mp4_bytes(len: usize) -> Vec<u8> {
        let mut data = b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00".to_vec();
        data.resize(len, 0u8);
        data
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::FileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn has_label(result: &AnalysisResult, label: &str) -> bool {
        result.indicators.iter().any(|i| i.label == label)
    }

    #[test]
    fn no_attachments_scores_zero() {
        let result = analyzer().analyze(&[], TruncationFlags::default());
        assert_eq!(result.score, 0.0);
        assert!(result.indicators.is_empty());
    }

    #[test]
    fn dangerous_extension_scores_high() {
        let result = analyzer().analyze(&[record("evil.exe", "application/octet-stream", b"MZ\x90\x00".to_vec())], TruncationFlags::default());
        assert!(has_label(&result, "dangerous file type"));
        assert!(result.score >= DANGEROUS_EXTENSION_WEIGHT);
    }

    #[test]
    fn mismatched_media_claim_fails_closed_and_skips_heuristics() {
        let attachment = record("clip.mp4", "video/mp4", b"definitely not a video".to_vec());
        assert_eq!(attachment.signature, SignatureStatus::Mismatched);
        let result = analyzer().analyze(&[attachment], TruncationFlags::default());
        assert!(has_label(&result, "declared type contradicts file signature"));
        assert!(result.score >= Config::default().media.fail_closed_score);
        assert!(!result.has_category(IndicatorCategory::Deepfake));
    }

    #[test]
    fn small_verified_video_gets_size_and_heuristic_indicators() {
        let result = analyzer().analyze(&[record("tiny.mp4", "video/mp4", mp4_bytes(512))], TruncationFlags::default());
        assert!(has_label(&result, "suspicious video size"));
        assert!(has_label(&result, "suspiciously small media file"));
    }

    #[test]
    fn simulator_flags_synthetic_filenames() {
        let result = analyzer().analyze(&[record(
            "deepfake_greeting.mp4",
            "video/mp4",
            mp4_bytes(200 * 1024),
        )], TruncationFlags::default());
        assert!(has_label(&result, "high deepfake probability"));
    }

    #[test]
    fn disabled_provider_never_flags_deepfakes() {
        let mut config = Config::default();
        config.media.deepfake_enabled = false;
        let analyzer = MediaAuthenticityAnalyzer::new(&config);
        let result = analyzer.analyze(&[record(
            "deepfake_greeting.mp4",
            "video/mp4",
            mp4_bytes(200 * 1024),
        )], TruncationFlags::default());
        assert!(!has_label(&result, "high deepfake probability"));
    }

    #[test]
    fn archived_executable_is_flagged_like_a_top_level_one() {
        let payload = zip_bytes(&[("invoice.exe", b"MZ\x90\x00\x03".as_slice())]);
        let result = analyzer().analyze(&[record("bundle.zip", "application/zip", payload)], TruncationFlags::default());
        assert!(has_label(&result, "dangerous file type"));
        assert!(result.score >= DANGEROUS_EXTENSION_WEIGHT);
    }

    #[test]
    fn archived_disguised_executable_is_a_signature_mismatch() {
        let payload = zip_bytes(&[("photo.jpg", b"MZ\x90\x00\x03".as_slice())]);
        let result = analyzer().analyze(&[record("bundle.zip", "application/zip", payload)], TruncationFlags::default());
        assert!(has_label(&result, "archived file signature mismatch"));
    }

    #[test]
    fn nesting_beyond_depth_limit_is_high_risk_and_halts() {
        let mut config = Config::default();
        config.limits.max_archive_depth = 1;
        let analyzer = MediaAuthenticityAnalyzer::new(&config);

        let inner = zip_bytes(&[("note.txt", b"hello there friend".as_slice())]);
        let outer = zip_bytes(&[("inner.zip", inner.as_slice())]);
        let result = analyzer.analyze(&[record("outer.zip", "application/zip", outer)], TruncationFlags::default());
        assert!(has_label(&result, "archive nesting exceeds depth limit"));
        assert!(result.score >= config.media.fail_closed_score);
    }

    #[test]
    fn entry_count_ceiling_stops_unpacking() {
        let mut config = Config::default();
        config.limits.max_archive_entries = 2;
        let analyzer = MediaAuthenticityAnalyzer::new(&config);

        let payload = zip_bytes(&[
            ("a.txt", b"aaa".as_slice()),
            ("b.txt", b"bbb".as_slice()),
            ("c.txt", b"ccc".as_slice()),
        ]);
        let result = analyzer.analyze(&[record("many.zip", "application/zip", payload)], TruncationFlags::default());
        assert!(has_label(&result, "archive entry count exceeds limit"));
    }

    #[test]
    fn exhausted_deadline_scores_conservatively() {
        let mut config = Config::default();
        config.timeouts.per_attachment_ms = 0;
        let analyzer = MediaAuthenticityAnalyzer::new(&config);

        let payload = zip_bytes(&[("note.txt", b"hello".as_slice())]);
        let result = analyzer.analyze(&[record("slow.zip", "application/zip", payload)], TruncationFlags::default());
        assert!(has_label(&result, "archive inspection deadline exceeded"));
        assert!(result.score >= config.media.fail_closed_score);
    }

    #[test]
    fn benign_gzip_is_not_treated_as_an_unreadable_archive() {
        let gz = vec![0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];
        let result = analyzer().analyze(
            &[record("logs.gz", "application/gzip", gz)],
            TruncationFlags::default(),
        );
        assert!(!has_label(&result, "unreadable archive"));
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn dropped_attachments_leave_a_partial_analysis_marker() {
        let mut flags = TruncationFlags::default();
        flags.attachments_dropped = true;
        let result = analyzer().analyze(&[], flags);
        assert!(has_label(&result, "attachments dropped before scanning"));
        assert!(result.has_category(IndicatorCategory::PartialAnalysis));
        assert!(result.score > 0.0);
    }

    #[test]
    fn message_score_is_the_maximum_across_attachments() {
        let benign = record("notes.txt", "text/plain", b"plain words here".to_vec());
        let exe_one = record("a.exe", "application/octet-stream", b"MZ\x90\x00".to_vec());
        let exe_two = record("b.exe", "application/octet-stream", b"MZ\x90\x00".to_vec());
        let result = analyzer().analyze(&[benign, exe_one, exe_two], TruncationFlags::default());
        assert_eq!(result.score, DANGEROUS_EXTENSION_WEIGHT);
    }

    #[test]
    fn truncated_attachment_is_visible_in_indicators() {
        let mut attachment = record("big.bin", "application/octet-stream", vec![0u8; 64]);
        attachment.truncated = true;
        let result = analyzer().analyze(&[attachment], TruncationFlags::default());
        assert!(has_label(&result, "attachment truncated before scanning"));
    }

    #[test]
    fn disabled_media_layer_returns_empty_result() {
        let mut config = Config::default();
        config.media.enabled = false;
        let analyzer = MediaAuthenticityAnalyzer::new(&config);
        let result = analyzer.analyze(&[record("evil.exe", "x", b"MZ\x90\x00".to_vec())], TruncationFlags::default());
        assert_eq!(result.score, 0.0);
    }
}
