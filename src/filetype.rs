//! File-type identification from magic bytes, and the extension tables the
//! attachment analyzer consults. The extension is never trusted on its own:
//! [`verify_signature`] runs once during normalization and its verdict gates
//! every later type-specific branch.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Pdf,
    Zip,
    Gzip,
    Jpeg,
    Png,
    Gif,
    Exe,
    OleDoc,
    Mp4,
    Avi,
    Webp,
    Mp3,
    Wav,
}

impl FileKind {
    pub fn is_media(self) -> bool {
        matches!(
            self,
            FileKind::Mp4 | FileKind::Avi | FileKind::Mp3 | FileKind::Wav | FileKind::Webp
        )
    }

    /// Extensions a file of this kind may legitimately carry. Office OOXML
    /// containers are zip files, so zip accepts those too.
    fn expected_extensions(self) -> &'static [&'static str] {
        match self {
            FileKind::Pdf => &["pdf"],
            FileKind::Zip => &["zip", "docx", "xlsx", "pptx", "jar", "odt", "ods"],
            FileKind::Gzip => &["gz", "tgz"],
            FileKind::Jpeg => &["jpg", "jpeg"],
            FileKind::Png => &["png"],
            FileKind::Gif => &["gif"],
            FileKind::Exe => &["exe", "dll", "com", "scr"],
            FileKind::OleDoc => &["doc", "xls", "ppt", "msi"],
            FileKind::Mp4 => &["mp4", "m4a", "m4v", "mov"],
            FileKind::Avi => &["avi"],
            FileKind::Webp => &["webp"],
            FileKind::Mp3 => &["mp3"],
            FileKind::Wav => &["wav"],
        }
    }
}

/// Outcome of matching an attachment's declared type against its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignatureStatus {
    /// Magic bytes identified the file and agree with the declared type.
    Verified(FileKind),
    /// No known signature and the declared type makes no claim we must verify.
    Unknown,
    /// Declared type and detected signature disagree, or a media/archive
    /// claim could not be backed by any matching signature. Fail closed.
    Mismatched,
}

/// Identify a file from its leading bytes. Returns `None` when no known
/// signature matches.
pub fn detect_kind(data: &[u8]) -> Option<FileKind> {
    if data.len() < 4 {
        return None;
    }
    if data.starts_with(b"%PDF") {
        return Some(FileKind::Pdf);
    }
    if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
        return Some(FileKind::Zip);
    }
    if data.starts_with(&[0x1f, 0x8b]) {
        return Some(FileKind::Gzip);
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(FileKind::Jpeg);
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some(FileKind::Png);
    }
    if data.starts_with(b"GIF8") {
        return Some(FileKind::Gif);
    }
    if data.starts_with(b"MZ") {
        return Some(FileKind::Exe);
    }
    if data.starts_with(&[0xd0, 0xcf, 0x11, 0xe0]) {
        return Some(FileKind::OleDoc);
    }
    // ISO base media: size (4 bytes) then "ftyp" brand.
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return Some(FileKind::Mp4);
    }
    if data.starts_with(b"RIFF") && data.len() >= 12 {
        return match &data[8..12] {
            b"AVI " => Some(FileKind::Avi),
            b"WEBP" => Some(FileKind::Webp),
            b"WAVE" => Some(FileKind::Wav),
            _ => None,
        };
    }
    if data.starts_with(b"ID3") || data.starts_with(&[0xff, 0xfb]) {
        return Some(FileKind::Mp3);
    }
    None
}

fn extension_of(filename: &str) -> &str {
    filename.rsplit('.').next().unwrap_or("")
}

/// True when the declared MIME type or the (sanitized) extension claims a
/// media or archive format, the claims we refuse to take on faith.
pub fn claims_verifiable_type(declared_mime: &str, sanitized_filename: &str) -> bool {
    let mime = declared_mime.to_ascii_lowercase();
    if mime.starts_with("video/") || mime.starts_with("audio/") || mime.starts_with("image/") {
        return true;
    }
    if mime.contains("zip") || mime.contains("compressed") || mime.contains("x-tar") {
        return true;
    }
    let ext = extension_of(&sanitized_filename.to_ascii_lowercase()).to_string();
    MEDIA_EXTENSIONS.contains(&ext.as_str()) || ARCHIVE_EXTENSIONS.contains(&ext.as_str())
}

/// Match declared type against detected signature. Runs eagerly at message
/// build time, before any extension-based processing decision.
pub fn verify_signature(declared_mime: &str, sanitized_filename: &str, data: &[u8]) -> SignatureStatus {
    let detected = detect_kind(data);
    let ext = extension_of(&sanitized_filename.to_ascii_lowercase()).to_string();

    match detected {
        Some(kind) => {
            if kind.expected_extensions().contains(&ext.as_str()) {
                SignatureStatus::Verified(kind)
            } else if kind == FileKind::Exe {
                // An executable under any other name is always a mismatch.
                SignatureStatus::Mismatched
            } else if claims_verifiable_type(declared_mime, sanitized_filename) {
                SignatureStatus::Mismatched
            } else {
                // Signature known, extension vague (e.g. ".dat"); tolerated.
                SignatureStatus::Verified(kind)
            }
        }
        None => {
            if claims_verifiable_type(declared_mime, sanitized_filename) {
                SignatureStatus::Mismatched
            } else {
                SignatureStatus::Unknown
            }
        }
    }
}

/// Extensions that execute or script on a double-click. Advisory signal;
/// never sufficient on its own to skip signature verification.
pub const DANGEROUS_EXTENSIONS: [&str; 20] = [
    "exe", "bat", "cmd", "com", "pif", "scr", "vbs", "js", "jar", "msi", "dll", "hta", "wsf",
    "ps1", "sh", "app", "lnk", "iso", "img", "vhd",
];

/// Macro-enabled Office formats, commonly used for disguise.
pub const SUSPICIOUS_EXTENSIONS: [&str; 4] = ["docm", "xlsm", "pptm", "dotm"];

pub const MEDIA_EXTENSIONS: [&str; 12] = [
    "mp4", "avi", "mov", "wmv", "flv", "mkv", "mp3", "wav", "aac", "flac", "ogg", "m4a",
];

pub const ARCHIVE_EXTENSIONS: [&str; 5] = ["zip", "gz", "tgz", "rar", "7z"];

pub fn has_dangerous_extension(sanitized_filename: &str) -> bool {
    let ext = extension_of(&sanitized_filename.to_ascii_lowercase()).to_string();
    DANGEROUS_EXTENSIONS.contains(&ext.as_str())
}

pub fn has_suspicious_extension(sanitized_filename: &str) -> bool {
    let ext = extension_of(&sanitized_filename.to_ascii_lowercase()).to_string();
    SUSPICIOUS_EXTENSIONS.contains(&ext.as_str())
}

/// Double extensions like `invoice.pdf.exe` where the inner part mimics a
/// benign document type.
pub fn has_double_extension(sanitized_filename: &str) -> bool {
    let lower = sanitized_filename.to_ascii_lowercase();
    let parts: Vec<&str> = lower.split('.').filter(|p| !p.is_empty()).collect();
    parts.len() > 2
}
