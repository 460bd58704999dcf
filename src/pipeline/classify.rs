//! Content classification from raw bytes.
//!
//! ## Order of checks
//!
//! 1. Binary signatures via `infer` (PDF, images, office containers, RTF).
//!    infer's own *text* matchers are ignored here so HTML and XML go
//!    through the content checks below like any other text.
//! 2. Well-formed XML.
//! 3. An HTML root tag in the first 2 KiB.
//! 4. An RTF header in the first 32 bytes.
//! 5. Printable-character ratio over a 4 KiB sample.
//!
//! The text checks are memoised in [`TextChecks`] so the router's fallback
//! decision sees exactly the answers the classifier saw.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const HTML_SCAN_BYTES: usize = 2048;
const RTF_SCAN_BYTES: usize = 32;
const TEXT_SAMPLE_BYTES: usize = 4096;

/// What a byte stream was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Pdf,
    OfficeDoc,
    Image,
    Xml,
    Html,
    Rtf,
    PlainText,
    Unknown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Pdf => "pdf",
            ContentKind::OfficeDoc => "office_doc",
            ContentKind::Image => "image",
            ContentKind::Xml => "xml",
            ContentKind::Html => "html",
            ContentKind::Rtf => "rtf",
            ContentKind::PlainText => "plain_text",
            ContentKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ContentKind,
    /// MIME type from the binary signature, if one matched.
    pub mime: Option<String>,
    /// Canonical extension from the binary signature, if one matched.
    pub extension: Option<String>,
}

/// Lazily evaluated, memoised text heuristics for one byte stream.
#[derive(Debug)]
pub struct TextChecks {
    threshold: f32,
    xml: OnceCell<bool>,
    html: OnceCell<bool>,
    rtf: OnceCell<bool>,
    plain: OnceCell<bool>,
}

impl TextChecks {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            xml: OnceCell::new(),
            html: OnceCell::new(),
            rtf: OnceCell::new(),
            plain: OnceCell::new(),
        }
    }

    pub fn is_xml(&self, data: &[u8]) -> bool {
        *self.xml.get_or_init(|| looks_like_xml(data))
    }

    pub fn is_html(&self, data: &[u8]) -> bool {
        *self.html.get_or_init(|| looks_like_html(data))
    }

    pub fn is_rtf(&self, data: &[u8]) -> bool {
        *self.rtf.get_or_init(|| looks_like_rtf(data))
    }

    pub fn is_plain_text(&self, data: &[u8]) -> bool {
        *self
            .plain
            .get_or_init(|| looks_like_plain_text(data, self.threshold))
    }

    /// Plain text, HTML, XML or RTF.
    pub fn is_text_like(&self, data: &[u8]) -> bool {
        self.is_plain_text(data) || self.is_html(data) || self.is_xml(data) || self.is_rtf(data)
    }
}

/// Classify `data`. Never fails; unrecognised input is [`ContentKind::Unknown`].
pub fn classify(data: &[u8], checks: &TextChecks) -> Classification {
    if let Some(found) = infer::get(data) {
        if found.matcher_type() != infer::MatcherType::Text {
            let mime = found.mime_type();
            let kind = match (mime, found.matcher_type()) {
                ("application/pdf", _) => ContentKind::Pdf,
                ("application/rtf" | "text/rtf", _) => ContentKind::Rtf,
                (_, infer::MatcherType::Image) => ContentKind::Image,
                (_, infer::MatcherType::Doc) => ContentKind::OfficeDoc,
                _ => ContentKind::Unknown,
            };
            return Classification {
                kind,
                mime: Some(mime.to_string()),
                extension: Some(found.extension().to_string()),
            };
        }
    }

    let kind = if checks.is_xml(data) && !checks.is_html(data) {
        ContentKind::Xml
    } else if checks.is_html(data) {
        ContentKind::Html
    } else if checks.is_rtf(data) {
        ContentKind::Rtf
    } else if checks.is_plain_text(data) {
        ContentKind::PlainText
    } else {
        ContentKind::Unknown
    };

    Classification {
        kind,
        mime: None,
        extension: None,
    }
}

fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data)
}

fn looks_like_xml(data: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(strip_bom(data)) else {
        return false;
    };
    if !text.trim_start().starts_with('<') {
        return false;
    }
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    roxmltree::Document::parse_with_options(text, options).is_ok()
}

fn looks_like_html(data: &[u8]) -> bool {
    let head = &data[..data.len().min(HTML_SCAN_BYTES)];
    let lower = String::from_utf8_lossy(head).to_ascii_lowercase();
    lower.contains("<html") || lower.contains("<!doctype html")
}

fn looks_like_rtf(data: &[u8]) -> bool {
    let head = &data[..data.len().min(RTF_SCAN_BYTES)];
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    head[start..].starts_with(b"{\\rtf")
}

/// UTF-8 sample whose printable-character ratio meets `threshold`.
fn looks_like_plain_text(data: &[u8], threshold: f32) -> bool {
    let data = strip_bom(data);
    let sample = &data[..data.len().min(TEXT_SAMPLE_BYTES)];
    let text = match std::str::from_utf8(sample) {
        Ok(text) => text,
        // A multi-byte character cut by the sample boundary is fine.
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&sample[..e.valid_up_to()]) {
            Ok(text) => text,
            Err(_) => return false,
        },
        Err(_) => return false,
    };

    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r' | '\x0b' | '\x0c'))
        .count();
    printable as f32 / total as f32 >= threshold
}

/// Produce a safe file name with an extension.
///
/// Directory components are dropped, an existing extension is kept, and a
/// missing one is derived from the signature or the text checks.
pub fn normalize_file_name(
    name: Option<&str>,
    data: &[u8],
    classification: &Classification,
    checks: &TextChecks,
) -> String {
    let base: String = name
        .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n))
        .unwrap_or("")
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    let base = base.trim();
    let base = if base.is_empty() || base == "." || base == ".." {
        "document"
    } else {
        base
    };

    let has_extension = Path::new(base)
        .extension()
        .map(|e| !e.is_empty())
        .unwrap_or(false);
    if has_extension {
        return base.to_string();
    }

    let extension = match &classification.extension {
        Some(ext) => ext.as_str(),
        None if checks.is_html(data) => "html",
        None if checks.is_xml(data) => "xml",
        None if checks.is_rtf(data) => "rtf",
        None => "txt",
    };
    format!("{base}.{extension}")
}
