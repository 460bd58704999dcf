//! Result aggregation: merge OCR pages, clean recognised text, and shape the
//! final metadata.
//!
//! ## Why clean only OCR output?
//!
//! Text that came from the input itself (plain text, an embedded PDF text
//! layer, fallback extraction) is returned as extracted. Recognised text is
//! the one source with engine artefacts: form feeds between pages, CRLF from
//! some builds, stray zero-width characters and ragged trailing whitespace.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so the per-line rules see clean input,
//! and blank-line collapsing runs last so it also catches lines emptied by
//! the earlier passes.

use super::context::ProcessContext;
use super::ocr::OcrOutcome;
use crate::output::ProcessOutput;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Separator between recognised pages.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Apply all cleanup rules to one page of recognised text.
///
/// 1. Normalise line endings (CRLF / CR → LF) and form feeds
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to one
/// 5. Trim leading and trailing blank lines
pub fn clean_ocr_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\x0c', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Merging ──────────────────────────────────────────────────────────────────

/// Join cleaned page texts in page order, skipping pages with no text.
pub fn merge_pages(outcome: &OcrOutcome) -> String {
    outcome
        .pages
        .iter()
        .map(|p| clean_ocr_text(&p.text))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

/// Fold a successful OCR run into the request context.
pub fn apply_ocr(ctx: &mut ProcessContext, outcome: &OcrOutcome) {
    ctx.output_text = merge_pages(outcome);
    ctx.metadata.confidence = Some(outcome.confidence);
    if !outcome.pages.is_empty() {
        ctx.metadata.pages = outcome.pages.len();
    }
}

/// Produce the final result, stamping elapsed time and any failure message.
pub fn finalize(ctx: ProcessContext, elapsed: Duration, log_message: Option<String>) -> ProcessOutput {
    let mut metadata = ctx.metadata;
    metadata.elapsed_time = Some(round_millis(elapsed));
    if log_message.is_some() {
        metadata.log_message = log_message;
    }
    if metadata.content_type.is_empty() {
        metadata.content_type = "application/octet-stream".to_string();
    }
    ProcessOutput {
        text: ctx.output_text,
        metadata,
    }
}

fn round_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

// ── Tests ────────────────────────────────────────────────────────────────────
