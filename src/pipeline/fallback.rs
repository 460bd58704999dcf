//! Direct text extraction used when no PDF could be produced.
//!
//! HTML goes through `scraper`, XML through `roxmltree`. RTF control words
//! are interpreted just far enough to recover the visible text, and anything
//! else is decoded as lossy UTF-8. The goal is a non-empty answer for
//! textual input, not layout.

use super::classify::TextChecks;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Node};

/// Extract readable text from `data`, choosing the strategy from `checks`.
pub fn extract_text(data: &[u8], checks: &TextChecks) -> String {
    let text = if checks.is_html(data) {
        html_to_text(&String::from_utf8_lossy(data))
    } else if checks.is_xml(data) {
        xml_to_text(&String::from_utf8_lossy(data))
    } else if checks.is_rtf(data) {
        rtf_to_text(&String::from_utf8_lossy(data))
    } else {
        String::from_utf8_lossy(data).into_owned()
    };
    text.trim().to_string()
}

// ── HTML ─────────────────────────────────────────────────────────────────

/// Elements whose text is never shown.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that start a new line.
const BLOCK_ELEMENTS: &[&str] = &[
    "br", "p", "div", "li", "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6", "table",
    "ul", "ol", "dl", "dt", "dd", "section", "article", "header", "footer", "title",
    "blockquote", "pre",
];

/// Visible text of an HTML document; block-level elements become line breaks.
///
/// The input goes through a full HTML5 parser, so truncated documents and a
/// bare `<` in running text are handled the way a browser would.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 2);
    for node in document.tree.root().descendants() {
        match node.value() {
            Node::Text(text) => {
                let hidden = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
                });
                if !hidden {
                    out.push_str(text);
                }
            }
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => out.push('\n'),
            _ => {}
        }
    }
    tidy_lines(&out)
}

// ── XML ──────────────────────────────────────────────────────────────────

/// Text nodes of a well-formed document, one per line. Malformed input is
/// read as HTML instead.
pub fn xml_to_text(xml: &str) -> String {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    match roxmltree::Document::parse_with_options(xml.trim_start_matches('\u{feff}'), options) {
        Ok(doc) => {
            let lines: Vec<&str> = doc
                .descendants()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect();
            lines.join("\n")
        }
        Err(_) => html_to_text(xml),
    }
}

// ── RTF ──────────────────────────────────────────────────────────────────

/// Destinations whose content is never visible text.
const SKIPPED_DESTINATIONS: &[&str] = &[
    "fonttbl",
    "colortbl",
    "stylesheet",
    "info",
    "pict",
    "object",
    "header",
    "headerl",
    "headerr",
    "headerf",
    "footer",
    "footerl",
    "footerr",
    "footerf",
    "footnote",
    "themedata",
    "datastore",
    "latentstyles",
    "xmlnstbl",
    "listtable",
    "listoverridetable",
    "rsidtbl",
    "generator",
    "filetbl",
    "revtbl",
    "fldinst",
    "mmathPr",
];

#[derive(Debug, Clone, Copy)]
struct RtfGroup {
    skip: bool,
    /// Fallback characters following each `\uN`.
    uc: usize,
}

fn hex_value(c: char) -> Option<u8> {
    c.to_digit(16).map(|d| d as u8)
}

/// Windows-1252 code point for a byte from a `\'hh` escape.
fn cp1252(byte: u8) -> char {
    const HIGH: [char; 32] = [
        '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8d}', 'Ž',
        '\u{8f}', '\u{90}', '‘', '’', '“', '”', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9d}',
        'ž', 'Ÿ',
    ];
    match byte {
        0x80..=0x9F => HIGH[(byte - 0x80) as usize],
        _ => byte as char,
    }
}

/// Convert RTF markup to plain text.
pub fn rtf_to_text(rtf: &str) -> String {
    let mut out = String::with_capacity(rtf.len() / 2);
    let mut stack: Vec<RtfGroup> = Vec::new();
    let mut group = RtfGroup { skip: false, uc: 1 };
    let mut pending_fallback = 0usize;
    let mut chars = rtf.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                stack.push(group);
                pending_fallback = 0;
            }
            '}' => {
                group = stack.pop().unwrap_or(RtfGroup { skip: false, uc: 1 });
                pending_fallback = 0;
            }
            '\\' => {
                let Some(&next) = chars.peek() else { break };
                match next {
                    '\\' | '{' | '}' => {
                        chars.next();
                        emit(&mut out, &group, &mut pending_fallback, next);
                    }
                    '\'' => {
                        chars.next();
                        let hi = chars.next().and_then(hex_value);
                        let lo = chars.next().and_then(hex_value);
                        if let (Some(hi), Some(lo)) = (hi, lo) {
                            emit(&mut out, &group, &mut pending_fallback, cp1252(hi << 4 | lo));
                        }
                    }
                    '*' => {
                        chars.next();
                        group.skip = true;
                    }
                    '~' => {
                        chars.next();
                        emit(&mut out, &group, &mut pending_fallback, ' ');
                    }
                    '_' => {
                        chars.next();
                        emit(&mut out, &group, &mut pending_fallback, '-');
                    }
                    '\n' | '\r' => {
                        chars.next();
                        if !group.skip {
                            out.push('\n');
                        }
                    }
                    c if c.is_ascii_alphabetic() => {
                        let (word, param) = read_control_word(&mut chars);
                        apply_control_word(&word, param, &mut group, &mut out, &mut pending_fallback);
                    }
                    _ => {
                        // Other control symbols (\- optional hyphen, \| etc.) carry no text.
                        chars.next();
                    }
                }
            }
            '\r' | '\n' => {}
            c => emit(&mut out, &group, &mut pending_fallback, c),
        }
    }

    tidy_lines(&out)
}

fn emit(out: &mut String, group: &RtfGroup, pending_fallback: &mut usize, c: char) {
    if *pending_fallback > 0 {
        *pending_fallback -= 1;
        return;
    }
    if !group.skip {
        out.push(c);
    }
}

fn read_control_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> (String, Option<i32>) {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphabetic() {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }

    let mut digits = String::new();
    if chars.peek() == Some(&'-') {
        digits.push('-');
        chars.next();
    }
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            chars.next();
        } else {
            break;
        }
    }
    // A single space delimits the control word and is not text.
    if chars.peek() == Some(&' ') {
        chars.next();
    }
    (word, digits.parse::<i32>().ok())
}

fn apply_control_word(
    word: &str,
    param: Option<i32>,
    group: &mut RtfGroup,
    out: &mut String,
    pending_fallback: &mut usize,
) {
    if SKIPPED_DESTINATIONS.contains(&word) {
        group.skip = true;
        return;
    }
    if group.skip {
        return;
    }
    let text = match word {
        "par" | "line" | "sect" | "page" | "row" => "\n",
        "tab" | "cell" => "\t",
        "emdash" => "—",
        "endash" => "–",
        "bullet" => "•",
        "lquote" => "‘",
        "rquote" => "’",
        "ldblquote" => "“",
        "rdblquote" => "”",
        "uc" => {
            group.uc = param.unwrap_or(1).max(0) as usize;
            return;
        }
        "u" => {
            if let Some(code) = param {
                let code = if code < 0 { code + 65536 } else { code };
                if let Some(c) = char::from_u32(code as u32) {
                    out.push(c);
                }
                *pending_fallback = group.uc;
            }
            return;
        }
        _ => return,
    };
    *pending_fallback = 0;
    out.push_str(text);
}

// ── Shared ───────────────────────────────────────────────────────────────

static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Collapse horizontal whitespace, trim each line, keep at most one blank line.
fn tidy_lines(input: &str) -> String {
    let lines: Vec<String> = input
        .replace("\r\n", "\n")
        .lines()
        .map(|line| RE_SPACES.replace_all(line.trim(), " ").into_owned())
        .collect();
    RE_BLANK_RUNS
        .replace_all(lines.join("\n").trim(), "\n\n")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_tags_scripts_and_entities() {
        let html = "<html><head><title>T</title><style>p{}</style>\
                    <script>var x = '<p>';</script></head>\
                    <body><p>Fish &amp; chips</p><div>caf&eacute;</div></body></html>";
        let text = html_to_text(html);
        assert_eq!(text, "T\nFish & chips\ncafé");
    }

    #[test]
    fn truncated_html_still_yields_text() {
        let html = "<html><body><h1>Quarterly report</h1><p>Revenue grew <b>12%</b> in Q3<p class=\"no";
        let text = html_to_text(html);
        assert!(text.contains("Quarterly report"));
        assert!(text.contains("Revenue grew 12% in Q3"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn bare_less_than_in_text_is_kept() {
        let html = "<html><body><p>if x < 5 then y is small</p><p>second paragraph</p></body></html>";
        assert_eq!(html_to_text(html), "if x < 5 then y is small\nsecond paragraph");

        let truncated = "<html><body><h1>Prices</h1><p>a < b and the rest of the sentence";
        assert_eq!(html_to_text(truncated), "Prices\na < b and the rest of the sentence");
    }

    #[test]
    fn xml_text_nodes() {
        let xml = "<?xml version=\"1.0\"?><invoice><to>ACME</to><total>42.00</total></invoice>";
        assert_eq!(xml_to_text(xml), "ACME\n42.00");
    }

    #[test]
    fn malformed_xml_falls_back_to_tag_strip() {
        assert_eq!(xml_to_text("<a><b>loose</a>"), "loose");
    }

    #[test]
    fn rtf_basic_text_and_paragraphs() {
        let rtf = r"{\rtf1\ansi\deff0{\fonttbl{\f0 Times New Roman;}}{\colortbl;\red0\green0\blue0;}
\f0\fs24 Hello \b world\b0 !\par Second line\tab tabbed\par}";
        assert_eq!(rtf_to_text(rtf), "Hello world!\nSecond line tabbed");
    }

    #[test]
    fn rtf_escapes_and_unicode() {
        let rtf = r"{\rtf1\ansi caf\'e9 \u8364? costs\~5 \{braces\}}";
        assert_eq!(rtf_to_text(rtf), "café € costs 5 {braces}");
    }

    #[test]
    fn rtf_ignorable_destinations_are_skipped() {
        let rtf = r"{\rtf1{\*\generator Writer;}{\info{\author Bob}}Visible}";
        assert_eq!(rtf_to_text(rtf), "Visible");
    }

    #[test]
    fn extract_text_dispatches_on_checks() {
        let checks = TextChecks::new(0.95);
        assert_eq!(extract_text(b"  plain words \n", &checks), "plain words");

        let checks = TextChecks::new(0.95);
        assert_eq!(extract_text(b"<html><p>Hi</p></html>", &checks), "Hi");

        let checks = TextChecks::new(0.95);
        assert_eq!(extract_text(br"{\rtf1 Hi\par}", &checks), "Hi");
    }
}
