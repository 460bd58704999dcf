//! Lightweight XML → PDF conversion.
//!
//! Renders the document's text nodes as a plain monospaced listing with
//! `lopdf`, which is enough for the downstream text-layer extraction or OCR
//! and avoids a round trip through the office converter for the common case.
//!
//! Only content representable in the standard Type1 Courier encoding is
//! handled here. Anything else returns `None` and the router retries through
//! the office converter, which has real font support.

use super::fallback;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tracing::debug;

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 50;
const FONT_SIZE: i64 = 10;
const LEADING: i64 = 12;
const LINE_CHARS: usize = 95;
const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2 * MARGIN) / LEADING) as usize;

/// Convert XML text to a simple PDF, or `None` if it cannot be represented.
pub fn xml_to_pdf(xml: &str) -> Option<Vec<u8>> {
    let text = fallback::xml_to_text(xml);
    if text.trim().is_empty() {
        debug!("XML has no text content; skipping lightweight conversion");
        return None;
    }
    if !text.chars().all(|c| c == '\n' || (' '..='~').contains(&c)) {
        debug!("XML text needs non-ASCII glyphs; deferring to office converter");
        return None;
    }

    let pages: Vec<Vec<String>> = wrap_lines(&text)
        .chunks(LINES_PER_PAGE)
        .map(<[String]>::to_vec)
        .collect();
    match text_pdf(&pages) {
        Ok(pdf) => Some(pdf),
        Err(e) => {
            debug!("Lightweight XML conversion failed: {e}");
            None
        }
    }
}

fn wrap_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            out.push(String::new());
            continue;
        }
        for chunk in chars.chunks(LINE_CHARS) {
            out.push(chunk.iter().collect());
        }
    }
    out
}

/// Build a PDF with one page per entry and one text line per string.
pub fn text_pdf(pages: &[Vec<String>]) -> Result<Vec<u8>, lopdf::Error> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for page_lines in pages {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), Object::Integer(FONT_SIZE)]),
            Operation::new("TL", vec![Object::Integer(LEADING)]),
            Operation::new(
                "Td",
                vec![
                    Object::Integer(MARGIN),
                    Object::Integer(PAGE_HEIGHT - MARGIN),
                ],
            ),
        ];
        for line in page_lines {
            operations.push(Operation::new("Tj", vec![Object::string_literal(line.as_str())]));
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("ET", vec![]));

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(count),
        "Resources" => resources_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(PAGE_WIDTH),
            Object::Integer(PAGE_HEIGHT),
        ],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_xml_becomes_pdf() {
        let pdf = xml_to_pdf("<order><id>17</id><item>Widget</item></order>").unwrap();
        assert!(pdf.starts_with(b"%PDF-1.5"));

        let doc = Document::load_mem(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn long_documents_paginate() {
        let body: String = (0..200).map(|i| format!("<row>line {i}</row>")).collect();
        let pdf = xml_to_pdf(&format!("<rows>{body}</rows>")).unwrap();
        let doc = Document::load_mem(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 200usize.div_ceil(LINES_PER_PAGE));
    }

    #[test]
    fn non_ascii_or_empty_defers() {
        assert!(xml_to_pdf("<a>日本語</a>").is_none());
        assert!(xml_to_pdf("<a><b/></a>").is_none());
    }

    #[test]
    fn text_pdf_keeps_one_page_per_entry() {
        let pages = vec![
            vec!["first".to_string()],
            vec!["second".to_string()],
            vec![],
        ];
        let doc = Document::load_mem(&text_pdf(&pages).unwrap()).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn long_lines_wrap() {
        let lines = wrap_lines(&"x".repeat(LINE_CHARS * 2 + 1));
        assert_eq!(lines.len(), 3);
    }
}
