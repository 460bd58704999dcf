//! Pipeline stages for document-to-text processing.
//!
//! Each submodule implements one step. The PDF and OCR backends sit behind
//! traits ([`render::PdfEngine`], [`ocr::OcrEngine`]) so the stages can be
//! tested without native libraries.
//!
//! ## Data Flow
//!
//! ```text
//! classify ──▶ route ──▶ render ──▶ ocr ──▶ aggregate
//! (bytes)      (pool,    (pdfium)   (tesseract) (merge, metadata)
//!               xml, fallback)
//! ```
//!
//! 1. [`classify`]: decide the content kind from the bytes alone
//! 2. [`route`]: turn the input into a PDF, page images or text; the
//!    only stage that talks to the converter pool
//! 3. [`render`]: rasterise PDF pages or read their text layer; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 4. [`ocr`]: recognise page images on the bounded OCR pool
//! 5. [`aggregate`]: merge pages in order and finalise metadata

pub mod aggregate;
pub mod classify;
pub mod context;
pub mod encode;
pub mod fallback;
pub mod ocr;
pub mod pdfium;
pub mod render;
pub mod route;
pub mod tesseract;
pub mod xml;
