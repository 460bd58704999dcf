//! # ocr-service
//!
//! Turn arbitrary uploaded documents (office formats, PDF, images, HTML, XML,
//! RTF, plain text) into extracted text plus metadata.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes
//!  │
//!  ├─ 1. Classify  binary signature, then XML / HTML / RTF / text checks
//!  ├─ 2. Route     PDF as-is, office formats via the converter pool,
//!  │               images as pages, text-like input via fallback extraction
//!  ├─ 3. Render    pdfium rasterisation (OCR) or text layer (NO_OCR)
//!  ├─ 4. OCR       bounded tesseract pool, results in page order
//!  └─ 5. Output    merged text + metadata (content-type, pages, confidence,
//!                  elapsed_time, ocr_skipped)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocr_service::{OperationMode, Processor, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder()
//!         .mode(OperationMode::NoOcr)
//!         .converter_workers(2)
//!         .build()?;
//!     let processor = Processor::new(config)?;
//!     processor.start_pool().await?;
//!
//!     let bytes = std::fs::read("report.docx")?;
//!     let output = processor.process(bytes, Some("report.docx")).await;
//!     println!("{}", output.text);
//!     eprintln!("{:?}", output.metadata);
//!
//!     processor.stop_pool().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr-service` binary (clap + anyhow + tracing-subscriber) |
//!
//! ## External programs
//!
//! | Program | Needed for |
//! |---------|------------|
//! | pdfium (shared library) | PDF rendering and text layers |
//! | `unoserver` + LibreOffice | office, HTML and RTF conversion |
//! | `tesseract` | OCR mode |
//!
//! Without a converter, text-like input still succeeds through the fallback
//! extraction.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod converter;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod process;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CommandTemplate, ConverterConfig, OperationMode, PortRange, ServiceConfig,
    ServiceConfigBuilder, TesseractConfig,
};
pub use converter::pool::{ConverterPool, PoolReadiness, WorkerLease};
pub use converter::worker::WorkerStatus;
pub use error::ServiceError;
pub use output::{DocumentMetadata, ProcessOutput, ProcessRequest, ProcessResult};
pub use pipeline::classify::{classify, ContentKind, TextChecks};
pub use pipeline::ocr::{OcrEngine, OcrOutcome, OcrPool, OcrResult};
pub use pipeline::render::{PdfEngine, PdfRasterizer};
pub use process::{Processor, ProcessorBuilder};
