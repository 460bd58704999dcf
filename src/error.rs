//! Error types for the ocr-service library.
//!
//! A single [`ServiceError`] enum covers every failure in the core. The
//! variants fall into two families:
//!
//! * **Recoverable pipeline errors**: converter unavailable, conversion failed
//!   or timed out, OCR page failures. The router and the top-level
//!   [`crate::process::Processor::process`] catch these, log them, and turn
//!   them into a best-effort result with a `log_message` in the metadata.
//!
//! * **Setup errors**: invalid configuration, registry I/O, pdfium binding,
//!   process spawn failures. These surface from constructors and lifecycle
//!   hooks such as `start_pool()`.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the ocr-service library.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Converter errors ──────────────────────────────────────────────────
    /// The conversion client ran past its time budget and its process tree was killed.
    #[error("Conversion on port {port} timed out after {secs}s; process tree terminated")]
    ConversionTimeout { port: u16, secs: u64 },

    /// No converter worker was free and healthy.
    #[error("No converter worker available (all busy or unhealthy)")]
    ConverterUnavailable,

    /// The conversion client exited non-zero or produced no output.
    #[error("Conversion on port {port} failed: {detail}")]
    ConversionFailed { port: u16, detail: String },

    /// Nothing usable could be produced from the input.
    #[error("Unsupported content in '{file_name}' (detected: {detected})")]
    UnsupportedContent { file_name: String, detected: String },

    // ── OCR errors ────────────────────────────────────────────────────────
    /// A single page exceeded the per-page OCR timeout.
    #[error("OCR timed out after {secs}s on page {page}")]
    OcrTimeout { page: usize, secs: u64 },

    /// The OCR engine failed on a page.
    #[error("OCR failed on page {page}: {detail}")]
    OcrTaskError { page: usize, detail: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// pdfium could not load or render the document.
    #[error("PDF rendering failed: {0}")]
    Render(String),

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Process errors ────────────────────────────────────────────────────
    /// An external program could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker-port registry could not be read, locked or written.
    #[error("Port registry error: {0}")]
    Registry(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Filesystem error with the path involved.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Wrap an I/O error together with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ServiceError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the errors the router recovers from via the text fallback.
    pub fn is_converter_error(&self) -> bool {
        matches!(
            self,
            ServiceError::ConversionTimeout { .. }
                | ServiceError::ConverterUnavailable
                | ServiceError::ConversionFailed { .. }
        )
    }
}
