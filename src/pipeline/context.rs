//! Request-scoped state threaded through the pipeline.

use super::classify::{self, Classification, ContentKind, TextChecks};
use crate::output::DocumentMetadata;
use image::DynamicImage;

/// Immutable input for one pipeline run.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub bytes: Vec<u8>,
    /// Normalised, path-free file name with an extension.
    pub file_name: String,
    /// Lower-case extension of `file_name`, without the dot.
    pub extension: String,
}

/// One rendered page, owned by the pipeline until OCR consumes it.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-based page index in document order.
    pub index: usize,
    pub image: DynamicImage,
}

/// Mutable per-request state. Created once per request and never shared.
#[derive(Debug)]
pub struct ProcessContext {
    pub request: ConversionRequest,
    pub classification: Classification,
    pub checks: TextChecks,
    pub output_text: String,
    pub images: Vec<PageImage>,
    pub pdf_intermediate: Vec<u8>,
    pub metadata: DocumentMetadata,
}

impl ProcessContext {
    /// Classify `bytes` and normalise `file_name` in one go.
    pub fn new(bytes: Vec<u8>, file_name: Option<&str>, text_threshold: f32) -> Self {
        let checks = TextChecks::new(text_threshold);
        let classification = classify::classify(&bytes, &checks);
        let file_name = classify::normalize_file_name(file_name, &bytes, &classification, &checks);
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let metadata = DocumentMetadata {
            content_type: classification
                .mime
                .clone()
                .unwrap_or_else(|| "text/plain".to_string()),
            ..Default::default()
        };

        Self {
            request: ConversionRequest {
                bytes,
                file_name,
                extension,
            },
            classification,
            checks,
            output_text: String::new(),
            images: Vec::new(),
            pdf_intermediate: Vec::new(),
            metadata,
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.classification.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.request.bytes
    }

    /// True when routing produced nothing at all.
    pub fn is_empty_outcome(&self) -> bool {
        self.pdf_intermediate.is_empty()
            && self.output_text.is_empty()
            && self.images.is_empty()
            && !self.metadata.ocr_was_skipped()
    }

    /// Whether the fallback text extraction should run.
    pub fn needs_fallback(&self) -> bool {
        self.pdf_intermediate.is_empty()
            && self.output_text.is_empty()
            && self.images.is_empty()
            && self.checks.is_text_like(&self.request.bytes)
    }
}
