//! Result types returned by the processing pipeline.
//!
//! [`ProcessOutput`] is what [`crate::process::Processor::process`] returns:
//! the extracted text and the accumulated [`DocumentMetadata`].
//! [`ProcessResult`] is the response envelope a transport layer sends back,
//! with the success flag and timestamp derived from the output.

use crate::error::ServiceError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// Log message recorded when OCR was skipped on purpose.
pub const OCR_SKIPPED_MESSAGE: &str = "OCR skipped; no text generated.";

/// Log message recorded when no text could be produced.
pub const NO_TEXT_MESSAGE: &str = "No text has been generated.";

/// Metadata accumulated while processing one document.
///
/// Serialises to the flat map shape consumers expect:
/// `{"content-type": "...", "pages": 1, "confidence": 0.93, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Detected MIME type, or `text/plain` when nothing more specific applies.
    #[serde(rename = "content-type")]
    pub content_type: String,

    /// Number of pages that produced text or images.
    pub pages: usize,

    /// Mean OCR confidence across pages, 0.0–1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    /// Wall-clock processing time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,

    /// Present and `true` only when an image was acknowledged without OCR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_skipped: Option<bool>,

    /// Human-readable note on how the request ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

impl DocumentMetadata {
    pub fn ocr_was_skipped(&self) -> bool {
        self.ocr_skipped == Some(true)
    }
}

/// Text and metadata for one processed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// Response envelope for a processed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<serde_json::Value>,
    pub metadata: DocumentMetadata,
    pub success: bool,
    /// RFC 3339 timestamp of when the response was built.
    pub timestamp: String,
}

impl ProcessResult {
    /// Shape a [`ProcessOutput`] into a response.
    ///
    /// Empty text is a success only when `allow_empty_text` is set, which is
    /// the case for images acknowledged in NO_OCR mode. An existing
    /// `log_message` (e.g. an error recorded by the pipeline) is preserved on
    /// failure.
    pub fn build(
        output: ProcessOutput,
        footer: Option<serde_json::Value>,
        allow_empty_text: bool,
    ) -> Self {
        let ProcessOutput { text, mut metadata } = output;
        let success = if !text.is_empty() {
            true
        } else if allow_empty_text {
            metadata.log_message = Some(OCR_SKIPPED_MESSAGE.to_string());
            true
        } else {
            if metadata.log_message.is_none() {
                metadata.log_message = Some(NO_TEXT_MESSAGE.to_string());
            }
            false
        };

        Self {
            text,
            footer,
            metadata,
            success,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }

    /// [`ProcessResult::build`] with `allow_empty_text` derived from the metadata.
    pub fn from_output(output: ProcessOutput, footer: Option<serde_json::Value>) -> Self {
        let allow_empty = output.metadata.ocr_was_skipped();
        Self::build(output, footer, allow_empty)
    }
}

/// JSON request body carrying a base64-encoded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub binary_data: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub footer: Option<serde_json::Value>,
}

impl ProcessRequest {
    /// Decode `binary_data`, tolerating surrounding whitespace and line breaks.
    pub fn decode_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        let compact: String = self
            .binary_data
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| ServiceError::InvalidConfig(format!("binary_data is not valid base64: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(text: &str) -> ProcessOutput {
        ProcessOutput {
            text: text.into(),
            metadata: DocumentMetadata {
                content_type: "text/plain".into(),
                pages: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn metadata_serialises_with_hyphenated_content_type() {
        let json = serde_json::to_value(&output("x").metadata).unwrap();
        assert_eq!(json["content-type"], "text/plain");
        assert_eq!(json["pages"], 1);
        assert!(json.get("ocr_skipped").is_none());
        assert!(json.get("confidence").is_none());
    }

    #[test]
    fn non_empty_text_is_success() {
        let r = ProcessResult::build(output("hello"), None, false);
        assert!(r.success);
        assert!(r.metadata.log_message.is_none());
        assert!(!r.timestamp.is_empty());
    }

    #[test]
    fn empty_text_allowed_when_ocr_skipped() {
        let mut out = output("");
        out.metadata.ocr_skipped = Some(true);
        let r = ProcessResult::from_output(out, Some(serde_json::json!({"id": 7})));
        assert!(r.success);
        assert_eq!(r.metadata.log_message.as_deref(), Some(OCR_SKIPPED_MESSAGE));
        assert_eq!(r.footer.unwrap()["id"], 7);
    }

    #[test]
    fn empty_text_is_failure_and_keeps_pipeline_message() {
        let r = ProcessResult::build(output(""), None, false);
        assert!(!r.success);
        assert_eq!(r.metadata.log_message.as_deref(), Some(NO_TEXT_MESSAGE));

        let mut out = output("");
        out.metadata.log_message = Some("OCR timed out".into());
        let r = ProcessResult::build(out, None, false);
        assert_eq!(r.metadata.log_message.as_deref(), Some("OCR timed out"));
    }

    #[test]
    fn request_decodes_wrapped_base64() {
        let req = ProcessRequest {
            binary_data: "aGVs\nbG8=".into(),
            file_name: None,
            footer: None,
        };
        assert_eq!(req.decode_bytes().unwrap(), b"hello");
    }

    #[test]
    fn request_rejects_garbage() {
        let req = ProcessRequest {
            binary_data: "!!!".into(),
            file_name: None,
            footer: None,
        };
        assert!(req.decode_bytes().is_err());
    }
}
