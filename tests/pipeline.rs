//! Integration tests for `Processor::process`.
//!
//! The PDF and OCR backends are replaced by in-process fakes so these run
//! without pdfium or tesseract. Tests that need a failing converter use `sh`
//! and are unix-only.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use ocr_service::pipeline::context::PageImage;
use ocr_service::pipeline::encode::encode_png;
use ocr_service::{
    ContentKind, OcrEngine, OcrResult, OperationMode, PdfEngine, ProcessResult, Processor,
    ServiceConfig, ServiceError, TextChecks,
};
use std::sync::Arc;
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// A "PDF" is anything starting with `%PDF`; its pages are fixed strings.
struct FakePdf {
    pages: Vec<String>,
}

impl FakePdf {
    fn with_pages(pages: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn check(pdf: &[u8]) -> Result<(), ServiceError> {
        if pdf.starts_with(b"%PDF") {
            Ok(())
        } else {
            Err(ServiceError::Render("not a pdf".into()))
        }
    }
}

impl PdfEngine for FakePdf {
    fn page_count(&self, pdf: &[u8]) -> Result<usize, ServiceError> {
        Self::check(pdf)?;
        Ok(self.pages.len())
    }

    /// Page `i` is a 4x4 image filled with grey level `i`.
    fn render_pages(
        &self,
        pdf: &[u8],
        indices: &[usize],
        _scale: f32,
    ) -> Result<Vec<(usize, DynamicImage)>, ServiceError> {
        Self::check(pdf)?;
        Ok(indices
            .iter()
            .map(|&i| {
                let img = GrayImage::from_pixel(4, 4, Luma([i as u8]));
                (i, DynamicImage::ImageLuma8(img))
            })
            .collect())
    }

    fn page_texts(&self, pdf: &[u8]) -> Result<Vec<String>, ServiceError> {
        Self::check(pdf)?;
        Ok(self.pages.clone())
    }
}

/// Reads the page number back from the grey level; earlier pages finish last.
struct FakeOcr {
    hang: bool,
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(&self, page: &PageImage) -> Result<OcrResult, ServiceError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        let level = page.image.to_luma8().get_pixel(0, 0)[0] as usize;
        tokio::time::sleep(Duration::from_millis(5 * (10 - level.min(10)) as u64)).await;
        Ok(OcrResult {
            page_index: page.index,
            text: format!("text of page {level}\n"),
            confidence: 0.9,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn config(mode: OperationMode, tmp: &std::path::Path) -> ServiceConfig {
    ServiceConfig::builder()
        .mode(mode)
        .ocr_workers(4)
        .ocr_timeout_secs(1)
        .converter_threads(2)
        .acquire_retries(0)
        .tmp_dir(tmp)
        .build()
        .expect("valid config")
}

fn processor(mode: OperationMode, tmp: &std::path::Path, pages: &[&str]) -> Processor {
    Processor::builder(config(mode, tmp))
        .pdf_engine(FakePdf::with_pages(pages))
        .ocr_engine(Arc::new(FakeOcr { hang: false }))
        .build()
        .expect("processor")
}

fn png() -> Vec<u8> {
    encode_png(&DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([255])))).unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pdf_without_ocr_concatenates_text_layers() {
    let tmp = tempfile::tempdir().unwrap();
    let pages = ["First page. ", "Second page. ", "Third page."];
    let p = processor(OperationMode::NoOcr, tmp.path(), &pages);

    let out = p.process(b"%PDF-1.5\n%fake".to_vec(), Some("report.pdf")).await;
    assert_eq!(out.metadata.pages, 3);
    assert_eq!(out.metadata.ocr_skipped, None);
    assert_eq!(out.metadata.content_type, "application/pdf");
    assert_eq!(out.text, pages.concat());
    assert!(out.metadata.elapsed_time.is_some());
}

#[tokio::test]
async fn png_without_ocr_is_skipped_successfully() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::NoOcr, tmp.path(), &[]);

    let out = p.process(png(), Some("scan.png")).await;
    assert_eq!(out.metadata.pages, 1);
    assert_eq!(out.metadata.ocr_skipped, Some(true));
    assert_eq!(out.text, "");

    let response = ProcessResult::from_output(out, None);
    assert!(response.success);
    assert_eq!(
        response.metadata.log_message.as_deref(),
        Some(ocr_service::output::OCR_SKIPPED_MESSAGE)
    );
}

#[tokio::test]
async fn ocr_reassembles_pages_in_document_order() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::Ocr, tmp.path(), &["", "", "", "", "", ""]);

    let out = p.process(b"%PDF-1.4 scanned".to_vec(), None).await;
    let expected: Vec<String> = (0..6).map(|i| format!("text of page {i}")).collect();
    assert_eq!(out.text, expected.join("\n\n"));
    assert_eq!(out.metadata.pages, 6);
    let confidence = out.metadata.confidence.expect("OCR sets confidence");
    assert!((confidence - 0.9).abs() < 1e-5, "got {confidence}");
    assert!(out.metadata.log_message.is_none());
}

#[tokio::test]
async fn image_with_ocr_is_recognised_as_one_page() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::Ocr, tmp.path(), &[]);

    let out = p.process(png(), Some("photo.png")).await;
    assert_eq!(out.metadata.pages, 1);
    assert_eq!(out.metadata.content_type, "image/png");
    assert!(out.text.starts_with("text of page"));
}

#[tokio::test]
async fn ocr_timeout_returns_best_effort_result() {
    let tmp = tempfile::tempdir().unwrap();
    let p = Processor::builder(config(OperationMode::Ocr, tmp.path()))
        .pdf_engine(FakePdf::with_pages(&["a", "b"]))
        .ocr_engine(Arc::new(FakeOcr { hang: true }))
        .build()
        .unwrap();

    let out = tokio::time::timeout(Duration::from_secs(10), p.process(b"%PDF-1.4".to_vec(), None))
        .await
        .expect("process must not hang past the OCR timeout");
    assert_eq!(out.text, "");
    let msg = out.metadata.log_message.expect("failure is reported");
    assert!(msg.contains("timed out"), "got: {msg}");
    assert!(out.metadata.elapsed_time.is_some());
}

// ── Properties ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_text_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::Ocr, tmp.path(), &[]);
    let samples = [
        "hello world",
        "  leading and trailing whitespace  \n\n",
        "Ünïcödé — 日本語 — emoji 🎉\r\nsecond line\ttab",
        "a,b,c\n1,2,3\n",
    ];
    for sample in samples {
        let checks = TextChecks::new(0.95);
        assert_eq!(
            ocr_service::classify(sample.as_bytes(), &checks).kind,
            ContentKind::PlainText,
            "{sample:?}"
        );
        let out = p.process(sample.as_bytes().to_vec(), Some("note.txt")).await;
        assert_eq!(out.text, String::from_utf8_lossy(sample.as_bytes()));
        assert_eq!(out.metadata.pages, 1);
    }
}

#[tokio::test]
async fn process_never_fails_and_always_reports_content_type() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::Ocr, tmp.path(), &["p"]);
    let inputs: Vec<(Vec<u8>, Option<&str>)> = vec![
        (Vec::new(), None),
        (vec![0, 159, 146, 150, 7, 8, 9], Some("blob.bin")),
        (png(), Some("image")),
        (b"<html><body>hi</body></html>".to_vec(), Some("a.html")),
        (b"<root><v>1</v></root>".to_vec(), None),
        (b"{\\rtf1\\ansi plain rtf}".to_vec(), Some("r.rtf")),
        (b"%PDF-1.7 truncated".to_vec(), Some("t.pdf")),
        (b"PK\x03\x04 not really a zip".to_vec(), Some("x.docx")),
    ];
    for (bytes, name) in inputs {
        let out = p.process(bytes, name).await;
        assert!(!out.metadata.content_type.is_empty(), "{name:?}");
        assert!(out.metadata.elapsed_time.is_some(), "{name:?}");
    }
}

#[tokio::test]
async fn unknown_binary_is_reported_as_unsupported() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::Ocr, tmp.path(), &[]);

    let out = p.process(vec![0u8, 1, 2, 3, 250, 251], Some("mystery")).await;
    assert_eq!(out.text, "");
    let msg = out.metadata.log_message.clone().unwrap_or_default();
    assert!(msg.contains("Unsupported content"), "got: {msg}");

    let response = ProcessResult::from_output(out, Some(serde_json::json!({"id": 7})));
    assert!(!response.success);
    assert_eq!(response.footer, Some(serde_json::json!({"id": 7})));
}

#[tokio::test]
async fn concurrent_requests_do_not_mix_content() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor(OperationMode::Ocr, tmp.path(), &[]);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let p = p.clone();
            tokio::spawn(async move {
                let body = format!("request number {i}");
                let out = p.process(body.clone().into_bytes(), None).await;
                (body, out.text)
            })
        })
        .collect();
    for task in tasks {
        let (sent, got) = task.await.unwrap();
        assert_eq!(sent, got);
    }
}

// ── Converter failure → fallback ─────────────────────────────────────────────

#[cfg(unix)]
fn processor_with_client(
    tmp: &std::path::Path,
    ports: &str,
    client: ocr_service::CommandTemplate,
) -> Processor {
    use ocr_service::CommandTemplate;

    let config = ServiceConfig::builder()
        .mode(OperationMode::Ocr)
        .acquire_retries(0)
        .tmp_dir(tmp)
        .port_range(ports.parse().unwrap())
        .monitor_interval_secs(3600)
        .shutdown_grace_ms(200)
        .server_command(CommandTemplate::new("sleep", ["300"]))
        .client_command(client)
        .build()
        .unwrap();
    Processor::builder(config)
        .pdf_engine(FakePdf::with_pages(&[]))
        .ocr_engine(Arc::new(FakeOcr { hang: false }))
        .build()
        .unwrap()
}

#[cfg(unix)]
fn failing_client() -> ocr_service::CommandTemplate {
    ocr_service::CommandTemplate::new("sh", ["-c", "echo conversion broke >&2; exit 1"])
}

#[cfg(unix)]
#[tokio::test]
async fn malformed_html_falls_back_when_conversion_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor_with_client(tmp.path(), "39610-39611", failing_client());
    tokio_test::assert_ok!(p.start_pool().await);

    let html = b"<!DOCTYPE html><html><head><style>p{}</style></head>\
<body><h1>Quarterly</h1><p>Revenue grew &amp; costs fell<p>Unclosed <b>tags";
    let out = p.process(html.to_vec(), Some("report.html")).await;

    assert!(out.text.contains("Quarterly"), "got: {:?}", out.text);
    assert!(out.text.contains("Revenue grew & costs fell"), "got: {:?}", out.text);
    assert!(!out.text.contains("p{}"));
    assert_eq!(out.metadata.content_type, "text/plain");
    assert_eq!(out.metadata.pages, 1);

    // The failed conversion marked the worker unhealthy.
    let status = p.pool_status();
    assert_eq!(status.len(), 1);
    assert!(!status[0].healthy);

    p.stop_pool().await;
}

#[cfg(unix)]
#[tokio::test]
async fn non_ascii_xml_falls_back_to_text_nodes_when_conversion_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let p = processor_with_client(tmp.path(), "39612-39613", failing_client());
    tokio_test::assert_ok!(p.start_pool().await);

    let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<menu><dish>Café crème</dish><dish>Smörgåsbord</dish></menu>";
    let out = p.process(xml.as_bytes().to_vec(), Some("menu.xml")).await;

    assert_eq!(out.text, "Café crème\nSmörgåsbord");
    assert_eq!(out.metadata.content_type, "text/plain");
    assert_eq!(out.metadata.pages, 1);
    assert!(out.metadata.log_message.is_none());
    assert!(!p.pool_status()[0].healthy, "conversion was attempted and failed");

    p.stop_pool().await;
}

#[cfg(unix)]
#[tokio::test]
async fn missing_client_program_falls_back_and_keeps_worker_healthy() {
    let tmp = tempfile::tempdir().unwrap();
    let client = ocr_service::CommandTemplate::new("/nonexistent/convert-client", ["{input}"]);
    let p = processor_with_client(tmp.path(), "39614-39615", client);
    tokio_test::assert_ok!(p.start_pool().await);

    let out = p.process(b"<html><p>still readable</p></html>".to_vec(), Some("a.html")).await;

    assert_eq!(out.text, "still readable");
    assert_eq!(out.metadata.content_type, "text/plain");
    let status = p.pool_status();
    assert!(status[0].healthy);
    assert!(!status[0].busy, "lease released after the spawn error");

    p.stop_pool().await;
}
