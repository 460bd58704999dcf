//! Conversion routing: pick the path from raw bytes to a PDF, page images or
//! text, based on the classified content type.
//!
//! ## Paths
//!
//! | Kind | Path |
//! |------|------|
//! | PDF | bytes are the intermediate |
//! | Office, HTML, RTF, unknown | office converter → PDF |
//! | Image | one page image (OCR) or `ocr_skipped` (NO_OCR) |
//! | XML | lightweight XML → PDF, else office converter |
//! | Plain text | lossy UTF-8 decode |
//!
//! ## Fallback edge
//!
//! When a path ends with nothing and the input is text-like, the text is
//! extracted directly (markup stripped, RTF decoded, or raw). Converter
//! errors are logged and recovered here and never reach the caller.

use super::context::{PageImage, ProcessContext};
use super::classify::ContentKind;
use super::{fallback, xml};
use crate::config::{OperationMode, ServiceConfig};
use crate::converter::pool::{ConverterPool, WorkerLease};
use crate::error::ServiceError;
use image::DynamicImage;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ConversionRouter {
    pool: ConverterPool,
    mode: OperationMode,
    grayscale: bool,
    timeout: Duration,
    acquire_retries: u32,
    acquire_backoff: Duration,
}

impl ConversionRouter {
    pub fn new(pool: ConverterPool, config: &ServiceConfig) -> Self {
        Self {
            pool,
            mode: config.mode,
            grayscale: config.grayscale,
            timeout: Duration::from_secs(config.converter.process_timeout_secs),
            acquire_retries: config.converter.acquire_retries,
            acquire_backoff: Duration::from_millis(config.converter.acquire_backoff_ms),
        }
    }

    /// Run the path for `ctx`'s content kind, then the fallback edge.
    pub async fn route(&self, ctx: &mut ProcessContext) {
        let kind = ctx.kind();
        debug!("Routing '{}' as {kind}", ctx.request.file_name);

        match kind {
            ContentKind::Pdf => {
                ctx.pdf_intermediate = ctx.request.bytes.clone();
            }
            ContentKind::OfficeDoc | ContentKind::Unknown => {
                self.office_path(ctx).await;
            }
            ContentKind::Html => {
                ctx.metadata.content_type = "text/html".into();
                self.office_path(ctx).await;
            }
            ContentKind::Rtf => {
                if ctx.classification.mime.is_none() {
                    ctx.metadata.content_type = "application/rtf".into();
                }
                self.office_path(ctx).await;
            }
            ContentKind::Image => self.image_path(ctx).await,
            ContentKind::Xml => {
                ctx.metadata.content_type = "text/xml".into();
                match self.lightweight_xml(ctx).await {
                    Some(pdf) => ctx.pdf_intermediate = pdf,
                    None => self.office_path(ctx).await,
                }
            }
            ContentKind::PlainText => {
                ctx.output_text = String::from_utf8_lossy(ctx.bytes()).into_owned();
                ctx.metadata.pages = 1;
            }
        }

        if ctx.needs_fallback() {
            info!(
                "No conversion output for '{}'; extracting text directly",
                ctx.request.file_name
            );
            ctx.output_text = fallback::extract_text(ctx.bytes(), &ctx.checks);
            ctx.metadata.pages = 1;
            ctx.metadata.content_type = "text/plain".into();
        }
    }

    // ── Paths ────────────────────────────────────────────────────────────

    async fn office_path(&self, ctx: &mut ProcessContext) {
        match self.office_convert(ctx).await {
            Ok(pdf) => ctx.pdf_intermediate = pdf,
            Err(e) if e.is_converter_error() => {
                warn!("Office conversion of '{}' failed: {e}", ctx.request.file_name)
            }
            Err(e) => error!(
                "Office conversion of '{}' could not run: {e}",
                ctx.request.file_name
            ),
        }
    }

    async fn office_convert(&self, ctx: &ProcessContext) -> Result<Vec<u8>, ServiceError> {
        let lease = self.acquire_with_backoff().await?;
        let started = Instant::now();
        let result = self.pool.convert(&lease, &ctx.request, self.timeout).await;
        self.pool.release(lease);
        if result.is_ok() {
            info!(
                "Converted '{}' to PDF in {:.2}s",
                ctx.request.file_name,
                started.elapsed().as_secs_f64()
            );
        }
        result
    }

    /// Acquire a worker, retrying `ConverterUnavailable` with doubling delays.
    async fn acquire_with_backoff(&self) -> Result<WorkerLease, ServiceError> {
        let mut delay = self.acquire_backoff;
        let mut attempt = 0;
        loop {
            match self.pool.acquire() {
                Ok(lease) => return Ok(lease),
                Err(e) if attempt >= self.acquire_retries => return Err(e),
                Err(_) => {
                    attempt += 1;
                    debug!(
                        "No converter worker free; retry {attempt}/{} in {}ms",
                        self.acquire_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    async fn image_path(&self, ctx: &mut ProcessContext) {
        if self.mode == OperationMode::NoOcr {
            ctx.metadata.pages = 1;
            ctx.metadata.ocr_skipped = Some(true);
            return;
        }

        let bytes = ctx.request.bytes.clone();
        let grayscale = self.grayscale;
        let decoded = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|img| {
                if grayscale {
                    DynamicImage::ImageLuma8(img.to_luma8())
                } else {
                    img
                }
            })
        })
        .await;

        match decoded {
            Ok(Ok(image)) => {
                ctx.images.push(PageImage { index: 0, image });
                ctx.metadata.pages = 1;
            }
            Ok(Err(e)) => warn!("Could not decode image '{}': {e}", ctx.request.file_name),
            Err(e) => warn!("Image decode task panicked: {e}"),
        }
    }

    async fn lightweight_xml(&self, ctx: &ProcessContext) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(ctx.bytes()).trim_start_matches('\u{feff}').to_string();
        match tokio::task::spawn_blocking(move || xml::xml_to_pdf(&text)).await {
            Ok(pdf) => pdf,
            Err(e) => {
                warn!("XML conversion task panicked: {e}");
                None
            }
        }
    }
}
