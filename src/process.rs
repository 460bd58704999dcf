//! The document processing entry point.
//!
//! ## Pipeline
//!
//! ```text
//! bytes ─▶ classify ─▶ route ─▶ render / text layer ─▶ OCR ─▶ aggregate
//!                       │  (converter pool,             (OCR mode)
//!                       │   XML→PDF, fallback)
//! ```
//!
//! A [`Processor`] is built once at service start. It owns the converter
//! pool, the rasteriser and the long-lived OCR pool, and is shared by every
//! request. [`Processor::process`] never fails: every error is logged and
//! reflected in `metadata.log_message`, and `elapsed_time` is always set.

use crate::config::{OperationMode, ServiceConfig};
use crate::converter::pool::{ConverterPool, PoolReadiness};
use crate::converter::worker::WorkerStatus;
use crate::error::ServiceError;
use crate::output::ProcessOutput;
use crate::pipeline::aggregate;
use crate::pipeline::context::ProcessContext;
use crate::pipeline::ocr::{OcrEngine, OcrPool};
use crate::pipeline::pdfium::PdfiumEngine;
use crate::pipeline::render::{PdfEngine, PdfRasterizer};
use crate::pipeline::route::ConversionRouter;
use crate::pipeline::tesseract::TesseractEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Shared, long-lived document processor.
#[derive(Debug, Clone)]
pub struct Processor {
    config: Arc<ServiceConfig>,
    pool: ConverterPool,
    router: ConversionRouter,
    rasterizer: PdfRasterizer,
    ocr: OcrPool,
}

/// Builder for [`Processor`], mainly for swapping the PDF and OCR engines.
pub struct ProcessorBuilder {
    config: ServiceConfig,
    pdf_engine: Option<Arc<dyn PdfEngine>>,
    ocr_engine: Option<Arc<dyn OcrEngine>>,
}

impl ProcessorBuilder {
    pub fn pdf_engine(mut self, engine: Arc<dyn PdfEngine>) -> Self {
        self.pdf_engine = Some(engine);
        self
    }

    pub fn ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr_engine = Some(engine);
        self
    }

    /// Build the processor. Binds pdfium unless a PDF engine was supplied.
    pub fn build(self) -> Result<Processor, ServiceError> {
        let config = self.config;
        let pdf_engine = match self.pdf_engine {
            Some(engine) => engine,
            None => Arc::new(PdfiumEngine::new()?),
        };
        let ocr_engine = self.ocr_engine.unwrap_or_else(|| {
            Arc::new(TesseractEngine::new(
                config.tesseract.clone(),
                config.dpi,
                config.tmp_dir.clone(),
            ))
        });

        let pool = ConverterPool::new(config.converter.clone());
        let router = ConversionRouter::new(pool.clone(), &config);
        let rasterizer = PdfRasterizer::new(
            pdf_engine,
            config.converter_threads,
            config.render_scale(),
            config.grayscale,
        );
        let ocr = OcrPool::new(
            ocr_engine,
            config.ocr_workers,
            Duration::from_secs(config.ocr_timeout_secs),
        );
        debug!(
            "Processor ready: mode={}, dpi={}, ocr_workers={}",
            config.mode,
            config.dpi,
            ocr.workers()
        );

        Ok(Processor {
            config: Arc::new(config),
            pool,
            router,
            rasterizer,
            ocr,
        })
    }
}

impl Processor {
    pub fn builder(config: ServiceConfig) -> ProcessorBuilder {
        ProcessorBuilder {
            config,
            pdf_engine: None,
            ocr_engine: None,
        }
    }

    /// Processor with the default pdfium and tesseract engines.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConverterPool {
        &self.pool
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Provision converter workers and start the supervisor. Idempotent.
    pub async fn start_pool(&self) -> Result<(), ServiceError> {
        self.pool.start().await
    }

    /// Stop the supervisor and terminate every worker. Idempotent.
    pub async fn stop_pool(&self) {
        self.pool.stop().await
    }

    pub fn pool_status(&self) -> Vec<WorkerStatus> {
        self.pool.status()
    }

    pub fn readiness(&self) -> PoolReadiness {
        self.pool.readiness()
    }

    // ── Processing ───────────────────────────────────────────────────────

    /// Extract text and metadata from one document.
    pub async fn process(&self, bytes: impl Into<Vec<u8>>, file_name: Option<&str>) -> ProcessOutput {
        let started = Instant::now();
        let mut ctx = ProcessContext::new(bytes.into(), file_name, self.config.text_threshold);
        info!(
            "Processing '{}' ({} bytes, detected {})",
            ctx.request.file_name,
            ctx.request.bytes.len(),
            ctx.kind()
        );

        let log_message = match self.run_stages(&mut ctx).await {
            Ok(()) => None,
            Err(e) => {
                error!("Processing '{}' failed: {e}", ctx.request.file_name);
                Some(e.to_string())
            }
        };

        let output = aggregate::finalize(ctx, started.elapsed(), log_message);
        info!(
            "Processed in {:.2}s: {} page(s), {} chars",
            started.elapsed().as_secs_f64(),
            output.metadata.pages,
            output.text.len()
        );
        output
    }

    async fn run_stages(&self, ctx: &mut ProcessContext) -> Result<(), ServiceError> {
        self.router.route(ctx).await;
        if ctx.is_empty_outcome() {
            return Err(ServiceError::UnsupportedContent {
                file_name: ctx.request.file_name.clone(),
                detected: ctx.kind().to_string(),
            });
        }

        if !ctx.pdf_intermediate.is_empty() {
            match self.config.mode {
                OperationMode::NoOcr => {
                    let (text, pages) = self.rasterizer.extract_text(&ctx.pdf_intermediate).await;
                    ctx.output_text = text;
                    ctx.metadata.pages = pages;
                }
                OperationMode::Ocr => {
                    ctx.images = self.rasterizer.rasterize(&ctx.pdf_intermediate).await;
                    ctx.metadata.pages = ctx.images.len();
                }
            }
        }

        if self.config.mode == OperationMode::Ocr && !ctx.images.is_empty() {
            let images = std::mem::take(&mut ctx.images);
            let outcome = self.ocr.run(images).await?;
            aggregate::apply_ocr(ctx, &outcome);
        }
        Ok(())
    }
}
