//! PDF rasterisation and text-layer extraction.
//!
//! ## Why a trait?
//!
//! The PDF backend ([`PdfEngine`]) is blocking and owns native state. Keeping
//! it behind a trait lets the rasteriser own the async concerns (thread
//! fan-out, ordering, grayscale) while tests substitute a fake document.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is CPU-bound C++ and not async-safe. Each chunk of pages is rendered
//! on the blocking pool so the Tokio workers never stall during rendering.
//!
//! ## Failure policy
//!
//! Both entry points are best-effort: a broken PDF yields no pages (or no
//! text) and a warning, and the caller decides what an empty result means.

use super::context::PageImage;
use crate::error::ServiceError;
use futures::future::join_all;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Blocking PDF backend.
pub trait PdfEngine: Send + Sync {
    /// Number of pages in `pdf`.
    fn page_count(&self, pdf: &[u8]) -> Result<usize, ServiceError>;

    /// Render the given zero-based pages at `scale` (1.0 = 72 DPI).
    fn render_pages(
        &self,
        pdf: &[u8],
        indices: &[usize],
        scale: f32,
    ) -> Result<Vec<(usize, DynamicImage)>, ServiceError>;

    /// Embedded text of every page, in page order.
    fn page_texts(&self, pdf: &[u8]) -> Result<Vec<String>, ServiceError>;
}

/// Renders PDFs to page images across a fixed number of blocking threads.
#[derive(Clone)]
pub struct PdfRasterizer {
    engine: Arc<dyn PdfEngine>,
    threads: usize,
    scale: f32,
    grayscale: bool,
}

impl std::fmt::Debug for PdfRasterizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfRasterizer")
            .field("threads", &self.threads)
            .field("scale", &self.scale)
            .field("grayscale", &self.grayscale)
            .finish_non_exhaustive()
    }
}

impl PdfRasterizer {
    pub fn new(engine: Arc<dyn PdfEngine>, threads: usize, scale: f32, grayscale: bool) -> Self {
        Self {
            engine,
            threads: threads.max(1),
            scale,
            grayscale,
        }
    }

    /// Render every page of `pdf`, in page order.
    ///
    /// Returns an empty vector when the document cannot be opened or any
    /// chunk fails to render.
    pub async fn rasterize(&self, pdf: &[u8]) -> Vec<PageImage> {
        match self.try_rasterize(pdf).await {
            Ok(pages) => pages,
            Err(e) => {
                warn!("Rasterisation failed: {e}");
                Vec::new()
            }
        }
    }

    async fn try_rasterize(&self, pdf: &[u8]) -> Result<Vec<PageImage>, ServiceError> {
        let data: Arc<[u8]> = Arc::from(pdf);

        let engine = Arc::clone(&self.engine);
        let bytes = Arc::clone(&data);
        let total = tokio::task::spawn_blocking(move || engine.page_count(&bytes))
            .await
            .map_err(|e| ServiceError::Internal(format!("Page count task panicked: {e}")))??;
        info!("PDF loaded: {total} pages");
        if total == 0 {
            return Ok(Vec::new());
        }

        let tasks = page_chunks(total, self.threads).into_iter().map(|chunk| {
            let engine = Arc::clone(&self.engine);
            let bytes = Arc::clone(&data);
            let scale = self.scale;
            tokio::task::spawn_blocking(move || engine.render_pages(&bytes, &chunk, scale))
        });

        let mut rendered = Vec::with_capacity(total);
        for joined in join_all(tasks).await {
            let chunk = joined
                .map_err(|e| ServiceError::Internal(format!("Render task panicked: {e}")))??;
            rendered.extend(chunk);
        }
        rendered.sort_by_key(|(index, _)| *index);

        let grayscale = self.grayscale;
        let pages = rendered
            .into_iter()
            .map(|(index, image)| {
                let image = if grayscale {
                    DynamicImage::ImageLuma8(image.to_luma8())
                } else {
                    image
                };
                debug!("Page {} → {}x{} px", index + 1, image.width(), image.height());
                PageImage { index, image }
            })
            .collect();
        Ok(pages)
    }

    /// Concatenate the embedded text of every page.
    ///
    /// Returns `("", 0)` when the document cannot be opened.
    pub async fn extract_text(&self, pdf: &[u8]) -> (String, usize) {
        let engine = Arc::clone(&self.engine);
        let bytes = pdf.to_vec();
        let texts = tokio::task::spawn_blocking(move || engine.page_texts(&bytes))
            .await
            .map_err(|e| ServiceError::Internal(format!("Text extraction task panicked: {e}")))
            .and_then(|r| r);
        match texts {
            Ok(texts) => {
                let pages = texts.len();
                (texts.concat(), pages)
            }
            Err(e) => {
                warn!("Text extraction failed: {e}");
                (String::new(), 0)
            }
        }
    }
}

/// Split `0..total` into at most `threads` contiguous, non-empty chunks.
fn page_chunks(total: usize, threads: usize) -> Vec<Vec<usize>> {
    let size = total.div_ceil(threads.max(1)).max(1);
    (0..total)
        .collect::<Vec<_>>()
        .chunks(size)
        .map(<[usize]>::to_vec)
        .collect()
}
