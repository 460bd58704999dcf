//! [`PdfEngine`] backed by the pdfium C++ library.
//!
//! ## Library resolution
//!
//! 1. `PDFIUM_LIB_PATH`, either the library file itself or the directory
//!    holding the platform-specific library name.
//! 2. The system library search path.
//!
//! The binding is resolved once in [`PdfiumEngine::new`] so a missing library
//! is reported at startup rather than on the first document. Every call then
//! binds afresh on the calling (blocking) thread, since a `Pdfium` handle is
//! tied to the thread-local state of the library.

use super::render::PdfEngine;
use crate::error::ServiceError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Environment variable naming an explicit pdfium library.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

#[derive(Debug, Clone)]
pub struct PdfiumEngine {
    /// `None` means the system library.
    library: Option<PathBuf>,
}

impl PdfiumEngine {
    /// Resolve and test-bind the pdfium library.
    pub fn new() -> Result<Self, ServiceError> {
        let engine = Self {
            library: library_from_env(),
        };
        engine.bind()?;
        debug!("pdfium bound from {}", engine.describe());
        Ok(engine)
    }

    fn describe(&self) -> String {
        match &self.library {
            Some(path) => path.display().to_string(),
            None => "system library path".to_string(),
        }
    }

    fn bind(&self) -> Result<Pdfium, ServiceError> {
        let bindings = match &self.library {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| ServiceError::PdfiumBindingFailed(format!("{}: {e:?}", self.describe())))?;
        Ok(Pdfium::new(bindings))
    }
}

fn library_from_env() -> Option<PathBuf> {
    let raw = std::env::var_os(PDFIUM_LIB_PATH_ENV)?;
    let path = PathBuf::from(raw);
    if path.is_dir() {
        return Some(Pdfium::pdfium_platform_library_name_at_path(&path));
    }
    if !path.exists() {
        warn!(
            "{PDFIUM_LIB_PATH_ENV} '{}' not found; using system library",
            path.display()
        );
        return None;
    }
    Some(path)
}

fn render_error(e: PdfiumError) -> ServiceError {
    ServiceError::Render(format!("{e:?}"))
}

impl PdfEngine for PdfiumEngine {
    fn page_count(&self, pdf: &[u8]) -> Result<usize, ServiceError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(render_error)?;
        let count = document.pages().len() as usize;
        Ok(count)
    }

    fn render_pages(
        &self,
        pdf: &[u8],
        indices: &[usize],
        scale: f32,
    ) -> Result<Vec<(usize, DynamicImage)>, ServiceError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(render_error)?;
        let pages = document.pages();
        let total = pages.len() as usize;
        let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

        let mut results = Vec::with_capacity(indices.len());
        for &idx in indices {
            if idx >= total {
                warn!("Skipping page {} (out of range, total={total})", idx + 1);
                continue;
            }
            let page = pages.get(idx as u16).map_err(|e| {
                ServiceError::Render(format!("page {}: {e:?}", idx + 1))
            })?;
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                ServiceError::Render(format!("page {}: {e:?}", idx + 1))
            })?;
            results.push((idx, bitmap.as_image()));
        }
        Ok(results)
    }

    fn page_texts(&self, pdf: &[u8]) -> Result<Vec<String>, ServiceError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(render_error)?;
        let mut texts = Vec::new();
        for (idx, page) in document.pages().iter().enumerate() {
            let text = page
                .text()
                .map_err(|e| ServiceError::Render(format!("page {}: {e:?}", idx + 1)))?;
            texts.push(text.all());
        }
        Ok(texts)
    }
}
