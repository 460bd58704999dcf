//! Image encoding: `DynamicImage` → PNG bytes for the OCR engine.
//!
//! ## Why PNG?
//! Lossless compression preserves glyph edges. JPEG artefacts around rendered
//! text measurably lower tesseract confidence at 150–200 DPI.

use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a page image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} image → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}
