//! [`OcrEngine`] that shells out to the `tesseract` CLI.
//!
//! Every page gets its own short-lived `tesseract` process reading a PNG
//! temp file and writing TSV to stdout. The TSV carries per-word confidences
//! and the block/paragraph/line numbers needed to rebuild the layout.

use super::context::PageImage;
use super::encode::encode_png;
use super::ocr::{OcrEngine, OcrResult};
use crate::config::TesseractConfig;
use crate::error::ServiceError;
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const TSV_WORD_LEVEL: &str = "5";

#[derive(Debug, Clone)]
pub struct TesseractEngine {
    config: TesseractConfig,
    dpi: u32,
    tmp_dir: PathBuf,
}

impl TesseractEngine {
    pub fn new(config: TesseractConfig, dpi: u32, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            dpi,
            tmp_dir: tmp_dir.into(),
        }
    }

    fn command(&self, image_path: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg(image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.config.lang)
            .arg("--dpi")
            .arg(self.dpi.to_string())
            .args(&self.config.extra_flags)
            .arg("tsv")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(prefix) = &self.config.tessdata_prefix {
            cmd.env("TESSDATA_PREFIX", prefix);
        }
        cmd
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn recognize(&self, page: &PageImage) -> Result<OcrResult, ServiceError> {
        let page_no = page.index + 1;
        let task_error = move |detail: String| ServiceError::OcrTaskError {
            page: page_no,
            detail,
        };

        let image = page.image.clone();
        let tmp_dir = self.tmp_dir.clone();
        let png_file = tokio::task::spawn_blocking(move || {
            let png = encode_png(&image).map_err(|e| e.to_string())?;
            std::fs::create_dir_all(&tmp_dir).map_err(|e| e.to_string())?;
            let mut file = tempfile::Builder::new()
                .prefix("ocr-page-")
                .suffix(".png")
                .tempfile_in(&tmp_dir)
                .map_err(|e| e.to_string())?;
            file.write_all(&png).map_err(|e| e.to_string())?;
            file.flush().map_err(|e| e.to_string())?;
            Ok::<_, String>(file)
        })
        .await
        .map_err(|e| task_error(format!("PNG encode task panicked: {e}")))?
        .map_err(&task_error)?;

        let output = self
            .command(png_file.path())
            .output()
            .await
            .map_err(|e| task_error(format!("failed to run '{}': {e}", self.config.binary)))?;
        drop(png_file);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(task_error(format!(
                "{} exited with {}: {}",
                self.config.binary,
                output.status,
                stderr.trim()
            )));
        }

        let (text, confidence) = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!("tesseract page {page_no}: {} chars", text.len());
        Ok(OcrResult {
            page_index: page.index,
            text,
            confidence,
        })
    }
}

/// Rebuild page text and mean word confidence (0–1) from tesseract TSV.
///
/// Lines are separated by `\n`, paragraphs and blocks by a blank line, and
/// the text ends with a newline when non-empty.
pub fn parse_tsv(tsv: &str) -> (String, f32) {
    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut current_line: Option<(&str, &str, &str)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != TSV_WORD_LEVEL {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        if let Ok(conf) = cols[10].trim().parse::<f32>() {
            if conf >= 0.0 {
                confidences.push(conf / 100.0);
            }
        }

        let key = (cols[2], cols[3], cols[4]);
        match current_line {
            Some(prev) if prev == key => text.push(' '),
            Some((block, par, _)) => {
                if (block, par) == (key.0, key.1) {
                    text.push('\n');
                } else {
                    text.push_str("\n\n");
                }
            }
            None => {}
        }
        text.push_str(word);
        current_line = Some(key);
    }

    if !text.is_empty() {
        text.push('\n');
    }
    let confidence = if confidences.is_empty() {
        1.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32
    };
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn tsv(rows: &[&str]) -> String {
        std::iter::once(HEADER)
            .chain(rows.iter().copied())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn words_lines_and_paragraphs() {
        let input = tsv(&[
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t",
            "5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\tHello",
            "5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t80\tworld",
            "5\t1\t1\t1\t2\t1\t0\t0\t10\t10\t70\tnext",
            "5\t1\t2\t1\t1\t1\t0\t0\t10\t10\t60\tblock",
        ]);
        let (text, conf) = parse_tsv(&input);
        assert_eq!(text, "Hello world\nnext\n\nblock\n");
        assert!((conf - 0.75).abs() < 1e-6);
    }

    #[test]
    fn no_words_means_full_confidence() {
        let (text, conf) = parse_tsv(&tsv(&["1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t"]));
        assert_eq!(text, "");
        assert_eq!(conf, 1.0);
    }

    #[test]
    fn command_line_carries_options() {
        let engine = TesseractEngine::new(
            TesseractConfig {
                binary: "tesseract".into(),
                lang: "deu+eng".into(),
                extra_flags: vec!["--psm".into(), "6".into()],
                tessdata_prefix: None,
            },
            300,
            std::env::temp_dir(),
        );
        let cmd = engine.command(std::path::Path::new("/tmp/p.png"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["/tmp/p.png", "stdout", "-l", "deu+eng", "--dpi", "300", "--psm", "6", "tsv"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_a_task_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TesseractEngine::new(
            TesseractConfig {
                binary: "/nonexistent/tesseract".into(),
                ..Default::default()
            },
            200,
            dir.path(),
        );
        let page = PageImage {
            index: 2,
            image: image::DynamicImage::ImageLuma8(image::GrayImage::new(4, 4)),
        };
        let err = engine.recognize(&page).await.unwrap_err();
        assert!(matches!(err, ServiceError::OcrTaskError { page: 3, .. }), "got {err:?}");
    }
}
