//! Bounded, long-lived OCR worker pool.
//!
//! ## Why a semaphore instead of a pool per request?
//!
//! One [`OcrPool`] is created per [`crate::process::Processor`] and shared by
//! every request. Its semaphore caps the number of pages recognised at once
//! across *all* requests, so a burst of large PDFs cannot fork one OCR
//! process per page per request.
//!
//! ## Failure policy
//!
//! Any page that times out or fails aborts the whole run and the remaining
//! tasks are cancelled. A timeout cancels only the future of the offending
//! page; engines that shell out must use kill-on-drop children so the
//! cancelled future takes its process with it.

use super::context::PageImage;
use crate::error::ServiceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Recognised text of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrResult {
    pub page_index: usize,
    pub text: String,
    /// Mean word confidence on a 0–1 scale; 1.0 when no words were reported.
    pub confidence: f32,
}

/// Text recognition backend.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, page: &PageImage) -> Result<OcrResult, ServiceError>;
}

/// Output of a successful [`OcrPool::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    /// Per-page results in page order.
    pub pages: Vec<OcrResult>,
    /// Mean of the page confidences.
    pub confidence: f32,
}

impl OcrOutcome {
    /// Page texts concatenated in page order.
    pub fn text(&self) -> String {
        self.pages.iter().map(|p| p.text.as_str()).collect()
    }
}

#[derive(Clone)]
pub struct OcrPool {
    engine: Arc<dyn OcrEngine>,
    permits: Arc<Semaphore>,
    workers: usize,
    page_timeout: Duration,
}

impl std::fmt::Debug for OcrPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrPool")
            .field("workers", &self.workers)
            .field("page_timeout", &self.page_timeout)
            .finish_non_exhaustive()
    }
}

impl OcrPool {
    pub fn new(engine: Arc<dyn OcrEngine>, workers: usize, page_timeout: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            page_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Recognise every page concurrently, bounded by the pool size.
    pub async fn run(&self, images: Vec<PageImage>) -> Result<OcrOutcome, ServiceError> {
        let started = Instant::now();
        let total = images.len();
        if total == 0 {
            return Ok(OcrOutcome {
                pages: Vec::new(),
                confidence: 1.0,
            });
        }
        info!("OCR: {total} page(s), up to {} at a time", self.workers);

        let mut tasks = JoinSet::new();
        let mut task_pages = HashMap::with_capacity(total);
        for page in images {
            let index = page.index;
            let engine = Arc::clone(&self.engine);
            let permits = Arc::clone(&self.permits);
            let page_timeout = self.page_timeout;
            let handle = tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| ServiceError::Internal(format!("OCR pool closed: {e}")))?;
                let page_started = Instant::now();
                let result = tokio::time::timeout(page_timeout, engine.recognize(&page))
                    .await
                    .map_err(|_| ServiceError::OcrTimeout {
                        page: index + 1,
                        secs: page_timeout.as_secs(),
                    })??;
                debug!(
                    "OCR page {} done in {:.2}s (confidence {:.2})",
                    index + 1,
                    page_started.elapsed().as_secs_f64(),
                    result.confidence
                );
                Ok::<_, ServiceError>(OcrResult {
                    page_index: index,
                    ..result
                })
            });
            task_pages.insert(handle.id(), index);
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((_, outcome)) => outcome,
                Err(e) => {
                    let page = task_pages.get(&e.id()).map(|i| i + 1).unwrap_or(0);
                    Err(ServiceError::OcrTaskError {
                        page,
                        detail: format!("OCR task panicked: {e}"),
                    })
                }
            };
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!("OCR aborted: {e}");
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        results.sort_by_key(|r| r.page_index);
        let confidence = results.iter().map(|r| r.confidence).sum::<f32>() / results.len() as f32;
        info!(
            "OCR: {total} page(s) in {:.2}s, mean confidence {confidence:.2}",
            started.elapsed().as_secs_f64()
        );
        Ok(OcrOutcome {
            pages: results,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn page(index: usize) -> PageImage {
        PageImage {
            index,
            image: DynamicImage::ImageLuma8(GrayImage::new(2, 2)),
        }
    }

    /// Finishes later pages first and tracks peak concurrency.
    struct Staggered {
        pages: usize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for Staggered {
        async fn recognize(&self, page: &PageImage) -> Result<OcrResult, ServiceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = 10 * (self.pages - page.index) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(OcrResult {
                page_index: page.index,
                text: format!("[{}]", page.index),
                confidence: if page.index == 0 { 0.5 } else { 1.0 },
            })
        }
    }

    struct Failing {
        bad_page: usize,
        hang: bool,
    }

    #[async_trait]
    impl OcrEngine for Failing {
        async fn recognize(&self, page: &PageImage) -> Result<OcrResult, ServiceError> {
            if page.index == self.bad_page {
                if self.hang {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                return Err(ServiceError::OcrTaskError {
                    page: page.index + 1,
                    detail: "engine exploded".into(),
                });
            }
            Ok(OcrResult {
                page_index: page.index,
                text: "ok".into(),
                confidence: 1.0,
            })
        }
    }

    #[tokio::test]
    async fn results_follow_page_order_and_respect_bound() {
        let engine = Arc::new(Staggered {
            pages: 6,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = OcrPool::new(engine.clone(), 2, Duration::from_secs(5));
        let outcome = pool.run((0..6).map(page).collect()).await.unwrap();

        assert_eq!(outcome.text(), "[0][1][2][3][4][5]");
        assert!((outcome.confidence - (0.5 + 5.0) / 6.0).abs() < 1e-6);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let pool = OcrPool::new(Arc::new(Failing { bad_page: 0, hang: false }), 1, Duration::from_secs(1));
        let outcome = pool.run(Vec::new()).await.unwrap();
        assert!(outcome.pages.is_empty());
        assert_eq!(outcome.text(), "");
    }

    #[tokio::test]
    async fn a_failing_page_fails_the_run() {
        let pool = OcrPool::new(Arc::new(Failing { bad_page: 1, hang: false }), 4, Duration::from_secs(5));
        let err = pool.run((0..3).map(page).collect()).await.unwrap_err();
        assert!(matches!(err, ServiceError::OcrTaskError { page: 2, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn a_slow_page_times_out() {
        let pool = OcrPool::new(
            Arc::new(Failing { bad_page: 0, hang: true }),
            2,
            Duration::from_millis(50),
        );
        let started = Instant::now();
        let err = pool.run((0..2).map(page).collect()).await.unwrap_err();
        assert!(matches!(err, ServiceError::OcrTimeout { page: 1, .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
