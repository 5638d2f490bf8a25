//! Providers whose failures are scripted per test.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

use contractflow::pipeline::PageExtraction;
use contractflow::providers::{OcrProvider, PlainTextProvider};
use contractflow::resilience::{CallContext, DependencyError};

/// Wraps the plain-text provider and fails the first N calls of each kind.
pub struct FlakyOcr {
    count_failures: AtomicU32,
    extract_failures: AtomicU32,
    error: fn(String) -> DependencyError,
    pub count_calls: AtomicU32,
    pub extract_calls: AtomicU32,
}

impl FlakyOcr {
    pub fn new(error: fn(String) -> DependencyError) -> Self {
        Self {
            count_failures: AtomicU32::new(0),
            extract_failures: AtomicU32::new(0),
            error,
            count_calls: AtomicU32::new(0),
            extract_calls: AtomicU32::new(0),
        }
    }

    pub fn failing_page_count(self, times: u32) -> Self {
        self.count_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_extraction(self, times: u32) -> Self {
        self.extract_failures.store(times, Ordering::SeqCst);
        self
    }

    fn should_fail(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl OcrProvider for FlakyOcr {
    fn name(&self) -> &str {
        "flaky-ocr"
    }

    fn count_pages(&self, bytes: &[u8], ctx: &CallContext<'_>) -> Result<u32, DependencyError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.count_failures) {
            return Err((self.error)(format!("page count attempt {} failed", ctx.attempt)));
        }
        PlainTextProvider.count_pages(bytes, ctx)
    }

    fn extract_page(
        &self,
        bytes: &[u8],
        page_number: u32,
        ctx: &CallContext<'_>,
    ) -> Result<PageExtraction, DependencyError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.extract_failures) {
            return Err((self.error)(format!(
                "extraction of page {} failed",
                page_number
            )));
        }
        PlainTextProvider.extract_page(bytes, page_number, ctx)
    }
}
