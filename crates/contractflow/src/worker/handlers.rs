//! Handlers for the pipeline's job types.

use std::sync::Arc;

use serde_json::json;

use crate::error::UploadError;
use crate::pipeline::{DocumentPipeline, PageStatus};
use crate::providers::{OcrProvider, RuleExtractionProvider};
use crate::queue::{FailOutcome, Job, JobFailure, JobType};
use crate::resilience::{DependencyError, ErrorCategory, ResilienceLayer};
use crate::upload::{content_hash, ChunkStore};

use super::context::JobContext;
use super::handler::{HandlerError, HandlerRegistry, JobHandler};

pub const OCR_DEPENDENCY: &str = "ocr-provider";
pub const RULES_DEPENDENCY: &str = "rule-extraction-provider";
pub const STORAGE_DEPENDENCY: &str = "storage";

/// What every handler needs to reach the rest of the system.
#[derive(Clone)]
pub struct HandlerDeps {
    pub pipeline: Arc<DocumentPipeline>,
    pub chunks: Arc<ChunkStore>,
    pub resilience: Arc<ResilienceLayer>,
    pub ocr: Arc<dyn OcrProvider>,
    pub rules: Option<Arc<dyn RuleExtractionProvider>>,
}

impl HandlerDeps {
    /// Registers a handler for every job type these dependencies can serve.
    pub fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(TextExtractionHandler(self.clone())));
        registry.register(Arc::new(PageAnalysisHandler(self.clone())));
        registry.register(Arc::new(DocumentMergeHandler(self.clone())));
        registry.register(Arc::new(DocumentValidationHandler(self.clone())));
        if self.rules.is_some() {
            registry.register(Arc::new(RuleExtractionHandler(self.clone())));
        }
        registry
    }

    /// Reads the assembled document through the storage breaker.
    fn read_document(&self, ctx: &JobContext, document_id: &str) -> Result<(Vec<u8>, u32), HandlerError> {
        let outcome = self
            .resilience
            .call(STORAGE_DEPENDENCY, &ctx.cancel, |_| {
                self.chunks
                    .read_assembled(document_id)
                    .map_err(storage_dependency_error)
            })?;
        let retries = outcome.retries();
        Ok((outcome.value, retries))
    }
}

fn storage_dependency_error(e: UploadError) -> DependencyError {
    match e {
        UploadError::Storage { source, .. } => DependencyError::from(source),
        UploadError::Database(e) => DependencyError::database(e.to_string()),
        other => DependencyError::validation(other.to_string()),
    }
}

fn document_target(job: &Job) -> Result<&str, HandlerError> {
    match &job.entity {
        crate::queue::EntityRef::Document(id) => Ok(id),
        other => Err(HandlerError::validation(format!(
            "{} jobs target documents, not {}",
            job.job_type, other
        ))),
    }
}

fn page_target(job: &Job) -> Result<(&str, u32), HandlerError> {
    job.entity.as_page().ok_or_else(|| {
        HandlerError::validation(format!(
            "{} jobs target pages, not {}",
            job.job_type, job.entity
        ))
    })
}

fn stop_if_cancelled(ctx: &JobContext) -> Result<(), HandlerError> {
    if ctx.is_cancelled() {
        return Err(HandlerError::Cancelled);
    }
    Ok(())
}

/// Detects the page count and fans out one analysis job per page.
pub struct TextExtractionHandler(HandlerDeps);

impl JobHandler for TextExtractionHandler {
    fn job_type(&self) -> JobType {
        JobType::TextExtraction
    }

    fn handle(&self, ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
        let document_id = document_target(&ctx.job)?;
        ctx.report_progress(10, "reading document");
        let (bytes, storage_retries) = self.0.read_document(ctx, document_id)?;

        stop_if_cancelled(ctx)?;
        ctx.report_progress(40, "counting pages");
        let ocr = &self.0.ocr;
        let pages = self
            .0
            .resilience
            .call(OCR_DEPENDENCY, &ctx.cancel, |call| ocr.count_pages(&bytes, call))?;

        stop_if_cancelled(ctx)?;
        ctx.report_progress(80, "queueing page analysis");
        let page_jobs = self.0.pipeline.on_extraction_complete(document_id, pages.value)?;

        Ok(json!({
            "documentId": document_id,
            "pageCount": pages.value,
            "pageJobs": page_jobs,
            "provider": ocr.name(),
            "dependencyRetries": storage_retries + pages.retries(),
        }))
    }

    fn on_failed(&self, job: &Job, failure: &JobFailure, outcome: &FailOutcome) {
        if !outcome.is_terminal() {
            return;
        }
        let Some(document_id) = job.entity.document_id() else {
            return;
        };
        if let Err(e) = self.0.pipeline.fail_document(document_id, &failure.message) {
            log::warn!("Could not fail document {}: {}", document_id, e);
        }
    }
}

/// Extracts one page's text and features.
pub struct PageAnalysisHandler(HandlerDeps);

impl JobHandler for PageAnalysisHandler {
    fn job_type(&self) -> JobType {
        JobType::PageAnalysis
    }

    fn handle(&self, ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
        let (document_id, page_number) = page_target(&ctx.job)?;
        let page = self.0.pipeline.start_page(document_id, page_number)?;
        ctx.report_progress(10, "reading document");
        let (bytes, storage_retries) = self.0.read_document(ctx, document_id)?;

        stop_if_cancelled(ctx)?;
        ctx.report_progress(30, "extracting text");
        let ocr = &self.0.ocr;
        let extraction = self.0.resilience.call(OCR_DEPENDENCY, &ctx.cancel, |call| {
            ocr.extract_page(&bytes, page_number, call)
        })?;

        ctx.report_progress(90, "saving page");
        let saved = self
            .0
            .pipeline
            .complete_page(document_id, page_number, &extraction.value)?;

        Ok(json!({
            "documentId": document_id,
            "pageNumber": page_number,
            "attempt": page.attempt,
            "wordCount": saved.word_count,
            "confidence": saved.confidence,
            "features": saved.features,
            "dependencyRetries": storage_retries + extraction.retries(),
        }))
    }

    fn on_failed(&self, job: &Job, failure: &JobFailure, outcome: &FailOutcome) {
        let Some((document_id, page_number)) = job.entity.as_page() else {
            return;
        };
        let result = if outcome.is_terminal() {
            self.0
                .pipeline
                .fail_page(document_id, page_number, &failure.message)
        } else {
            self.0
                .pipeline
                .record_page_retry(document_id, page_number, &failure.message)
        };
        if let Err(e) = result {
            log::warn!(
                "Could not record failure of page {} of {}: {}",
                page_number,
                document_id,
                e
            );
        }
    }

    fn on_cancelled(&self, job: &Job) {
        let Some((document_id, page_number)) = job.entity.as_page() else {
            return;
        };
        if let Err(e) = self.0.pipeline.cancel_page(document_id, page_number) {
            log::warn!(
                "Could not cancel page {} of {}: {}",
                page_number,
                document_id,
                e
            );
        }
    }
}

/// Builds the merged text of a contract up to one document.
pub struct DocumentMergeHandler(HandlerDeps);

impl JobHandler for DocumentMergeHandler {
    fn job_type(&self) -> JobType {
        JobType::DocumentMerge
    }

    fn handle(&self, ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
        let document_id = document_target(&ctx.job)?;
        ctx.report_progress(20, "merging documents");
        let artifact = self.0.pipeline.merge(document_id)?;
        Ok(json!({
            "artifactId": artifact.id,
            "contractId": artifact.contract_id,
            "sourceDocuments": artifact.source_documents,
            "pageCount": artifact.page_count,
        }))
    }
}

/// Runs completed page text through the rule-extraction provider.
pub struct RuleExtractionHandler(HandlerDeps);

impl JobHandler for RuleExtractionHandler {
    fn job_type(&self) -> JobType {
        JobType::RuleExtraction
    }

    fn handle(&self, ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
        let document_id = document_target(&ctx.job)?;
        let Some(rules) = self.0.rules.as_ref() else {
            return Err(HandlerError::validation("no rule-extraction provider configured"));
        };

        let text = self
            .0
            .pipeline
            .pages(document_id)?
            .into_iter()
            .filter(|p| p.status == PageStatus::Completed)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n\n");

        ctx.report_progress(30, "extracting rules");
        let found = self.0.resilience.call(RULES_DEPENDENCY, &ctx.cancel, |call| {
            rules.extract_rules(&text, call)
        })?;

        Ok(json!({
            "documentId": document_id,
            "provider": rules.name(),
            "rules": found.value,
            "dependencyRetries": found.retries(),
        }))
    }
}

/// Re-hashes the assembled file against the hash recorded at assembly.
pub struct DocumentValidationHandler(HandlerDeps);

impl JobHandler for DocumentValidationHandler {
    fn job_type(&self) -> JobType {
        JobType::DocumentValidation
    }

    fn handle(&self, ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
        let document_id = document_target(&ctx.job)?;
        let doc = self.0.pipeline.get(document_id)?;
        let Some(expected) = doc.assembled_hash.clone() else {
            return Err(HandlerError::validation(format!(
                "document {} has not been assembled",
                document_id
            )));
        };

        let (bytes, storage_retries) = self.0.read_document(ctx, document_id)?;
        let actual = content_hash(&bytes);
        if actual != expected {
            return Err(HandlerError::Failed(
                JobFailure::new(
                    ErrorCategory::Integrity,
                    format!("assembled file of document {} no longer matches its hash", document_id),
                )
                .with_dependency(STORAGE_DEPENDENCY),
            ));
        }

        Ok(json!({
            "documentId": document_id,
            "valid": true,
            "size": bytes.len(),
            "hash": actual,
            "dependencyRetries": storage_retries,
        }))
    }
}
