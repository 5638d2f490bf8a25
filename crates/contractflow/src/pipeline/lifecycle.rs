use std::sync::Arc;

use crate::broadcast::{DocumentSnapshot, ProgressBroadcaster};
use crate::clock::{format_timestamp, Clock};
use crate::config::schema::PipelineSettings;
use crate::db::artifact_repo::{self, MergeArtifactRow};
use crate::db::document_repo::{self, DocumentRow};
use crate::db::{page_repo, to_json, Database};
use crate::queue::{CancelOutcome, EntityRef, JobQueue, JobStatus, JobType, NewJob};

use super::document::{Document, MergeArtifact, NewDocument, Page, PageAttempt, PageExtraction};
use super::error::PipelineError;
use super::gate::lower_siblings_terminal;
use super::state::{PageStatus, ProcessingStatus, UploadStatus};

/// Owns the document and page state machines and turns stage completions
/// into the next jobs.
pub struct DocumentPipeline {
    db: Database,
    queue: Arc<JobQueue>,
    broadcaster: ProgressBroadcaster,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl DocumentPipeline {
    pub fn new(
        db: Database,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        let broadcaster = queue.broadcaster().clone();
        Self {
            db,
            queue,
            broadcaster,
            clock,
            settings,
        }
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    pub fn create_document(&self, new_doc: NewDocument) -> Result<Document, PipelineError> {
        if new_doc.filename.trim().is_empty() {
            return Err(PipelineError::Validation("filename is required".to_string()));
        }
        if new_doc.total_chunks == 0 {
            return Err(PipelineError::Validation(
                "total chunk count must be at least 1".to_string(),
            ));
        }
        if new_doc.file_size < u64::from(new_doc.total_chunks) {
            return Err(PipelineError::Validation(format!(
                "{} chunks cannot make up a {} byte file",
                new_doc.total_chunks, new_doc.file_size
            )));
        }
        if new_doc.sequence_order < 0 {
            return Err(PipelineError::Validation(
                "sequence order must not be negative".to_string(),
            ));
        }
        if let Some(parent_id) = new_doc.parent_id.as_deref() {
            if document_repo::find_by_id(&self.db, parent_id)?.is_none() {
                return Err(PipelineError::Validation(format!(
                    "parent document {} does not exist",
                    parent_id
                )));
            }
        }

        let now = self.now();
        let row = DocumentRow {
            id: uuid::Uuid::new_v4().to_string(),
            contract_id: new_doc.contract_id,
            parent_id: new_doc.parent_id,
            temp_id: new_doc.temp_id,
            mime_type: new_doc.mime_type.or_else(|| {
                mime_guess::from_path(&new_doc.filename)
                    .first()
                    .map(|m| m.essence_str().to_string())
            }),
            filename: new_doc.filename,
            document_type: new_doc.document_type.as_str().to_string(),
            sequence_order: i64::from(new_doc.sequence_order),
            file_size: i64::try_from(new_doc.file_size)
                .map_err(|_| PipelineError::Validation("file too large".to_string()))?,
            upload_status: UploadStatus::Pending.as_str().to_string(),
            processing_status: ProcessingStatus::Uploading.as_str().to_string(),
            retry_count: 0,
            total_pages: None,
            total_words: None,
            total_chunks: i64::from(new_doc.total_chunks),
            chunks_uploaded: 0,
            assembled_path: None,
            assembled_size: None,
            assembled_hash: None,
            upload_started_at: now.clone(),
            upload_completed_at: None,
            extraction_started_at: None,
            extraction_completed_at: None,
            error: None,
            metadata: to_json("metadata", &new_doc.metadata)?,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        };
        document_repo::insert(&self.db, &row)?;
        log::info!("Registered document {} ({} chunks)", row.id, row.total_chunks);
        self.publish_document(&row.id)?;
        Ok(Document::from_row(&row))
    }

    pub fn find(&self, document_id: &str) -> Result<Option<Document>, PipelineError> {
        Ok(document_repo::find_by_id(&self.db, document_id)?.map(|row| Document::from_row(&row)))
    }

    pub fn get(&self, document_id: &str) -> Result<Document, PipelineError> {
        self.find(document_id)?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))
    }

    fn get_row(&self, document_id: &str) -> Result<DocumentRow, PipelineError> {
        document_repo::find_by_id(&self.db, document_id)?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))
    }

    pub fn find_by_temp_id(&self, temp_id: &str) -> Result<Option<Document>, PipelineError> {
        Ok(document_repo::find_by_temp_id(&self.db, temp_id)?.map(|row| Document::from_row(&row)))
    }

    pub fn documents_for_contract(&self, contract_id: &str) -> Result<Vec<Document>, PipelineError> {
        Ok(document_repo::list_for_contract(&self.db, contract_id)?
            .iter()
            .map(Document::from_row)
            .collect())
    }

    pub fn document_snapshot(&self, document_id: &str) -> Result<DocumentSnapshot, PipelineError> {
        let doc = self.get(document_id)?;
        let tally = page_repo::tally(&self.db, document_id)?;
        Ok(DocumentSnapshot {
            document_id: doc.id,
            contract_id: doc.contract_id,
            temp_id: doc.temp_id,
            filename: doc.filename,
            document_type: doc.document_type,
            sequence_order: doc.sequence_order,
            upload_status: doc.upload_status,
            processing_status: doc.processing_status,
            total_chunks: doc.total_chunks,
            chunks_uploaded: doc.chunks_uploaded,
            page_count: doc.total_pages.unwrap_or(0),
            pages_completed: tally.completed,
            pages_failed: tally.failed,
            word_count: u64::try_from(tally.words).unwrap_or(0),
            error: doc.error,
            updated_at: doc.updated_at,
        })
    }

    pub fn publish_document(&self, document_id: &str) -> Result<(), PipelineError> {
        let snapshot = self.document_snapshot(document_id)?;
        self.broadcaster.publish_document(snapshot);
        Ok(())
    }

    /// Moves an assembled document into PROCESSING and queues its text
    /// extraction. Calling it again returns the job already queued.
    pub fn on_assembled(&self, document_id: &str) -> Result<String, PipelineError> {
        let mut row = self.get_row(document_id)?;
        let doc = Document::from_row(&row);
        if !doc.is_upload_complete() {
            return Err(PipelineError::UploadIncomplete(document_id.to_string()));
        }

        let now = self.now();
        let moved = document_repo::compare_and_set_status(
            &self.db,
            document_id,
            ProcessingStatus::Uploading.as_str(),
            ProcessingStatus::Processing.as_str(),
            None,
            &now,
        )?;
        if !moved {
            let existing = self
                .queue
                .jobs_for_entity(&EntityRef::Document(document_id.to_string()))?
                .into_iter()
                .rev()
                .find(|j| j.job_type == JobType::TextExtraction);
            return match existing {
                Some(job) => Ok(job.id),
                None => Err(PipelineError::InvalidTransition {
                    document_id: document_id.to_string(),
                    from: doc.processing_status,
                    to: ProcessingStatus::Processing,
                }),
            };
        }

        row = self.get_row(document_id)?;
        row.extraction_started_at = Some(now.clone());
        row.updated_at = now;
        document_repo::update_processing(&self.db, &row)?;

        let job_id = self.enqueue_extraction(document_id)?;
        self.publish_document(document_id)?;
        Ok(job_id)
    }

    fn enqueue_extraction(&self, document_id: &str) -> Result<String, PipelineError> {
        Ok(self.queue.enqueue(
            NewJob::new(
                JobType::TextExtraction,
                EntityRef::Document(document_id.to_string()),
            )
            .priority(self.settings.extraction_priority),
        )?)
    }

    fn enqueue_page_analysis(&self, document_id: &str, page_number: u32) -> Result<String, PipelineError> {
        Ok(self.queue.enqueue(
            NewJob::new(JobType::PageAnalysis, EntityRef::page(document_id, page_number))
                .priority(self.settings.analysis_priority),
        )?)
    }

    /// Records the detected page count and queues one analysis job per page.
    ///
    /// Safe to repeat for the same document: pages that already have an
    /// analysis job keep it, and the returned ids cover every page either way.
    pub fn on_extraction_complete(
        &self,
        document_id: &str,
        page_count: u32,
    ) -> Result<Vec<String>, PipelineError> {
        let mut row = self.get_row(document_id)?;
        let status = ProcessingStatus::parse(&row.processing_status, &row.id);
        if status != ProcessingStatus::Processing {
            return Err(PipelineError::InvalidTransition {
                document_id: document_id.to_string(),
                from: status,
                to: ProcessingStatus::Processing,
            });
        }

        let now = self.now();
        row.total_pages = Some(i64::from(page_count));
        row.updated_at = now.clone();
        document_repo::update_processing(&self.db, &row)?;

        let placeholders: Vec<(String, i64)> = (1..=page_count)
            .map(|n| (uuid::Uuid::new_v4().to_string(), i64::from(n)))
            .collect();
        page_repo::insert_pending(&self.db, document_id, &placeholders, &now)?;

        let existing = self.queue.page_jobs_for_document(document_id)?;
        let mut jobs = Vec::with_capacity(placeholders.len());
        let mut queued = 0usize;
        for page_number in 1..=page_count {
            let entity = EntityRef::page(document_id, page_number);
            let current = existing.iter().find(|job| {
                job.job_type == JobType::PageAnalysis
                    && job.entity == entity
                    && job.status != JobStatus::Cancelled
            });
            match current {
                Some(job) => jobs.push(job.id.clone()),
                None => {
                    jobs.push(self.enqueue_page_analysis(document_id, page_number)?);
                    queued += 1;
                }
            }
        }
        log::info!(
            "Document {} has {} pages, queued {} analysis jobs",
            document_id,
            page_count,
            queued
        );
        self.publish_document(document_id)?;
        if page_count == 0 {
            self.try_finalize(document_id)?;
        }
        Ok(jobs)
    }

    /// Marks a page as being processed. Re-analysing a completed page moves
    /// its previous result into history under a new attempt number.
    pub fn start_page(&self, document_id: &str, page_number: u32) -> Result<Page, PipelineError> {
        self.get_row(document_id)?;
        let row = page_repo::begin_attempt(
            &self.db,
            &uuid::Uuid::new_v4().to_string(),
            document_id,
            i64::from(page_number),
            &self.now(),
        )?;
        Ok(Page::from_row(&row))
    }

    pub fn complete_page(
        &self,
        document_id: &str,
        page_number: u32,
        extraction: &PageExtraction,
    ) -> Result<Page, PipelineError> {
        let mut row = page_repo::find(&self.db, document_id, i64::from(page_number))?.ok_or_else(
            || PipelineError::PageNotFound {
                document_id: document_id.to_string(),
                page_number,
            },
        )?;
        let now = self.now();
        row.status = PageStatus::Completed.as_str().to_string();
        row.text = Some(extraction.text.clone());
        row.confidence = extraction.confidence;
        row.word_count = i64::from(extraction.word_count());
        row.char_count = i64::from(extraction.char_count());
        row.has_table = extraction.features.has_table;
        row.has_image = extraction.features.has_image;
        row.has_signature = extraction.features.has_signature;
        row.error = None;
        row.completed_at = Some(now.clone());
        row.updated_at = now;
        page_repo::complete(&self.db, &row)?;

        self.publish_document(document_id)?;
        self.try_finalize(document_id)?;
        Ok(Page::from_row(&row))
    }

    /// A page attempt failed but its job will be retried.
    pub fn record_page_retry(
        &self,
        document_id: &str,
        page_number: u32,
        error: &str,
    ) -> Result<(), PipelineError> {
        page_repo::set_status(
            &self.db,
            document_id,
            i64::from(page_number),
            PageStatus::Pending.as_str(),
            Some(error),
            &self.now(),
        )?;
        self.publish_document(document_id)
    }

    /// A page failed for good; sibling pages are unaffected.
    pub fn fail_page(
        &self,
        document_id: &str,
        page_number: u32,
        error: &str,
    ) -> Result<(), PipelineError> {
        self.finish_page(document_id, page_number, PageStatus::Failed, Some(error))
    }

    pub fn cancel_page(&self, document_id: &str, page_number: u32) -> Result<(), PipelineError> {
        self.finish_page(document_id, page_number, PageStatus::Cancelled, None)
    }

    fn finish_page(
        &self,
        document_id: &str,
        page_number: u32,
        status: PageStatus,
        error: Option<&str>,
    ) -> Result<(), PipelineError> {
        page_repo::set_status(
            &self.db,
            document_id,
            i64::from(page_number),
            status.as_str(),
            error,
            &self.now(),
        )?;
        self.publish_document(document_id)?;
        self.try_finalize(document_id)?;
        Ok(())
    }

    /// Settles a PROCESSING document once every page is terminal.
    ///
    /// Any page that did not complete makes the document FAILED; completed
    /// pages keep their text either way. Only the caller that wins the
    /// status change chains the follow-up jobs.
    pub fn try_finalize(&self, document_id: &str) -> Result<Option<ProcessingStatus>, PipelineError> {
        let mut row = self.get_row(document_id)?;
        let Some(total_pages) = row.total_pages else {
            return Ok(None);
        };
        if ProcessingStatus::parse(&row.processing_status, &row.id) != ProcessingStatus::Processing {
            return Ok(None);
        }

        let pages: Vec<Page> = page_repo::list_for_document(&self.db, document_id)?
            .iter()
            .map(Page::from_row)
            .collect();
        let expected = usize::try_from(total_pages).unwrap_or(0);
        if pages.len() < expected || pages.iter().any(|p| !p.status.is_terminal()) {
            return Ok(None);
        }

        let unfinished = pages
            .iter()
            .filter(|p| p.status != PageStatus::Completed)
            .count();
        let (status, error) = if unfinished == 0 {
            (ProcessingStatus::Completed, None)
        } else {
            (
                ProcessingStatus::Failed,
                Some(format!("{} of {} pages failed", unfinished, pages.len())),
            )
        };

        let now = self.now();
        let won = document_repo::compare_and_set_status(
            &self.db,
            document_id,
            ProcessingStatus::Processing.as_str(),
            status.as_str(),
            error.as_deref(),
            &now,
        )?;
        if !won {
            return Ok(None);
        }

        row = self.get_row(document_id)?;
        row.total_words = Some(
            pages
                .iter()
                .filter(|p| p.status == PageStatus::Completed)
                .map(|p| i64::from(p.word_count))
                .sum(),
        );
        row.extraction_completed_at = Some(now.clone());
        row.updated_at = now;
        document_repo::update_processing(&self.db, &row)?;
        log::info!("Document {} finished processing: {}", document_id, status);

        if status == ProcessingStatus::Completed && self.settings.rule_extraction_enabled {
            self.queue.enqueue(
                NewJob::new(
                    JobType::RuleExtraction,
                    EntityRef::Document(document_id.to_string()),
                )
                .priority(self.settings.rule_extraction_priority),
            )?;
        }
        self.enqueue_merge_if_needed(&Document::from_row(&row))?;
        self.publish_document(document_id)?;
        Ok(Some(status))
    }

    fn enqueue_merge_if_needed(&self, doc: &Document) -> Result<(), PipelineError> {
        let Some(contract_id) = doc.contract_id.as_deref() else {
            return Ok(());
        };
        if document_repo::list_for_contract(&self.db, contract_id)?.len() < 2 {
            return Ok(());
        }
        self.queue.enqueue(
            NewJob::new(JobType::DocumentMerge, EntityRef::Document(doc.id.clone()))
                .priority(self.settings.merge_priority),
        )?;
        Ok(())
    }

    /// Fails a document outright, e.g. when its extraction job gave up.
    pub fn fail_document(&self, document_id: &str, error: &str) -> Result<(), PipelineError> {
        let doc = self.get(document_id)?;
        let from = doc.processing_status;
        if !from.can_transition(ProcessingStatus::Failed) {
            return Err(PipelineError::InvalidTransition {
                document_id: document_id.to_string(),
                from,
                to: ProcessingStatus::Failed,
            });
        }
        let won = document_repo::compare_and_set_status(
            &self.db,
            document_id,
            from.as_str(),
            ProcessingStatus::Failed.as_str(),
            Some(error),
            &self.now(),
        )?;
        if won {
            log::warn!("Document {} failed: {}", document_id, error);
            self.publish_document(document_id)?;
        }
        Ok(())
    }

    /// Gives a FAILED document another pass: pages that did not complete are
    /// queued again, or the whole extraction if it never produced pages.
    pub fn retry_document(&self, document_id: &str) -> Result<Vec<String>, PipelineError> {
        let mut row = self.get_row(document_id)?;
        let from = ProcessingStatus::parse(&row.processing_status, &row.id);
        if !from.can_transition(ProcessingStatus::Retrying) {
            return Err(PipelineError::InvalidTransition {
                document_id: document_id.to_string(),
                from,
                to: ProcessingStatus::Retrying,
            });
        }
        let retries = u32::try_from(row.retry_count).unwrap_or(u32::MAX);
        if retries >= self.settings.max_document_retries {
            return Err(PipelineError::RetriesExhausted {
                document_id: document_id.to_string(),
                retries,
            });
        }

        let now = self.now();
        if !document_repo::compare_and_set_status(
            &self.db,
            document_id,
            ProcessingStatus::Failed.as_str(),
            ProcessingStatus::Retrying.as_str(),
            None,
            &now,
        )? {
            return Err(PipelineError::InvalidTransition {
                document_id: document_id.to_string(),
                from: self.get(document_id)?.processing_status,
                to: ProcessingStatus::Retrying,
            });
        }
        self.publish_document(document_id)?;

        row.retry_count += 1;
        row.processing_status = ProcessingStatus::Processing.as_str().to_string();
        row.error = None;
        row.extraction_completed_at = None;
        row.updated_at = now.clone();
        document_repo::update_processing(&self.db, &row)?;

        let mut jobs = Vec::new();
        if row.total_pages.is_none() {
            jobs.push(self.enqueue_extraction(document_id)?);
        } else {
            for page in page_repo::list_for_document(&self.db, document_id)? {
                if page.status == PageStatus::Completed.as_str() {
                    continue;
                }
                page_repo::set_status(
                    &self.db,
                    document_id,
                    page.page_number,
                    PageStatus::Pending.as_str(),
                    None,
                    &now,
                )?;
                let page_number = u32::try_from(page.page_number).unwrap_or(0);
                jobs.push(self.enqueue_page_analysis(document_id, page_number)?);
            }
        }
        log::info!(
            "Retrying document {} (retry {}), queued {} jobs",
            document_id,
            row.retry_count,
            jobs.len()
        );
        self.publish_document(document_id)?;
        if jobs.is_empty() {
            self.try_finalize(document_id)?;
        }
        Ok(jobs)
    }

    /// Cancels a document and every job still outstanding on it or its pages.
    pub fn cancel_document(&self, document_id: &str) -> Result<Vec<CancelOutcome>, PipelineError> {
        let doc = self.get(document_id)?;
        let from = doc.processing_status;
        if !from.can_transition(ProcessingStatus::Cancelled) {
            return Err(PipelineError::InvalidTransition {
                document_id: document_id.to_string(),
                from,
                to: ProcessingStatus::Cancelled,
            });
        }
        document_repo::compare_and_set_status(
            &self.db,
            document_id,
            from.as_str(),
            ProcessingStatus::Cancelled.as_str(),
            None,
            &self.now(),
        )?;
        let outcomes = self.cancel_jobs(document_id)?;

        let now = self.now();
        for page in page_repo::list_for_document(&self.db, document_id)? {
            if page.status == PageStatus::Pending.as_str() {
                page_repo::set_status(
                    &self.db,
                    document_id,
                    page.page_number,
                    PageStatus::Cancelled.as_str(),
                    None,
                    &now,
                )?;
            }
        }
        log::info!("Document {} cancelled", document_id);
        self.publish_document(document_id)?;
        Ok(outcomes)
    }

    fn cancel_jobs(&self, document_id: &str) -> Result<Vec<CancelOutcome>, PipelineError> {
        let mut jobs = self
            .queue
            .jobs_for_entity(&EntityRef::Document(document_id.to_string()))?;
        jobs.extend(self.queue.page_jobs_for_document(document_id)?);

        let mut outcomes = Vec::new();
        for job in jobs.iter().filter(|j| !j.status.is_terminal()) {
            outcomes.push(self.queue.cancel(&job.id)?);
        }
        Ok(outcomes)
    }

    /// Logically deletes every document of a contract after cancelling
    /// their outstanding jobs. Returns the deleted document ids.
    pub fn delete_contract(&self, contract_id: &str) -> Result<Vec<String>, PipelineError> {
        for row in document_repo::list_for_contract(&self.db, contract_id)? {
            self.cancel_jobs(&row.id)?;
        }
        let deleted = document_repo::mark_deleted_for_contract(&self.db, contract_id, &self.now())?;
        log::info!(
            "Deleted contract {}: {} documents",
            contract_id,
            deleted.len()
        );
        Ok(deleted)
    }

    /// Builds the merge artifact for a document: completed page text of the
    /// contract's documents up to this one, in sequence order.
    pub fn merge(&self, document_id: &str) -> Result<MergeArtifact, PipelineError> {
        let doc = self.get(document_id)?;
        let Some(contract_id) = doc.contract_id.clone() else {
            return Err(PipelineError::Validation(format!(
                "document {} does not belong to a contract",
                document_id
            )));
        };
        if !lower_siblings_terminal(&self.db, &doc)? {
            return Err(PipelineError::MergeNotReady(document_id.to_string()));
        }

        let sources: Vec<Document> = document_repo::list_for_contract(&self.db, &contract_id)?
            .iter()
            .map(Document::from_row)
            .filter(|d| d.sequence_order <= doc.sequence_order)
            .collect();

        let mut sections = Vec::new();
        let mut page_count = 0u32;
        for source in &sources {
            for page in page_repo::list_for_document(&self.db, &source.id)? {
                if page.status != PageStatus::Completed.as_str() {
                    continue;
                }
                if let Some(text) = page.text {
                    sections.push(text);
                    page_count += 1;
                }
            }
        }

        let source_ids: Vec<String> = sources.iter().map(|d| d.id.clone()).collect();
        let row = MergeArtifactRow {
            id: uuid::Uuid::new_v4().to_string(),
            contract_id,
            document_id: document_id.to_string(),
            sequence_order: i64::from(doc.sequence_order),
            source_documents: to_json("source_documents", &source_ids)?,
            page_count: i64::from(page_count),
            text: sections.join("\n\n"),
            created_at: self.now(),
        };
        artifact_repo::insert(&self.db, &row)?;
        log::info!(
            "Merged {} documents ({} pages) up to document {}",
            source_ids.len(),
            page_count,
            document_id
        );
        Ok(MergeArtifact::from_row(&row))
    }

    pub fn pages(&self, document_id: &str) -> Result<Vec<Page>, PipelineError> {
        Ok(page_repo::list_for_document(&self.db, document_id)?
            .iter()
            .map(Page::from_row)
            .collect())
    }

    pub fn page_history(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Vec<PageAttempt>, PipelineError> {
        Ok(page_repo::history(&self.db, document_id, i64::from(page_number))?
            .iter()
            .map(PageAttempt::from_row)
            .collect())
    }

    pub fn merge_artifact(&self, document_id: &str) -> Result<Option<MergeArtifact>, PipelineError> {
        Ok(artifact_repo::latest_for_document(&self.db, document_id)?
            .map(|row| MergeArtifact::from_row(&row)))
    }
}
