//! Upload and processing API over the whole ingest system.
//!
//! `IngestService` owns one of each component, wired from a [`Config`]:
//! the database, the job queue with its merge-order gate, the document
//! pipeline, the chunk store, the resilience layer and, once started, the
//! worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::broadcast::{
    DocumentSnapshot, JobSnapshot, Notifier, OperatorNotification, ProgressBroadcaster,
    StatusFilter, Subscription,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::error::{ContractflowError, Result, UploadError};
use crate::mirror::{ClientJobMirror, MirrorFile};
use crate::pipeline::{Document, DocumentPipeline, NewDocument, SiblingOrderGate};
use crate::providers::{KeywordRuleExtractor, OcrProvider, PlainTextProvider, RuleExtractionProvider};
use crate::queue::{CancelOutcome, JobQueue, JobType, QueueError, QueueStats};
use crate::resilience::{BreakerSnapshot, ErrorPattern, ResilienceLayer};
use crate::upload::{ChunkResult, ChunkStorage, ChunkStore};
use crate::worker::{Executor, HandlerDeps, JobRun, WorkerPool};

/// External dependencies the workers call.
#[derive(Clone)]
pub struct Providers {
    pub ocr: Arc<dyn OcrProvider>,
    /// Without a rule provider no RULE_EXTRACTION handler is registered.
    pub rules: Option<Arc<dyn RuleExtractionProvider>>,
}

impl Providers {
    /// The built-in plain-text provider and default keyword rules.
    pub fn builtin() -> Self {
        Self {
            ocr: Arc::new(PlainTextProvider),
            rules: Some(Arc::new(KeywordRuleExtractor::with_default_rules())),
        }
    }
}

pub struct IngestService {
    config: Config,
    clock: Arc<dyn Clock>,
    queue: Arc<JobQueue>,
    pipeline: Arc<DocumentPipeline>,
    chunks: Arc<ChunkStore>,
    resilience: Arc<ResilienceLayer>,
    notifier: Notifier,
    executor: Arc<Executor>,
    pool: Option<WorkerPool>,
}

impl IngestService {
    /// Opens the on-disk database and wires the built-in providers.
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.database_path())?;
        Self::assemble(config, db, Arc::new(SystemClock), Providers::builtin())
    }

    /// Wires the service around an existing database, clock and providers.
    pub fn with_parts(
        config: Config,
        db: Database,
        clock: Arc<dyn Clock>,
        providers: Providers,
    ) -> Result<Self> {
        Self::assemble(config, db, clock, providers)
    }

    fn assemble(
        config: Config,
        db: Database,
        clock: Arc<dyn Clock>,
        providers: Providers,
    ) -> Result<Self> {
        let broadcaster = ProgressBroadcaster::new(db.clone(), config.broadcast.capacity);
        let notifier = Notifier::new(config.broadcast.capacity);

        let queue = Arc::new(JobQueue::new(
            db.clone(),
            Arc::clone(&clock),
            broadcaster,
            notifier.clone(),
            &config.queue,
            config.workers.lease_timeout(),
        ));
        queue.register_gate(
            JobType::DocumentMerge,
            Arc::new(SiblingOrderGate::new(db.clone())),
        );

        let pipeline = Arc::new(DocumentPipeline::new(
            db.clone(),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.pipeline.clone(),
        ));
        let chunks = Arc::new(ChunkStore::new(
            db,
            ChunkStorage::new(config.storage_directory()),
            Arc::clone(&clock),
        ));
        let resilience = Arc::new(ResilienceLayer::new(
            &config.resilience,
            Arc::clone(&clock),
            notifier.clone(),
        ));

        let rules = if config.pipeline.rule_extraction_enabled {
            providers.rules
        } else {
            None
        };
        let deps = HandlerDeps {
            pipeline: Arc::clone(&pipeline),
            chunks: Arc::clone(&chunks),
            resilience: Arc::clone(&resilience),
            ocr: providers.ocr,
            rules,
        };
        let executor = Arc::new(Executor::new(
            Arc::clone(&queue),
            deps.registry(),
            config.environment.exposes_error_detail(),
        ));

        log::info!(
            "Ingest service ready (environment={:?}, data_directory={})",
            config.environment,
            config.data_directory
        );

        Ok(Self {
            config,
            clock,
            queue,
            pipeline,
            chunks,
            resilience,
            notifier,
            executor,
            pool: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<DocumentPipeline> {
        &self.pipeline
    }

    pub fn chunks(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Starts the configured number of background workers. A second call is
    /// a no-op.
    pub fn start_workers(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        let pool = WorkerPool::start(Arc::clone(&self.executor), &self.config.workers)?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Stops the workers after their current jobs finish.
    pub fn stop_workers(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.wait();
        }
    }

    /// Runs eligible jobs on the calling thread until none is left.
    pub fn run_pending(&self, worker_id: &str) -> Result<Vec<JobRun>> {
        Ok(self.executor.drain(worker_id)?)
    }

    // Upload API

    /// Registers a document and prepares its chunk slots.
    pub fn initiate_upload(&self, new_doc: NewDocument) -> Result<Document> {
        let total_chunks = new_doc.total_chunks;
        let doc = self.pipeline.create_document(new_doc)?;
        self.chunks.init_upload(&doc.id, total_chunks)?;
        Ok(doc)
    }

    /// Stores one chunk. When it was the last one the document is assembled
    /// and its text extraction queued.
    pub fn upload_chunk(
        &self,
        document_id: &str,
        chunk_number: u32,
        bytes: &[u8],
        declared_hash: &str,
    ) -> Result<ChunkResult> {
        let stored = self
            .chunks
            .put_chunk(document_id, chunk_number, bytes, declared_hash);

        match &stored {
            Err(UploadError::DocumentNotFound(_)) => {}
            _ => self.pipeline.publish_document(document_id)?,
        }
        let result = stored?;

        if result.complete {
            let assembled = self.chunks.assemble(document_id)?;
            log::debug!(
                "Document {} assembled ({} bytes)",
                document_id,
                assembled.size
            );
            let job_id = self.pipeline.on_assembled(document_id)?;
            log::info!("Queued text extraction {} for document {}", job_id, document_id);
        }
        Ok(result)
    }

    pub fn missing_chunks(&self, document_id: &str) -> Result<Vec<u32>> {
        Ok(self.chunks.missing_chunks(document_id)?)
    }

    pub fn upload_status(&self, document_id: &str) -> Result<DocumentSnapshot> {
        if self.pipeline.find(document_id)?.is_none() {
            return Err(ContractflowError::DocumentNotFound(document_id.to_string()));
        }
        Ok(self.pipeline.document_snapshot(document_id)?)
    }

    /// Status by the caller's correlation id, for uploads made before a
    /// contract existed.
    pub fn upload_status_by_temp_id(&self, temp_id: &str) -> Result<Option<DocumentSnapshot>> {
        match self.pipeline.find_by_temp_id(temp_id)? {
            Some(doc) => Ok(Some(self.pipeline.document_snapshot(&doc.id)?)),
            None => Ok(None),
        }
    }

    pub fn retry_document(&self, document_id: &str) -> Result<Vec<String>> {
        Ok(self.pipeline.retry_document(document_id)?)
    }

    pub fn cancel_document(&self, document_id: &str) -> Result<Vec<CancelOutcome>> {
        Ok(self.pipeline.cancel_document(document_id)?)
    }

    pub fn delete_contract(&self, contract_id: &str) -> Result<Vec<String>> {
        Ok(self.pipeline.delete_contract(contract_id)?)
    }

    // Processing API

    pub fn job_status(&self, job_id: &str) -> Result<JobSnapshot> {
        self.queue
            .broadcaster()
            .query_status(job_id)
            .map_err(|e| match e {
                QueueError::NotFound(id) => ContractflowError::JobNotFound(id),
                other => other.into(),
            })
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome> {
        self.queue.cancel(job_id).map_err(|e| match e {
            QueueError::NotFound(id) => ContractflowError::JobNotFound(id),
            other => other.into(),
        })
    }

    pub fn subscribe(&self, filter: StatusFilter) -> Subscription {
        self.queue.broadcaster().subscribe(filter)
    }

    pub fn notifications(&self) -> broadcast::Receiver<OperatorNotification> {
        self.notifier.subscribe()
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats()?)
    }

    /// Flags terminal jobs older than `older_than` as archived.
    pub fn archive_finished(&self, older_than: Duration) -> Result<usize> {
        Ok(self.queue.archive_finished(older_than)?)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.resilience.breaker_snapshots()
    }

    pub fn error_patterns(&self) -> Vec<ErrorPattern> {
        self.resilience.error_patterns()
    }

    /// A client mirror using the configured grace period, persisted when a
    /// state file is configured.
    pub fn client_mirror(&self) -> ClientJobMirror {
        let grace = self.config.mirror.grace_period();
        match &self.config.mirror.state_file {
            Some(path) => {
                ClientJobMirror::persistent(Arc::clone(&self.clock), grace, MirrorFile::new(path))
            }
            None => ClientJobMirror::new(Arc::clone(&self.clock), grace),
        }
    }
}

impl Drop for IngestService {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
