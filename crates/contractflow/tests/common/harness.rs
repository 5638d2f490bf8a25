//! Test harness for isolated test execution.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use contractflow::db::Database;
use contractflow::pipeline::Document;
use contractflow::upload::content_hash;
use contractflow::worker::JobRun;
use contractflow::{Config, IngestService, ManualClock, NewDocument, Providers};

pub struct TestHarness {
    temp_dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub service: IngestService,
}

impl TestHarness {
    /// Default configuration and the built-in providers.
    pub fn new() -> Self {
        Self::with(|_| {}, Providers::builtin())
    }

    pub fn with(configure: impl FnOnce(&mut Config), providers: Providers) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = Config::with_data_directory(temp_dir.path().to_string_lossy().to_string());
        config.workers.count = 1;
        configure(&mut config);

        let db = Database::open(&config.database_path()).expect("Failed to open database");
        let clock = Arc::new(ManualClock::default());
        let service = IngestService::with_parts(config, db, clock.clone(), providers)
            .expect("Failed to build service");

        Self {
            temp_dir,
            clock,
            service,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Registers a document for `content` split into `chunks` parts.
    pub fn register(&self, mut new_doc: NewDocument, content: &[u8], chunks: u32) -> Document {
        new_doc.file_size = content.len() as u64;
        new_doc.total_chunks = chunks;
        self.service
            .initiate_upload(new_doc)
            .expect("Failed to initiate upload")
    }

    /// Registers and fully uploads a document.
    pub fn upload(&self, new_doc: NewDocument, content: &[u8], chunks: u32) -> Document {
        let doc = self.register(new_doc, content, chunks);
        for (number, part) in split(content, chunks).into_iter().enumerate() {
            self.service
                .upload_chunk(&doc.id, number as u32, part, &content_hash(part))
                .expect("Failed to upload chunk");
        }
        doc
    }

    pub fn upload_text(&self, filename: &str, text: &str) -> Document {
        self.upload(NewDocument::new(filename, 0, 1), text.as_bytes(), 1)
    }

    /// Runs every job that is due now.
    pub fn run(&self) -> Vec<JobRun> {
        self.service.run_pending("harness").expect("Failed to run jobs")
    }

    /// Alternates running due jobs and moving the clock forward, so scheduled
    /// retries become due, until a round runs nothing.
    pub fn run_to_quiescence(&self, step: Duration) -> Vec<JobRun> {
        let mut all = Vec::new();
        loop {
            let runs = self.run();
            if runs.is_empty() {
                self.clock.advance(step);
                let after = self.run();
                if after.is_empty() {
                    return all;
                }
                all.extend(after);
            } else {
                all.extend(runs);
            }
        }
    }
}

/// Splits `content` into `chunks` contiguous parts; the last one may be shorter.
pub fn split(content: &[u8], chunks: u32) -> Vec<&[u8]> {
    let size = content.len().div_ceil(chunks as usize).max(1);
    content.chunks(size).collect()
}
