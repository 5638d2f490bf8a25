//! Document, page and merge artifact models.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{parse_optional_timestamp, parse_timestamp};
use crate::db::artifact_repo::MergeArtifactRow;
use crate::db::document_repo::DocumentRow;
use crate::db::page_repo::{PageHistoryRow, PageRow};

use super::state::{DocumentType, PageStatus, ProcessingStatus, UploadStatus};

fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v.max(0)).unwrap_or(0)
}

/// Request to register a document before its chunks are uploaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    pub filename: String,
    pub file_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Caller-chosen correlation id, usable before a contract exists.
    #[serde(default)]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub document_type: DocumentType,
    #[serde(default)]
    pub sequence_order: i32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewDocument {
    pub fn new(filename: impl Into<String>, file_size: u64, total_chunks: u32) -> Self {
        Self {
            filename: filename.into(),
            file_size,
            total_chunks,
            ..Default::default()
        }
    }

    pub fn contract(mut self, contract_id: impl Into<String>, sequence_order: i32) -> Self {
        self.contract_id = Some(contract_id.into());
        self.sequence_order = sequence_order;
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }

    pub fn document_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = document_type;
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub contract_id: Option<String>,
    pub parent_id: Option<String>,
    pub temp_id: Option<String>,
    pub filename: String,
    pub mime_type: Option<String>,
    pub document_type: DocumentType,
    pub sequence_order: i32,
    pub file_size: u64,
    pub upload_status: UploadStatus,
    pub processing_status: ProcessingStatus,
    pub retry_count: u32,
    pub total_pages: Option<u32>,
    pub total_words: Option<u64>,
    pub total_chunks: u32,
    pub chunks_uploaded: u32,
    #[serde(skip)]
    pub assembled_path: Option<PathBuf>,
    pub assembled_size: Option<u64>,
    pub assembled_hash: Option<String>,
    pub upload_started_at: DateTime<Utc>,
    pub upload_completed_at: Option<DateTime<Utc>>,
    pub extraction_started_at: Option<DateTime<Utc>>,
    pub extraction_completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn from_row(row: &DocumentRow) -> Self {
        let metadata = serde_json::from_str(&row.metadata).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable metadata on document {}: {}", row.id, e);
            serde_json::Map::new()
        });
        Self {
            id: row.id.clone(),
            contract_id: row.contract_id.clone(),
            parent_id: row.parent_id.clone(),
            temp_id: row.temp_id.clone(),
            filename: row.filename.clone(),
            mime_type: row.mime_type.clone(),
            document_type: DocumentType::parse(&row.document_type),
            sequence_order: i32::try_from(row.sequence_order).unwrap_or(i32::MAX),
            file_size: to_u64(row.file_size),
            upload_status: UploadStatus::parse(&row.upload_status, &row.id),
            processing_status: ProcessingStatus::parse(&row.processing_status, &row.id),
            retry_count: to_u32(row.retry_count),
            total_pages: row.total_pages.map(to_u32),
            total_words: row.total_words.map(to_u64),
            total_chunks: to_u32(row.total_chunks),
            chunks_uploaded: to_u32(row.chunks_uploaded),
            assembled_path: row.assembled_path.as_ref().map(PathBuf::from),
            assembled_size: row.assembled_size.map(to_u64),
            assembled_hash: row.assembled_hash.clone(),
            upload_started_at: parse_timestamp(&row.upload_started_at),
            upload_completed_at: parse_optional_timestamp(row.upload_completed_at.as_deref()),
            extraction_started_at: parse_optional_timestamp(row.extraction_started_at.as_deref()),
            extraction_completed_at: parse_optional_timestamp(
                row.extraction_completed_at.as_deref(),
            ),
            error: row.error.clone(),
            metadata,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }

    pub fn is_upload_complete(&self) -> bool {
        self.upload_status == UploadStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFeatures {
    pub has_table: bool,
    pub has_image: bool,
    pub has_signature: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub document_id: String,
    pub page_number: u32,
    /// Starts at 1; bumped each time a completed page is re-analysed.
    pub attempt: u32,
    pub status: PageStatus,
    pub text: Option<String>,
    pub confidence: Option<f64>,
    pub word_count: u32,
    pub char_count: u32,
    pub features: PageFeatures,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Page {
    pub fn from_row(row: &PageRow) -> Self {
        Self {
            id: row.id.clone(),
            document_id: row.document_id.clone(),
            page_number: to_u32(row.page_number),
            attempt: to_u32(row.attempt),
            status: PageStatus::parse(&row.status),
            text: row.text.clone(),
            confidence: row.confidence,
            word_count: to_u32(row.word_count),
            char_count: to_u32(row.char_count),
            features: PageFeatures {
                has_table: row.has_table,
                has_image: row.has_image,
                has_signature: row.has_signature,
            },
            error: row.error.clone(),
            started_at: parse_optional_timestamp(row.started_at.as_deref()),
            completed_at: parse_optional_timestamp(row.completed_at.as_deref()),
        }
    }
}

/// An earlier result of a page that was re-analysed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAttempt {
    pub page_number: u32,
    pub attempt: u32,
    pub status: PageStatus,
    pub text: Option<String>,
    pub confidence: Option<f64>,
    pub word_count: u32,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub superseded_at: DateTime<Utc>,
}

impl PageAttempt {
    pub fn from_row(row: &PageHistoryRow) -> Self {
        Self {
            page_number: to_u32(row.page_number),
            attempt: to_u32(row.attempt),
            status: PageStatus::parse(&row.status),
            text: row.text.clone(),
            confidence: row.confidence,
            word_count: to_u32(row.word_count),
            error: row.error.clone(),
            completed_at: parse_optional_timestamp(row.completed_at.as_deref()),
            superseded_at: parse_timestamp(&row.superseded_at),
        }
    }
}

/// Concatenated text of a contract's documents up to and including one
/// sequence position. Stored on its own; sources are never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeArtifact {
    pub id: String,
    pub contract_id: String,
    pub document_id: String,
    pub sequence_order: i32,
    pub source_documents: Vec<String>,
    pub page_count: u32,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl MergeArtifact {
    pub fn from_row(row: &MergeArtifactRow) -> Self {
        let source_documents = serde_json::from_str(&row.source_documents).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable source list on artifact {}: {}", row.id, e);
            Vec::new()
        });
        Self {
            id: row.id.clone(),
            contract_id: row.contract_id.clone(),
            document_id: row.document_id.clone(),
            sequence_order: i32::try_from(row.sequence_order).unwrap_or(i32::MAX),
            source_documents,
            page_count: to_u32(row.page_count),
            text: row.text.clone(),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

/// What the text-extraction provider reports for one page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageExtraction {
    pub text: String,
    pub confidence: Option<f64>,
    pub features: PageFeatures,
}

impl PageExtraction {
    pub fn word_count(&self) -> u32 {
        u32::try_from(self.text.split_whitespace().count()).unwrap_or(u32::MAX)
    }

    pub fn char_count(&self) -> u32 {
        u32::try_from(self.text.chars().count()).unwrap_or(u32::MAX)
    }
}
