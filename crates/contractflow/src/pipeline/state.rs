//! Document and page state machines.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str, document_id: &str) -> Self {
        match s {
            "pending" => UploadStatus::Pending,
            "uploading" => UploadStatus::Uploading,
            "completed" => UploadStatus::Completed,
            "failed" => UploadStatus::Failed,
            other => {
                log::warn!(
                    "Unknown upload status '{}' for document {}, treating as failed",
                    other,
                    document_id
                );
                UploadStatus::Failed
            }
        }
    }
}

/// Processing status of a whole document.
///
/// ```text
/// UPLOADING -> PROCESSING -> COMPLETED
///                         -> FAILED -> RETRYING -> PROCESSING
/// any non-terminal state  -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Uploading => "uploading",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Cancelled => "cancelled",
            ProcessingStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str, document_id: &str) -> Self {
        match s {
            "uploading" => ProcessingStatus::Uploading,
            "processing" => ProcessingStatus::Processing,
            "completed" => ProcessingStatus::Completed,
            "failed" => ProcessingStatus::Failed,
            "cancelled" => ProcessingStatus::Cancelled,
            "retrying" => ProcessingStatus::Retrying,
            other => {
                log::warn!(
                    "Unknown processing status '{}' for document {}, treating as failed",
                    other,
                    document_id
                );
                ProcessingStatus::Failed
            }
        }
    }

    /// FAILED counts as terminal for merge ordering even though a document
    /// retry can still move it on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Failed | ProcessingStatus::Cancelled
        )
    }

    pub fn can_transition(&self, to: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, to),
            (Uploading, Processing)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Retrying)
                | (Retrying, Processing)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Processing => "processing",
            PageStatus::Completed => "completed",
            PageStatus::Failed => "failed",
            PageStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => PageStatus::Pending,
            "processing" => PageStatus::Processing,
            "completed" => PageStatus::Completed,
            "failed" => PageStatus::Failed,
            "cancelled" => PageStatus::Cancelled,
            other => {
                log::warn!("Unknown page status '{}', treating as failed", other);
                PageStatus::Failed
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PageStatus::Completed | PageStatus::Failed | PageStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[default]
    Primary,
    Appendix,
    Amendment,
    Exhibit,
    Addendum,
    Signature,
    CoverLetter,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Primary => "primary",
            DocumentType::Appendix => "appendix",
            DocumentType::Amendment => "amendment",
            DocumentType::Exhibit => "exhibit",
            DocumentType::Addendum => "addendum",
            DocumentType::Signature => "signature",
            DocumentType::CoverLetter => "cover_letter",
            DocumentType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "primary" => DocumentType::Primary,
            "appendix" => DocumentType::Appendix,
            "amendment" => DocumentType::Amendment,
            "exhibit" => DocumentType::Exhibit,
            "addendum" => DocumentType::Addendum,
            "signature" => DocumentType::Signature,
            "cover_letter" => DocumentType::CoverLetter,
            _ => DocumentType::Other,
        }
    }
}
