//! Merge ordering across sibling documents.

use crate::db::{document_repo, Database, DatabaseError};
use crate::queue::{Job, LeaseGate, QueueError};

use super::document::Document;
use super::state::ProcessingStatus;

/// Whether every live sibling with a lower sequence order has reached a
/// terminal processing state.
pub fn lower_siblings_terminal(db: &Database, document: &Document) -> Result<bool, DatabaseError> {
    let Some(contract_id) = document.contract_id.as_deref() else {
        return Ok(true);
    };
    let siblings = document_repo::list_for_contract(db, contract_id)?;
    Ok(siblings
        .iter()
        .filter(|row| row.id != document.id && row.sequence_order < i64::from(document.sequence_order))
        .all(|row| ProcessingStatus::parse(&row.processing_status, &row.id).is_terminal()))
}

/// Holds DOCUMENT_MERGE jobs back until lower-sequence siblings are done.
pub struct SiblingOrderGate {
    db: Database,
}

impl SiblingOrderGate {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl LeaseGate for SiblingOrderGate {
    fn may_lease(&self, job: &Job) -> Result<bool, QueueError> {
        let Some(document_id) = job.entity.document_id() else {
            // Not a document target; the handler rejects it.
            return Ok(true);
        };
        match document_repo::find_by_id(&self.db, document_id)? {
            Some(row) => Ok(lower_siblings_terminal(&self.db, &Document::from_row(&row))?),
            None => Ok(true),
        }
    }
}
