//! Repository over correction work items.
//!
//! Every mutation goes through the FSM operations of [`WorkItemStore`]; the
//! status filters that used to be ad-hoc query scopes are [`ItemFilter`].

mod memory;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::{Batch, BatchSummary, CorrectionType, NewWorkItem, WorkItem, WorkStatus};

pub use memory::InMemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("an active {correction_type} item already exists for subject {subject_key}")]
    DuplicateActive {
        subject_key: String,
        correction_type: CorrectionType,
    },

    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("work item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: WorkStatus,
        to: WorkStatus,
    },

    #[error("work item {id} is {status}; only pending or failed items can be deleted")]
    NotDeletable { id: String, status: WorkStatus },

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store snapshot error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Query filter for [`WorkItemStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub status: Option<WorkStatus>,
    pub correction_type: Option<CorrectionType>,
    pub subject_key: Option<String>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn status(status: WorkStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, correction_type: CorrectionType) -> Self {
        self.correction_type = Some(correction_type);
        self
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        self.status.is_none_or(|s| item.status == s)
            && self.correction_type.is_none_or(|t| item.correction_type == t)
            && self
                .subject_key
                .as_deref()
                .is_none_or(|k| item.subject_key == k)
    }
}

pub trait WorkItemStore: Send + Sync {
    /// Current time as seen by the store.
    fn now(&self) -> DateTime<Utc>;

    /// Inserts a Pending item unless an active one exists for the same
    /// subject and type.
    fn create_with(&self, new: NewWorkItem) -> Result<WorkItem, StoreError>;

    fn create(
        &self,
        subject_key: &str,
        correction_type: CorrectionType,
        payload: Value,
    ) -> Result<WorkItem, StoreError> {
        self.create_with(NewWorkItem::new(subject_key, correction_type, payload))
    }

    /// Moves up to `limit` Pending items of a type to Processing, highest
    /// priority first, then oldest first. Selection and transition are one
    /// atomic step.
    fn claim_next_pending(
        &self,
        correction_type: CorrectionType,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Claims one specific Pending item.
    fn claim(&self, id: &str) -> Result<WorkItem, StoreError>;

    /// Returns a Processing item to Pending without recording an outcome.
    fn release(&self, id: &str) -> Result<WorkItem, StoreError>;

    fn complete(&self, id: &str, result: Value) -> Result<WorkItem, StoreError>;

    fn fail(&self, id: &str, error: &str) -> Result<WorkItem, StoreError>;

    fn skip(&self, id: &str, reason: &str) -> Result<WorkItem, StoreError>;

    fn mark_no_changes(&self, id: &str, reason: &str) -> Result<WorkItem, StoreError>;

    /// Returns every Processing item not updated within `older_than` to
    /// Pending. Yields the reclaimed ids.
    fn reclaim_stuck(&self, older_than: Duration) -> Result<Vec<String>, StoreError>;

    /// Deletes items in `statuses` not updated within `older_than`. Active
    /// statuses are never purged.
    fn purge_terminal(
        &self,
        older_than: Duration,
        statuses: &[WorkStatus],
    ) -> Result<usize, StoreError>;

    fn get(&self, id: &str) -> Result<Option<WorkItem>, StoreError>;

    /// Matching items, oldest first.
    fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, StoreError>;

    fn count(
        &self,
        status: Option<WorkStatus>,
        correction_type: Option<CorrectionType>,
    ) -> Result<usize, StoreError> {
        let filter = ItemFilter {
            status,
            correction_type,
            ..Default::default()
        };
        Ok(self.list(&filter)?.len())
    }

    fn has_active(
        &self,
        subject_key: &str,
        correction_type: CorrectionType,
    ) -> Result<bool, StoreError>;

    /// When the subject was last completed (or found unchanged) for this type.
    fn last_corrected_at(
        &self,
        subject_key: &str,
        correction_type: CorrectionType,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Removes a Pending or Failed item.
    fn delete(&self, id: &str) -> Result<WorkItem, StoreError>;

    /// Restores items verbatim, bypassing the dedup gate. Existing ids are
    /// overwritten.
    fn import(&self, items: Vec<WorkItem>) -> Result<usize, StoreError>;

    fn register_batch(
        &self,
        id: &str,
        correction_type: CorrectionType,
        estimated_cost: f64,
    ) -> Result<Batch, StoreError>;

    fn batch_summary(&self, id: &str) -> Result<Option<BatchSummary>, StoreError>;

    fn batches(&self) -> Result<Vec<Batch>, StoreError>;
}
