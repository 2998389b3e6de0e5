use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::status::{CorrectionType, WorkStatus};

/// A single correction task in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub subject_key: String,
    pub correction_type: CorrectionType,
    pub status: WorkStatus,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Number of times the item has been claimed for processing.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub payload: Value,
    pub result: Option<Value>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl WorkItem {
    pub fn new(new: NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_key: new.subject_key,
            correction_type: new.correction_type,
            status: WorkStatus::Pending,
            priority: new.priority,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            processed_at: None,
            payload: new.payload,
            result: None,
            batch_id: new.batch_id,
        }
    }

    /// Key of the dedup gate.
    pub fn dedup_key(&self) -> (&str, CorrectionType) {
        (&self.subject_key, self.correction_type)
    }
}

/// Creation request for a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub subject_key: String,
    pub correction_type: CorrectionType,
    pub payload: Value,
    pub priority: i32,
    pub batch_id: Option<String>,
}

impl NewWorkItem {
    pub fn new(subject_key: impl Into<String>, correction_type: CorrectionType, payload: Value) -> Self {
        Self {
            subject_key: subject_key.into(),
            correction_type,
            payload,
            priority: correction_type.default_priority(),
            batch_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// A group of items enqueued by one backlog pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub correction_type: CorrectionType,
    /// Sequence number among all batches of the store.
    pub position: u64,
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Batch with its aggregate counts projected from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch: Batch,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}
