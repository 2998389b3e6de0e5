use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::anthropic::MessageSender;
use crate::error::CorrectorError;
use crate::orchestrator::CorrectionProcessor;
use crate::state_machine::{WorkItem, WorkStatus};
use crate::store::{ItemFilter, WorkItemStore};

/// Per-id outcome of a batch operation.
pub type BatchResult<T> = BTreeMap<String, Result<T, String>>;

/// Operator surface over the store: query, process on demand, delete.
pub struct Admin<S> {
    store: Arc<S>,
}

impl<S: WorkItemStore> Admin<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, CorrectorError> {
        Ok(self.store.list(filter)?)
    }

    pub fn get(&self, id: &str) -> Result<WorkItem, CorrectorError> {
        self.store
            .get(id)?
            .ok_or_else(|| CorrectorError::ItemNotFound(id.to_string()))
    }

    /// Claims and processes each id now, outside any cadence. Items that are
    /// not Pending report the rejected transition.
    pub async fn trigger<C: MessageSender>(
        &self,
        processor: &CorrectionProcessor<S, C>,
        ids: &[String],
        start_tier: Option<usize>,
    ) -> BatchResult<WorkStatus> {
        let mut results = BTreeMap::new();
        for id in ids {
            let outcome = match self.store.claim(id) {
                Ok(item) => processor
                    .process(&item, start_tier)
                    .await
                    .map(|done| done.status)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            info!(id = %id, ok = outcome.is_ok(), "manual trigger");
            results.insert(id.clone(), outcome);
        }
        results
    }

    /// Deletes each id; only Pending and Failed items can go.
    pub fn delete_many(&self, ids: &[String]) -> BatchResult<()> {
        ids.iter()
            .map(|id| {
                let outcome = self.store.delete(id).map(|_| ()).map_err(|e| e.to_string());
                (id.clone(), outcome)
            })
            .collect()
    }
}
