use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{ItemFilter, StoreError, WorkItemStore};
use crate::clock::{Clock, SystemClock};
use crate::state_machine::{Batch, BatchSummary, CorrectionType, NewWorkItem, WorkItem, WorkStatus};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    items: Vec<WorkItem>,
    #[serde(default)]
    batches: Vec<Batch>,
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<String, WorkItem>,
    batches: HashMap<String, Batch>,
    next_batch_position: u64,
}

impl Inner {
    fn item_mut(&mut self, id: &str) -> Result<&mut WorkItem, StoreError> {
        self.items
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Mutex-guarded map of work items, optionally persisted as a JSON snapshot.
///
/// Every operation holds the lock for its whole read-check-write sequence, so
/// the dedup gate and claims stay correct under concurrent callers.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Loads a snapshot written by [`InMemoryStore::save`]. A missing file
    /// yields an empty store.
    pub fn load(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let store = Self::with_clock(clock);
        if !path.exists() {
            return Ok(store);
        }
        let contents = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&contents)?;
        {
            let mut inner = store.inner.lock();
            inner.next_batch_position = snapshot
                .batches
                .iter()
                .map(|b| b.position + 1)
                .max()
                .unwrap_or(0);
            inner.batches = snapshot
                .batches
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect();
            inner.items = snapshot
                .items
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect();
            debug!(items = inner.items.len(), path = %path.display(), "loaded store snapshot");
        }
        Ok(store)
    }

    /// Writes the store to `path` through a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = {
            let inner = self.inner.lock();
            let mut items: Vec<WorkItem> = inner.items.values().cloned().collect();
            items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            let mut batches: Vec<Batch> = inner.batches.values().cloned().collect();
            batches.sort_by_key(|b| b.position);
            Snapshot { items, batches }
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        to: WorkStatus,
        apply: impl FnOnce(&mut WorkItem),
    ) -> Result<WorkItem, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let item = inner.item_mut(id)?;
        if !item.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: item.status,
                to,
            });
        }
        item.status = to;
        item.updated_at = now;
        apply(item);
        Ok(item.clone())
    }

    /// Terminal transitions are no-ops on items that already finished.
    fn finish(
        &self,
        id: &str,
        to: WorkStatus,
        apply: impl FnOnce(&mut WorkItem),
    ) -> Result<WorkItem, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let item = inner.item_mut(id)?;
        if item.status.is_terminal() {
            debug!(id, status = %item.status, requested = %to, "item already terminal");
            return Ok(item.clone());
        }
        if !item.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: item.status,
                to,
            });
        }
        item.status = to;
        item.updated_at = now;
        item.processed_at = Some(now);
        apply(item);
        Ok(item.clone())
    }
}

impl WorkItemStore for InMemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn create_with(&self, new: NewWorkItem) -> Result<WorkItem, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let duplicate = inner.items.values().any(|i| {
            i.status.is_active()
                && i.correction_type == new.correction_type
                && i.subject_key == new.subject_key
        });
        if duplicate {
            return Err(StoreError::DuplicateActive {
                subject_key: new.subject_key,
                correction_type: new.correction_type,
            });
        }
        let item = WorkItem::new(new, now);
        inner.items.insert(item.id.clone(), item.clone());
        Ok(item)
    }

    fn claim_next_pending(
        &self,
        correction_type: CorrectionType,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut candidates: Vec<(Reverse<i32>, DateTime<Utc>, String)> = inner
            .items
            .values()
            .filter(|i| i.status == WorkStatus::Pending && i.correction_type == correction_type)
            .map(|i| (Reverse(i.priority), i.created_at, i.id.clone()))
            .collect();
        candidates.sort();

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, _, id) in candidates.into_iter().take(limit) {
            let item = inner.item_mut(&id)?;
            item.status = WorkStatus::Processing;
            item.claimed_at = Some(now);
            item.updated_at = now;
            item.attempts += 1;
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    fn claim(&self, id: &str) -> Result<WorkItem, StoreError> {
        let now = self.clock.now();
        self.transition(id, WorkStatus::Processing, |item| {
            item.claimed_at = Some(now);
            item.attempts += 1;
        })
    }

    fn release(&self, id: &str) -> Result<WorkItem, StoreError> {
        self.transition(id, WorkStatus::Pending, |item| item.claimed_at = None)
    }

    fn complete(&self, id: &str, result: Value) -> Result<WorkItem, StoreError> {
        self.finish(id, WorkStatus::Completed, |item| {
            item.result = Some(result);
            item.last_error = None;
        })
    }

    fn fail(&self, id: &str, error: &str) -> Result<WorkItem, StoreError> {
        self.finish(id, WorkStatus::Failed, |item| {
            item.last_error = Some(error.to_string());
        })
    }

    fn skip(&self, id: &str, reason: &str) -> Result<WorkItem, StoreError> {
        self.finish(id, WorkStatus::Skipped, |item| {
            item.last_error = Some(reason.to_string());
        })
    }

    fn mark_no_changes(&self, id: &str, reason: &str) -> Result<WorkItem, StoreError> {
        self.finish(id, WorkStatus::NoChanges, |item| {
            item.result = Some(serde_json::json!({ "no_changes": true, "reason": reason }));
        })
    }

    fn reclaim_stuck(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let cutoff = now - older_than;
        let mut inner = self.inner.lock();
        let mut reclaimed = Vec::new();
        for item in inner.items.values_mut() {
            if item.status == WorkStatus::Processing && item.updated_at < cutoff {
                item.status = WorkStatus::Pending;
                item.claimed_at = None;
                item.updated_at = now;
                reclaimed.push(item.id.clone());
            }
        }
        reclaimed.sort();
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed stuck items");
        }
        Ok(reclaimed)
    }

    fn purge_terminal(
        &self,
        older_than: Duration,
        statuses: &[WorkStatus],
    ) -> Result<usize, StoreError> {
        let cutoff = self.clock.now() - older_than;
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        inner.items.retain(|_, item| {
            !(item.status.is_terminal()
                && statuses.contains(&item.status)
                && item.updated_at < cutoff)
        });
        Ok(before - inner.items.len())
    }

    fn get(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.inner.lock().items.get(id).cloned())
    }

    fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.inner.lock();
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    fn has_active(
        &self,
        subject_key: &str,
        correction_type: CorrectionType,
    ) -> Result<bool, StoreError> {
        Ok(self.inner.lock().items.values().any(|i| {
            i.status.is_active() && i.dedup_key() == (subject_key, correction_type)
        }))
    }

    fn last_corrected_at(
        &self,
        subject_key: &str,
        correction_type: CorrectionType,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .items
            .values()
            .filter(|i| {
                matches!(i.status, WorkStatus::Completed | WorkStatus::NoChanges)
                    && i.dedup_key() == (subject_key, correction_type)
            })
            .filter_map(|i| i.processed_at)
            .max())
    }

    fn delete(&self, id: &str) -> Result<WorkItem, StoreError> {
        let mut inner = self.inner.lock();
        let status = inner
            .items
            .get(id)
            .map(|i| i.status)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !matches!(status, WorkStatus::Pending | WorkStatus::Failed) {
            return Err(StoreError::NotDeletable {
                id: id.to_string(),
                status,
            });
        }
        inner
            .items
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn import(&self, items: Vec<WorkItem>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let count = items.len();
        for item in items {
            inner.items.insert(item.id.clone(), item);
        }
        Ok(count)
    }

    fn register_batch(
        &self,
        id: &str,
        correction_type: CorrectionType,
        estimated_cost: f64,
    ) -> Result<Batch, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let position = inner.next_batch_position;
        inner.next_batch_position += 1;
        let batch = Batch {
            id: id.to_string(),
            correction_type,
            position,
            estimated_cost,
            created_at: now,
        };
        inner.batches.insert(batch.id.clone(), batch.clone());
        Ok(batch)
    }

    fn batch_summary(&self, id: &str) -> Result<Option<BatchSummary>, StoreError> {
        let inner = self.inner.lock();
        let Some(batch) = inner.batches.get(id).cloned() else {
            return Ok(None);
        };
        let mut summary = BatchSummary {
            batch,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
        };
        for item in inner.items.values() {
            if item.batch_id.as_deref() != Some(id) {
                continue;
            }
            match item.status {
                WorkStatus::Pending => summary.pending += 1,
                WorkStatus::Processing => summary.processing += 1,
                WorkStatus::Completed | WorkStatus::NoChanges => summary.completed += 1,
                WorkStatus::Failed => summary.failed += 1,
                WorkStatus::Skipped => {}
            }
        }
        Ok(Some(summary))
    }

    fn batches(&self) -> Result<Vec<Batch>, StoreError> {
        let mut batches: Vec<Batch> = self.inner.lock().batches.values().cloned().collect();
        batches.sort_by_key(|b| b.position);
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn create_rejects_active_duplicate() {
        let store = InMemoryStore::new();
        store
            .create("golf-2024", CorrectionType::Specs, json!({}))
            .unwrap();
        let err = store
            .create("golf-2024", CorrectionType::Specs, json!({}))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateActive { .. }));
        // Same subject, other type is independent.
        store
            .create("golf-2024", CorrectionType::Pricing, json!({}))
            .unwrap();
        assert_eq!(store.count(None, None).unwrap(), 2);
    }

    #[test]
    fn dedup_gate_holds_through_lifecycle() {
        let store = InMemoryStore::new();
        let item = store
            .create("polo", CorrectionType::Title, json!({}))
            .unwrap();
        let claimed = store
            .claim_next_pending(CorrectionType::Title, 1)
            .unwrap();
        assert_eq!(claimed[0].id, item.id);
        assert!(
            store
                .create("polo", CorrectionType::Title, json!({}))
                .is_err(),
            "processing item still blocks creation"
        );

        store.complete(&item.id, json!({"title": "Polo"})).unwrap();
        let again = store
            .create("polo", CorrectionType::Title, json!({}))
            .unwrap();
        assert_eq!(again.status, WorkStatus::Pending);
        assert_ne!(again.id, item.id);
    }

    #[test]
    fn claim_orders_by_priority_then_age() {
        let (store, clock) = store_with_clock();
        let low = store
            .create_with(NewWorkItem::new("a", CorrectionType::Specs, json!({})).with_priority(1))
            .unwrap();
        clock.advance(Duration::seconds(1));
        let high = store
            .create_with(NewWorkItem::new("b", CorrectionType::Specs, json!({})).with_priority(9))
            .unwrap();
        clock.advance(Duration::seconds(1));
        let low_newer = store
            .create_with(NewWorkItem::new("c", CorrectionType::Specs, json!({})).with_priority(1))
            .unwrap();

        let ids: Vec<String> = store
            .claim_next_pending(CorrectionType::Specs, 10)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![high.id, low.id, low_newer.id]);
    }

    #[test]
    fn claim_stamps_and_filters_by_type() {
        let (store, clock) = store_with_clock();
        store.create("a", CorrectionType::Specs, json!({})).unwrap();
        store.create("b", CorrectionType::Pricing, json!({})).unwrap();
        clock.advance(Duration::minutes(3));

        let claimed = store.claim_next_pending(CorrectionType::Specs, 5).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, WorkStatus::Processing);
        assert_eq!(claimed[0].claimed_at, Some(clock.now()));
        assert_eq!(claimed[0].attempts, 1);
        assert!(
            store
                .claim_next_pending(CorrectionType::Specs, 5)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn concurrent_claims_never_share_an_item() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..40 {
            store
                .create(&format!("subject-{i}"), CorrectionType::Versions, json!({}))
                .unwrap();
        }

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .claim_next_pending(CorrectionType::Versions, 1)
                        .unwrap()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for item in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(item.id), "item claimed twice");
            }
        }
        assert_eq!(total, 32);
        assert_eq!(
            store
                .count(Some(WorkStatus::Pending), Some(CorrectionType::Versions))
                .unwrap(),
            8
        );
    }

    #[test]
    fn round_trip_create_claim_complete_get() {
        let store = InMemoryStore::new();
        let item = store
            .create("a3-sportback", CorrectionType::Title, json!({"current": "A3"}))
            .unwrap();
        store.claim_next_pending(CorrectionType::Title, 1).unwrap();
        let result = json!({"title": "Audi A3 Sportback 35 TFSI"});
        store.complete(&item.id, result.clone()).unwrap();

        let fetched = store.get(&item.id).unwrap().unwrap();
        assert_eq!(fetched.status, WorkStatus::Completed);
        assert_eq!(fetched.result, Some(result));
        assert!(fetched.processed_at.is_some());
    }

    #[test]
    fn terminal_transitions_are_idempotent() {
        let store = InMemoryStore::new();
        let item = store.create("x", CorrectionType::Specs, json!({})).unwrap();
        store.claim(&item.id).unwrap();
        let done = store.complete(&item.id, json!({"ok": true})).unwrap();

        let again = store.fail(&item.id, "late failure").unwrap();
        assert_eq!(again.status, WorkStatus::Completed);
        assert_eq!(again.result, done.result);
        assert!(again.last_error.is_none());
        let again = store.complete(&item.id, json!({"other": 1})).unwrap();
        assert_eq!(again.result, done.result);
    }

    #[test]
    fn completing_an_unclaimed_item_is_rejected() {
        let store = InMemoryStore::new();
        let item = store.create("x", CorrectionType::Specs, json!({})).unwrap();
        let err = store.complete(&item.id, json!({})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.skip(&item.id, "manual").unwrap().status, WorkStatus::Skipped);
    }

    #[test]
    fn claim_by_id_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let item = store.create("x", CorrectionType::Pricing, json!({})).unwrap();
        store.claim(&item.id).unwrap();
        assert!(matches!(
            store.claim(&item.id),
            Err(StoreError::InvalidTransition { .. })
        ));
        let released = store.release(&item.id).unwrap();
        assert_eq!(released.status, WorkStatus::Pending);
        assert!(released.claimed_at.is_none());
    }

    #[test]
    fn reclaim_stuck_respects_threshold() {
        let (store, clock) = store_with_clock();
        let old = store.create("old", CorrectionType::Specs, json!({})).unwrap();
        store.claim(&old.id).unwrap();
        clock.advance(Duration::hours(4));
        let fresh = store.create("fresh", CorrectionType::Specs, json!({})).unwrap();
        store.claim(&fresh.id).unwrap();
        clock.advance(Duration::hours(1));

        let reclaimed = store.reclaim_stuck(Duration::hours(4)).unwrap();
        assert_eq!(reclaimed, vec![old.id.clone()]);
        assert_eq!(store.get(&old.id).unwrap().unwrap().status, WorkStatus::Pending);
        assert_eq!(
            store.get(&fresh.id).unwrap().unwrap().status,
            WorkStatus::Processing
        );
    }

    #[test]
    fn purge_terminal_only_touches_requested_aged_statuses() {
        let (store, clock) = store_with_clock();
        let old_failed = store.create("a", CorrectionType::Specs, json!({})).unwrap();
        let old_done = store.create("b", CorrectionType::Specs, json!({})).unwrap();
        for id in [&old_failed.id, &old_done.id] {
            store.claim(id).unwrap();
        }
        store.fail(&old_failed.id, "boom").unwrap();
        store.complete(&old_done.id, json!({})).unwrap();
        clock.advance(Duration::hours(50));
        let recent_failed = store.create("c", CorrectionType::Specs, json!({})).unwrap();
        store.claim(&recent_failed.id).unwrap();
        store.fail(&recent_failed.id, "boom").unwrap();
        let pending = store.create("d", CorrectionType::Specs, json!({})).unwrap();

        let purged = store
            .purge_terminal(Duration::hours(48), &[WorkStatus::Failed, WorkStatus::Pending])
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(&old_failed.id).unwrap().is_none());
        assert!(store.get(&old_done.id).unwrap().is_some());
        assert!(store.get(&recent_failed.id).unwrap().is_some());
        assert!(store.get(&pending.id).unwrap().is_some());
    }

    #[test]
    fn delete_only_pending_or_failed() {
        let store = InMemoryStore::new();
        let pending = store.create("a", CorrectionType::Specs, json!({})).unwrap();
        let processing = store.create("b", CorrectionType::Specs, json!({})).unwrap();
        store.claim(&processing.id).unwrap();

        assert!(store.delete(&pending.id).is_ok());
        assert!(matches!(
            store.delete(&processing.id),
            Err(StoreError::NotDeletable { .. })
        ));
        assert!(matches!(store.delete("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn last_corrected_tracks_completed_and_no_changes() {
        let (store, clock) = store_with_clock();
        assert!(store.last_corrected_at("a", CorrectionType::Title).unwrap().is_none());
        let item = store.create("a", CorrectionType::Title, json!({})).unwrap();
        store.claim(&item.id).unwrap();
        clock.advance(Duration::minutes(1));
        store.mark_no_changes(&item.id, "already accurate").unwrap();
        assert_eq!(
            store.last_corrected_at("a", CorrectionType::Title).unwrap(),
            Some(clock.now())
        );
    }

    #[test]
    fn batch_summary_projects_counts() {
        let store = InMemoryStore::new();
        let a = store
            .create_with(NewWorkItem::new("a", CorrectionType::Specs, json!({})).in_batch("b1"))
            .unwrap();
        store
            .create_with(NewWorkItem::new("b", CorrectionType::Specs, json!({})).in_batch("b1"))
            .unwrap();
        store.create("c", CorrectionType::Specs, json!({})).unwrap();
        store.register_batch("b1", CorrectionType::Specs, 0.04).unwrap();
        store.claim(&a.id).unwrap();
        store.fail(&a.id, "x").unwrap();

        let summary = store.batch_summary("b1").unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.batch.position, 0);
        assert_eq!(store.register_batch("b2", CorrectionType::Specs, 0.0).unwrap().position, 1);
        assert!(store.batch_summary("missing").unwrap().is_none());
    }

    #[test]
    fn snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("items.json");
        let store = InMemoryStore::new();
        let item = store
            .create("golf", CorrectionType::Pricing, json!({"price": 30000}))
            .unwrap();
        store.register_batch("b1", CorrectionType::Pricing, 0.02).unwrap();
        store.save(&path).unwrap();

        let loaded = InMemoryStore::load(&path, Arc::new(SystemClock)).unwrap();
        assert_eq!(loaded.get(&item.id).unwrap().unwrap(), item);
        assert_eq!(loaded.batches().unwrap().len(), 1);
        assert_eq!(
            loaded.register_batch("b2", CorrectionType::Pricing, 0.0).unwrap().position,
            1
        );
    }

    #[test]
    fn load_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::load(&dir.path().join("none.json"), Arc::new(SystemClock)).unwrap();
        assert_eq!(store.count(None, None).unwrap(), 0);
    }
}
