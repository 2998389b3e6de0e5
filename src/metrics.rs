use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::state_machine::{CorrectionType, WorkItem, WorkStatus};
use crate::store::{ItemFilter, StoreError, WorkItemStore};

/// Read-only view over the store at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub total: usize,
    pub by_status: BTreeMap<WorkStatus, usize>,
    pub by_type: BTreeMap<CorrectionType, BTreeMap<WorkStatus, usize>>,
    /// Outstanding work (Pending + Processing) times the per-item cost.
    pub estimated_cost: f64,
    pub window_hours: i64,
    /// Completed or NoChanges over all items finished in the window, Skipped
    /// excluded. `None` when nothing finished.
    pub success_rate: Option<f64>,
}

impl MetricsSnapshot {
    pub fn count(&self, status: WorkStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn count_of(&self, correction_type: CorrectionType, status: WorkStatus) -> usize {
        self.by_type
            .get(&correction_type)
            .and_then(|m| m.get(&status))
            .copied()
            .unwrap_or(0)
    }
}

/// Builds a snapshot, optionally restricted to one correction type.
pub fn collect<S: WorkItemStore + ?Sized>(
    store: &S,
    correction_type: Option<CorrectionType>,
    per_item_cost: f64,
    window: Duration,
) -> Result<MetricsSnapshot, StoreError> {
    let now = store.now();
    let filter = ItemFilter {
        correction_type,
        ..Default::default()
    };
    let items = store.list(&filter)?;
    Ok(summarize(&items, now, per_item_cost, window))
}

fn summarize(items: &[WorkItem], now: DateTime<Utc>, per_item_cost: f64, window: Duration) -> MetricsSnapshot {
    let mut by_status: BTreeMap<WorkStatus, usize> = WorkStatus::ALL.iter().map(|&s| (s, 0)).collect();
    let mut by_type: BTreeMap<CorrectionType, BTreeMap<WorkStatus, usize>> = BTreeMap::new();
    let (mut succeeded, mut finished) = (0usize, 0usize);
    let since = now - window;

    for item in items {
        *by_status.entry(item.status).or_default() += 1;
        *by_type
            .entry(item.correction_type)
            .or_default()
            .entry(item.status)
            .or_default() += 1;

        if item.processed_at.is_some_and(|t| t >= since) {
            match item.status {
                WorkStatus::Completed | WorkStatus::NoChanges => {
                    succeeded += 1;
                    finished += 1;
                }
                WorkStatus::Failed => finished += 1,
                _ => {}
            }
        }
    }

    let outstanding = by_status[&WorkStatus::Pending] + by_status[&WorkStatus::Processing];
    MetricsSnapshot {
        taken_at: now,
        total: items.len(),
        by_status,
        by_type,
        estimated_cost: outstanding as f64 * per_item_cost,
        window_hours: window.num_hours(),
        success_rate: (finished > 0).then(|| succeeded as f64 / finished as f64),
    }
}

/// Body of a stats lane: logs the snapshot for one type, never mutates.
pub fn log_lane_stats<S: WorkItemStore + ?Sized>(
    store: &S,
    lane: &str,
    correction_type: CorrectionType,
    per_item_cost: f64,
) -> Result<MetricsSnapshot, StoreError> {
    let snapshot = collect(store, Some(correction_type), per_item_cost, Duration::hours(24))?;
    info!(
        lane,
        correction_type = %correction_type,
        pending = snapshot.count(WorkStatus::Pending),
        processing = snapshot.count(WorkStatus::Processing),
        completed = snapshot.count(WorkStatus::Completed),
        failed = snapshot.count(WorkStatus::Failed),
        estimated_cost = snapshot.estimated_cost,
        success_rate = snapshot.success_rate.unwrap_or(0.0),
        "lane stats"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;

    fn seeded() -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryStore::with_clock(clock.clone());
        for i in 0..4 {
            store
                .create(&format!("car-{i}"), CorrectionType::Specs, json!({"engine": "1.0"}))
                .unwrap();
        }
        store.create("car-0", CorrectionType::Pricing, json!({"price": 1})).unwrap();
        (clock, store)
    }

    #[test]
    fn counts_cost_and_success_rate() {
        let (_clock, store) = seeded();
        let claimed = store.claim_next_pending(CorrectionType::Specs, 3).unwrap();
        store.complete(&claimed[0].id, json!({})).unwrap();
        store.mark_no_changes(&claimed[1].id, "fine").unwrap();
        store.fail(&claimed[2].id, "exhausted").unwrap();

        let m = collect(&store, None, 0.5, Duration::hours(24)).unwrap();
        assert_eq!(m.total, 5);
        assert_eq!(m.count(WorkStatus::Pending), 2);
        assert_eq!(m.count(WorkStatus::Completed), 1);
        assert_eq!(m.count(WorkStatus::Skipped), 0);
        assert_eq!(m.count_of(CorrectionType::Specs, WorkStatus::Failed), 1);
        assert_eq!(m.estimated_cost, 1.0);
        let rate = m.success_rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn success_rate_ignores_items_outside_window() {
        let (clock, store) = seeded();
        let claimed = store.claim_next_pending(CorrectionType::Specs, 1).unwrap();
        store.fail(&claimed[0].id, "exhausted").unwrap();
        clock.advance(Duration::hours(30));

        let m = collect(&store, None, 0.0, Duration::hours(24)).unwrap();
        assert_eq!(m.success_rate, None);
        assert_eq!(m.window_hours, 24);
    }

    #[test]
    fn restricted_to_one_type() {
        let (_clock, store) = seeded();
        let m = log_lane_stats(&store, "pricing-stats", CorrectionType::Pricing, 1.0).unwrap();
        assert_eq!(m.total, 1);
        assert_eq!(m.estimated_cost, 1.0);
        assert!(!m.by_type.contains_key(&CorrectionType::Specs));
    }
}
