//! Housekeeping tasks that recover from crashes and keep the store bounded.
//!
//! Each task is a plain synchronous pass over the store; the scheduler wraps
//! them in lease-guarded periodic tasks.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::MaintenanceConfig;
use crate::state_machine::{CorrectionType, WorkItem, WorkStatus};
use crate::store::{ItemFilter, StoreError, WorkItemStore};

/// Reason recorded on items skipped by [`collapse_duplicates`].
pub const DUPLICATE_REASON: &str = "duplicate";

/// Moves Processing items untouched for `stuck_after` back to Pending.
pub fn reclaim_stuck<S: WorkItemStore + ?Sized>(
    store: &S,
    stuck_after: Duration,
) -> Result<usize, StoreError> {
    let ids = store.reclaim_stuck(stuck_after)?;
    if !ids.is_empty() {
        warn!(count = ids.len(), ?ids, "reclaimed stuck items");
    }
    Ok(ids.len())
}

/// Deletes Failed items older than `retention`.
pub fn purge_failed<S: WorkItemStore + ?Sized>(
    store: &S,
    retention: Duration,
) -> Result<usize, StoreError> {
    let purged = store.purge_terminal(retention, &[WorkStatus::Failed])?;
    if purged > 0 {
        info!(purged, "purged old failed items");
    }
    Ok(purged)
}

/// Keeps the oldest active item per (subject, type) and skips the rest.
///
/// The dedup gate makes this a no-op in normal operation; duplicates only
/// appear through `import` of old snapshots or external writers.
pub fn collapse_duplicates<S: WorkItemStore + ?Sized>(store: &S) -> Result<usize, StoreError> {
    let mut groups: BTreeMap<(String, CorrectionType), Vec<WorkItem>> = BTreeMap::new();
    for status in [WorkStatus::Pending, WorkStatus::Processing] {
        for item in store.list(&ItemFilter::status(status))? {
            groups
                .entry((item.subject_key.clone(), item.correction_type))
                .or_default()
                .push(item);
        }
    }

    let mut collapsed = 0;
    for ((subject, correction_type), mut items) in groups {
        if items.len() < 2 {
            continue;
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for dup in &items[1..] {
            store.skip(&dup.id, DUPLICATE_REASON)?;
            collapsed += 1;
        }
        warn!(
            subject = %subject,
            correction_type = %correction_type,
            kept = %items[0].id,
            skipped = items.len() - 1,
            "collapsed duplicate active items"
        );
    }
    Ok(collapsed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub purged: usize,
    pub collapsed: usize,
}

/// Runs all three tasks once, in order.
pub fn run_all<S: WorkItemStore + ?Sized>(
    store: &S,
    config: &MaintenanceConfig,
) -> Result<MaintenanceReport, StoreError> {
    Ok(MaintenanceReport {
        reclaimed: reclaim_stuck(store, config.stuck_after())?,
        purged: purge_failed(store, config.failed_retention())?,
        collapsed: collapse_duplicates(store)?,
    })
}
