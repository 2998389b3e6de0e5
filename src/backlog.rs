use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BacklogConfig;
use crate::state_machine::{CorrectionType, NewWorkItem, WorkStatus};
use crate::store::{StoreError, WorkItemStore};
use crate::subjects::{SourceError, SubjectSource};

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Outcome of one backlog pass for one correction type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BacklogReport {
    pub correction_type: Option<CorrectionType>,
    pub created: usize,
    /// Subjects that already had an active item.
    pub duplicates: usize,
    /// Subjects corrected within the cooldown window.
    pub cooldown_skipped: usize,
    /// The pending ceiling was already reached; nothing was scanned.
    pub ceiling_reached: bool,
    pub batch_id: Option<String>,
    pub estimated_cost: f64,
}

/// Keeps each correction type's Pending queue topped up from a subject
/// source.
pub struct BacklogController<S> {
    store: Arc<S>,
    source: Arc<dyn SubjectSource>,
    config: BacklogConfig,
    per_item_cost: f64,
}

impl<S: WorkItemStore> BacklogController<S> {
    pub fn new(
        store: Arc<S>,
        source: Arc<dyn SubjectSource>,
        config: BacklogConfig,
        per_item_cost: f64,
    ) -> Self {
        Self {
            store,
            source,
            config,
            per_item_cost,
        }
    }

    /// Enqueues up to `batch_limit` new items, never past the pending
    /// ceiling. Created items share one batch.
    pub fn fill(&self, correction_type: CorrectionType) -> Result<BacklogReport, BacklogError> {
        let mut report = BacklogReport {
            correction_type: Some(correction_type),
            ..Default::default()
        };

        let pending = self.store.count(Some(WorkStatus::Pending), Some(correction_type))?;
        if pending >= self.config.pending_ceiling {
            debug!(correction_type = %correction_type, pending, "pending ceiling reached");
            report.ceiling_reached = true;
            return Ok(report);
        }
        let slots = (self.config.pending_ceiling - pending).min(self.config.batch_limit);
        if slots == 0 {
            return Ok(report);
        }

        let now = self.store.now();
        let cooldown = self.config.cooldown(correction_type);
        let batch_id = Uuid::new_v4().to_string();

        for subject in self.source.subjects(correction_type)? {
            if report.created >= slots {
                break;
            }
            if self.store.has_active(&subject.key, correction_type)? {
                report.duplicates += 1;
                continue;
            }
            if let Some(last) = self.store.last_corrected_at(&subject.key, correction_type)? {
                if now - last < cooldown {
                    report.cooldown_skipped += 1;
                    continue;
                }
            }

            let mut new = NewWorkItem::new(&subject.key, correction_type, subject.payload).in_batch(&batch_id);
            if let Some(priority) = subject.priority {
                new = new.with_priority(priority);
            }
            match self.store.create_with(new) {
                Ok(_) => report.created += 1,
                // Lost a race with another creator between the check and the insert.
                Err(StoreError::DuplicateActive { .. }) => report.duplicates += 1,
                Err(e) => return Err(e.into()),
            }
        }

        if report.created > 0 {
            let cost = report.created as f64 * self.per_item_cost;
            let batch = self.store.register_batch(&batch_id, correction_type, cost)?;
            report.batch_id = Some(batch.id);
            report.estimated_cost = cost;
        }

        info!(
            correction_type = %correction_type,
            created = report.created,
            duplicates = report.duplicates,
            cooldown_skipped = report.cooldown_skipped,
            estimated_cost = report.estimated_cost,
            "backlog pass"
        );
        Ok(report)
    }

    /// One pass over every correction type.
    pub fn fill_all(&self) -> Result<Vec<BacklogReport>, BacklogError> {
        CorrectionType::ALL.iter().map(|&t| self.fill(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use crate::subjects::StaticSource;

    fn source(n: usize) -> Arc<StaticSource> {
        let mut s = StaticSource::new();
        for i in 0..n {
            s = s.with(CorrectionType::Pricing, &format!("car-{i}"), json!({"price_from": 1000 * i}));
        }
        Arc::new(s)
    }

    fn config(ceiling: usize, limit: usize) -> BacklogConfig {
        BacklogConfig {
            pending_ceiling: ceiling,
            batch_limit: limit,
            ..Default::default()
        }
    }

    #[test]
    fn creates_up_to_batch_limit_in_one_batch() {
        let store = Arc::new(InMemoryStore::new());
        let ctl = BacklogController::new(store.clone(), source(10), config(50, 4), 0.25);

        let report = ctl.fill(CorrectionType::Pricing).unwrap();
        assert_eq!(report.created, 4);
        assert_eq!(report.estimated_cost, 1.0);
        let batch_id = report.batch_id.unwrap();
        let summary = store.batch_summary(&batch_id).unwrap().unwrap();
        assert_eq!(summary.pending, 4);
        assert_eq!(summary.batch.estimated_cost, 1.0);
    }

    #[test]
    fn respects_pending_ceiling() {
        let store = Arc::new(InMemoryStore::new());
        let ctl = BacklogController::new(store.clone(), source(10), config(3, 10), 1.0);

        assert_eq!(ctl.fill(CorrectionType::Pricing).unwrap().created, 3);
        let second = ctl.fill(CorrectionType::Pricing).unwrap();
        assert!(second.ceiling_reached);
        assert_eq!(second.created, 0);
        assert!(second.batch_id.is_none());
        assert!(store.batches().unwrap().len() == 1);
    }

    #[test]
    fn skips_active_subjects() {
        let store = Arc::new(InMemoryStore::new());
        store.create("car-0", CorrectionType::Pricing, json!({"x": 1})).unwrap();
        let ctl = BacklogController::new(store.clone(), source(3), config(50, 10), 1.0);

        let report = ctl.fill(CorrectionType::Pricing).unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn cooldown_window_blocks_recent_corrections() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let item = store.create("car-0", CorrectionType::Pricing, json!({"x": 1})).unwrap();
        store.claim(&item.id).unwrap();
        store.complete(&item.id, json!({})).unwrap();
        let mut cfg = config(50, 10);
        cfg.cooldown_days = BTreeMap::from([(CorrectionType::Pricing, 3)]);
        let ctl = BacklogController::new(store.clone(), source(1), cfg, 1.0);

        clock.advance(Duration::days(2));
        let report = ctl.fill(CorrectionType::Pricing).unwrap();
        assert_eq!(report.cooldown_skipped, 1);
        assert_eq!(report.created, 0);

        clock.advance(Duration::days(2));
        assert_eq!(ctl.fill(CorrectionType::Pricing).unwrap().created, 1);
    }

    #[test]
    fn fill_all_reports_every_type() {
        let store = Arc::new(InMemoryStore::new());
        let ctl = BacklogController::new(store, source(2), config(50, 10), 1.0);
        let reports = ctl.fill_all().unwrap();
        assert_eq!(reports.len(), CorrectionType::ALL.len());
        assert_eq!(reports.iter().map(|r| r.created).sum::<usize>(), 2);
    }
}
