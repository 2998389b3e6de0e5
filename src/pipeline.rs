//! Wires the configured lanes, backlog and maintenance into periodic tasks.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::anthropic::MessageSender;
use crate::backlog::BacklogController;
use crate::config::{CorrectorConfig, LaneMode};
use crate::maintenance;
use crate::metrics;
use crate::orchestrator::CorrectionProcessor;
use crate::scheduler::{Drainer, PeriodicTask};
use crate::store::WorkItemStore;

pub const BACKLOG_TASK: &str = "backlog";
pub const MAINTENANCE_TASK: &str = "maintenance";

/// One periodic task per configured lane, plus the backlog and maintenance
/// cadences.
pub fn periodic_tasks<S, C>(
    config: &CorrectorConfig,
    processor: &CorrectionProcessor<S, C>,
    backlog: Arc<BacklogController<S>>,
) -> Vec<PeriodicTask>
where
    S: WorkItemStore + 'static,
    C: MessageSender + 'static,
{
    let mut tasks = Vec::with_capacity(config.lanes.len() + 2);

    for lane in &config.lanes {
        let correction_type = lane.correction_type;
        let name = lane.name.clone();
        let task = match lane.mode {
            LaneMode::Mutating => {
                let drainer = Arc::new(Drainer::new(processor.clone(), correction_type, lane.claim_limit));
                PeriodicTask::new(&lane.name, lane.interval(), lane.lease_timeout(), move || {
                    let drainer = Arc::clone(&drainer);
                    let name = name.clone();
                    async move {
                        if let Err(e) = drainer.drain_once().await {
                            error!(lane = %name, error = %e, "drain failed");
                        }
                    }
                })
            }
            LaneMode::Stats => {
                let store = Arc::clone(processor.store());
                let cost = config.per_item_cost;
                PeriodicTask::new(&lane.name, lane.interval(), lane.lease_timeout(), move || {
                    let store = Arc::clone(&store);
                    let name = name.clone();
                    async move {
                        if let Err(e) = metrics::log_lane_stats(store.as_ref(), &name, correction_type, cost) {
                            error!(lane = %name, error = %e, "stats lane failed");
                        }
                    }
                })
            }
        };
        tasks.push(task);
    }

    let backlog_interval = Duration::from_secs(config.backlog.interval_secs);
    tasks.push(PeriodicTask::new(BACKLOG_TASK, backlog_interval, backlog_interval, move || {
        let backlog = Arc::clone(&backlog);
        async move {
            if let Err(e) = backlog.fill_all() {
                error!(error = %e, "backlog pass failed");
            }
        }
    }));

    let store = Arc::clone(processor.store());
    let maintenance_config = config.maintenance.clone();
    let maintenance_interval = Duration::from_secs(maintenance_config.interval_secs);
    tasks.push(PeriodicTask::new(
        MAINTENANCE_TASK,
        maintenance_interval,
        maintenance_interval,
        move || {
            let store = Arc::clone(&store);
            let config = maintenance_config.clone();
            async move {
                if let Err(e) = maintenance::run_all(store.as_ref(), &config) {
                    error!(error = %e, "maintenance pass failed");
                }
            }
        },
    ));

    tasks
}
