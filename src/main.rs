mod cli;
mod ui;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info};

use cli::{Cli, Command};
use corrector::admin::Admin;
use corrector::anthropic::AnthropicClient;
use corrector::backlog::BacklogController;
use corrector::clock::{Clock, SystemClock};
use corrector::config::CorrectorConfig;
use corrector::escalation::EscalationExecutor;
use corrector::maintenance;
use corrector::metrics;
use corrector::orchestrator::CorrectionProcessor;
use corrector::pipeline;
use corrector::scheduler::{Drainer, LeaseRegistry, PeriodicRunner, PeriodicTask};
use corrector::store::{InMemoryStore, ItemFilter};
use corrector::subjects::JsonFileSource;
use corrector::telemetry;

type Processor = CorrectionProcessor<InMemoryStore, AnthropicClient>;

const SNAPSHOT_TASK: &str = "snapshot";
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

fn build_processor(config: &CorrectorConfig, store: &Arc<InMemoryStore>) -> Result<Processor> {
    if config.api_key.is_empty() {
        bail!("no API key: set ANTHROPIC_API_KEY or api_key in the config file");
    }
    let client = AnthropicClient::with_base_url(config.api_key.clone(), config.api_url.clone())
        .context("building HTTP client")?;
    let executor = EscalationExecutor::new(
        client,
        config.tiers.clone(),
        config.retry.clone(),
        config.validator.build(),
    );
    Ok(CorrectionProcessor::new(Arc::clone(store), Arc::new(executor)))
}

fn backlog_controller(config: &CorrectorConfig, store: &Arc<InMemoryStore>) -> BacklogController<InMemoryStore> {
    BacklogController::new(
        Arc::clone(store),
        Arc::new(JsonFileSource::new(&config.subjects_path)),
        config.backlog.clone(),
        config.per_item_cost,
    )
}

fn save(store: &InMemoryStore, path: &Path) -> Result<()> {
    store
        .save(path)
        .with_context(|| format!("saving store snapshot {}", path.display()))
}

async fn run(config: &CorrectorConfig, store: Arc<InMemoryStore>, clock: Arc<dyn Clock>) -> Result<()> {
    let processor = build_processor(config, &store)?;
    let backlog = Arc::new(backlog_controller(config, &store));

    let mut runner = PeriodicRunner::new(LeaseRegistry::new(clock));
    for task in pipeline::periodic_tasks(config, &processor, backlog) {
        runner.register(task)?;
    }
    let snapshot_store = Arc::clone(&store);
    let snapshot_path = config.state_path.clone();
    runner.register(PeriodicTask::new(SNAPSHOT_TASK, SNAPSHOT_INTERVAL, SNAPSHOT_INTERVAL, move || {
        let store = Arc::clone(&snapshot_store);
        let path = snapshot_path.clone();
        async move {
            if let Err(e) = store.save(&path) {
                error!(error = %e, path = %path.display(), "snapshot failed");
            }
        }
    }))?;

    info!(
        tasks = runner.tasks().len(),
        endpoint = processor.executor().client().endpoint(),
        "corrector running; Ctrl-C to stop"
    );
    let handle = runner.start();
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    handle.shutdown().await;
    info!("in-flight runs settled");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let config = CorrectorConfig::load(cli.config.as_deref())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        InMemoryStore::load(&config.state_path, Arc::clone(&clock))
            .with_context(|| format!("loading store snapshot {}", config.state_path.display()))?,
    );
    let admin = Admin::new(Arc::clone(&store));

    match cli.command {
        Command::Run => {
            run(&config, Arc::clone(&store), clock).await?;
        }

        Command::Fill { correction_type } => {
            let backlog = backlog_controller(&config, &store);
            let reports = match correction_type {
                Some(t) => vec![backlog.fill(t)?],
                None => backlog.fill_all()?,
            };
            ui::print_backlog_reports(&reports);
        }

        Command::Drain {
            correction_type,
            limit,
        } => {
            let drainer = Drainer::new(build_processor(&config, &store)?, correction_type, limit);
            let progress = ui::Progress::start(&format!("draining {correction_type}"));
            let report = drainer.drain_once().await;
            progress.finish();
            ui::print_drain_report(&report?);
        }

        Command::Maintain => {
            let report = maintenance::run_all(store.as_ref(), &config.maintenance)?;
            ui::print_maintenance(&report);
        }

        Command::Status {
            correction_type,
            window_hours,
        } => {
            let snapshot = metrics::collect(
                store.as_ref(),
                correction_type,
                config.per_item_cost,
                chrono::Duration::hours(window_hours),
            )?;
            ui::print_metrics(&snapshot);
        }

        Command::List {
            status,
            correction_type,
            subject,
            limit,
        } => {
            let items = admin.list(&ItemFilter {
                status,
                correction_type,
                subject_key: subject,
                limit,
            })?;
            ui::print_items(&items);
        }

        Command::Show { id } => ui::print_item(&admin.get(&id)?),

        Command::Process { ids, tier } => {
            let processor = build_processor(&config, &store)?;
            let start_tier = match tier {
                Some(name) => Some(
                    processor
                        .executor()
                        .tier_index(&name)
                        .with_context(|| format!("unknown tier '{name}'"))?,
                ),
                None => None,
            };
            let progress = ui::Progress::start(&format!("processing {} item(s)", ids.len()));
            let results = admin.trigger(&processor, &ids, start_tier).await;
            progress.finish();
            ui::print_batch_results(&results);
        }

        Command::Delete { ids } => {
            let results = admin.delete_many(&ids);
            let shown: BTreeMap<_, _> = results
                .into_iter()
                .map(|(id, r)| (id, r.map(|()| "deleted")))
                .collect();
            ui::print_batch_results(&shown);
        }
    }

    save(&store, &config.state_path)?;
    Ok(())
}
