//! Interface de terminal do corretor: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para estilização.
//! Os logs estruturados vão para stderr via `tracing`; este módulo escreve
//! apenas o resultado legível em stdout.

use std::collections::BTreeMap;
use std::fmt::Display;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use corrector::backlog::BacklogReport;
use corrector::maintenance::MaintenanceReport;
use corrector::metrics::MetricsSnapshot;
use corrector::scheduler::DrainReport;
use corrector::state_machine::{WorkItem, WorkStatus};

fn status_style(status: WorkStatus) -> Style {
    match status {
        WorkStatus::Completed | WorkStatus::NoChanges => Style::new().green(),
        WorkStatus::Failed => Style::new().red().bold(),
        WorkStatus::Processing => Style::new().cyan(),
        WorkStatus::Skipped => Style::new().dim(),
        WorkStatus::Pending => Style::new().yellow(),
    }
}

/// Spinner exibido enquanto uma operação demorada (drain, process) roda.
pub struct Progress {
    pb: ProgressBar,
}

impl Progress {
    /// Inicia o spinner com a mensagem dada.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}

/// Uma linha por item: id, status colorido, tipo, subject, tentativas.
pub fn print_items(items: &[WorkItem]) {
    if items.is_empty() {
        println!("{}", Style::new().dim().apply_to("no matching items"));
        return;
    }
    for item in items {
        let style = status_style(item.status);
        println!(
            "{}  {:<11} {:<13} {:<30} attempts={}",
            item.id,
            style.apply_to(item.status),
            item.correction_type,
            item.subject_key,
            item.attempts
        );
    }
    println!("{}", Style::new().dim().apply_to(format!("{} item(s)", items.len())));
}

/// Imprime o item completo formatado em JSON.
pub fn print_item(item: &WorkItem) {
    let style = status_style(item.status);
    println!("{}", style.apply_to(format!("─── {} ({}) ───", item.id, item.status)));
    println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
}

pub fn print_metrics(m: &MetricsSnapshot) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(format!("{} item(s)", m.total)));
    for (status, count) in &m.by_status {
        println!("  {:<11} {count}", status_style(*status).apply_to(status));
    }
    if !m.by_type.is_empty() {
        println!();
        for (correction_type, counts) in &m.by_type {
            let line: Vec<String> = counts.iter().map(|(s, c)| format!("{s}={c}")).collect();
            println!("  {:<13} {}", correction_type, line.join(" "));
        }
    }
    println!();
    println!("  estimated cost  {:.2}", m.estimated_cost);
    match m.success_rate {
        Some(rate) => println!("  success rate    {:.1}% (last {}h)", rate * 100.0, m.window_hours),
        None => println!("  success rate    n/a (nothing finished in the last {}h)", m.window_hours),
    }
}

/// Resultado por id de uma operação em lote; falhas em vermelho.
pub fn print_batch_results<T: Display>(results: &BTreeMap<String, Result<T, String>>) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    for (id, outcome) in results {
        match outcome {
            Ok(value) => println!("  {} {id}: {value}", green.apply_to("✓")),
            Err(e) => println!("  {} {id}: {e}", red.apply_to("✗")),
        }
    }
}

pub fn print_drain_report(report: &DrainReport) {
    println!(
        "claimed {} · completed {} · no changes {} · skipped {} · failed {}",
        report.claimed, report.completed, report.no_changes, report.skipped, report.failed
    );
    if report.store_errors > 0 {
        println!(
            "{}",
            Style::new()
                .red()
                .apply_to(format!("{} item(s) released after store errors", report.store_errors))
        );
    }
}

pub fn print_backlog_reports(reports: &[BacklogReport]) {
    for r in reports {
        let name = r
            .correction_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        if r.ceiling_reached {
            println!("  {:<13} {}", name, Style::new().yellow().apply_to("pending ceiling reached"));
            continue;
        }
        println!(
            "  {:<13} created {} · active {} · cooling down {} · est. cost {:.2}",
            name, r.created, r.duplicates, r.cooldown_skipped, r.estimated_cost
        );
    }
}

pub fn print_maintenance(report: &MaintenanceReport) {
    println!(
        "reclaimed {} · purged {} · collapsed {}",
        report.reclaimed, report.purged, report.collapsed
    );
}
