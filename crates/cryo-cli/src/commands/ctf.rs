//! CTF command implementation.
//!
//! Runs ctffind4 over a backlog with N parallel workers. Every worker walks
//! the whole backlog in order; claim markers in the run directory keep them
//! from duplicating work. The workers share a halt flag, so a run-fatal
//! error in one stops the others before their next item.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use cryo_sched::{
    ItemState, JobLifecycleManager, PipelineConfig, ProcessingLoop, RunRegistry, RunSummary,
    SystemRunner, WorkItem,
};

use super::common::{Overrides, ResourceArgs, load_backlog, load_config, open_store};

/// Arguments of the ctf command.
pub struct CtfArgs<'a> {
    pub config: Option<&'a Path>,
    pub backlog: &'a Path,
    pub run: &'a str,
    pub run_dir: Option<&'a Path>,
    pub workers: Option<usize>,
    pub reprocess_below: Option<f64>,
    pub overrides: &'a Overrides,
    pub resources: &'a ResourceArgs,
}

/// Execute the ctf command.
pub async fn execute(args: CtfArgs<'_>) -> Result<()> {
    let mut config = load_config(args.config, args.overrides)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.reprocess_below.is_some() {
        config.reprocess_threshold = args.reprocess_below;
    }
    config.resources = args.resources.apply(&config.resources);
    config.validate()?;

    let items = load_backlog(args.backlog)?;
    let run_dir = match args.run_dir {
        Some(dir) => dir.to_path_buf(),
        None => config.state_dir.join("runs").join(args.run),
    };

    println!(
        "{} Estimating CTF for {} micrograph(s) in run {} via {} ({} worker(s))",
        style("→").cyan().bold(),
        items.len(),
        style(args.run).green(),
        style(config.scheduler).magenta(),
        config.workers
    );
    println!("  Run directory: {}", style(run_dir.display()).dim());

    let summary = run_workers(&config, args.run, &run_dir, items).await?;
    print_summary(&summary.per_item());

    Ok(())
}

/// Run `config.workers` processing loops over the same backlog.
async fn run_workers(
    config: &PipelineConfig,
    run: &str,
    run_dir: &Path,
    items: Vec<WorkItem>,
) -> Result<RunSummary> {
    let store = open_store(config).await?;
    let registry = RunRegistry::new(store);
    let adapter = config.build_adapter(Arc::new(SystemRunner::default()));
    let lifecycle =
        Arc::new(JobLifecycleManager::new(adapter).with_config(config.lifecycle_config()));
    let engine = Arc::new(config.build_engine());

    let progress = MultiProgress::new();
    let bar_style = ProgressStyle::default_bar()
        .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .context("Invalid progress template")?
        .progress_chars("=> ");

    let halt = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(config.workers);
    for worker in 0..config.workers {
        let processing = ProcessingLoop::new(
            config.loop_config(run, run_dir),
            engine.clone(),
            lifecycle.clone(),
            registry.clone(),
        )
        .with_lock(config.lock.build())
        .with_halt(halt.clone());

        let bar = progress.add(ProgressBar::new(items.len() as u64));
        bar.set_style(bar_style.clone());
        bar.set_prefix(format!("worker {}", worker + 1));

        let items = items.clone();
        handles.push(tokio::spawn(async move {
            let result = processing
                .run_with(items, |outcome| {
                    bar.set_message(format!("{} {}", outcome.item, outcome.state));
                    if outcome.state != ItemState::Dispatched {
                        bar.inc(1);
                    }
                })
                .await;
            bar.finish_and_clear();
            result
        }));
    }

    let mut summary = RunSummary::new(run);
    let mut fatal = None;
    for handle in futures::future::join_all(handles).await {
        match handle.context("Worker panicked")? {
            Ok(worker_summary) => summary.merge(worker_summary),
            Err(e) if fatal.is_none() => fatal = Some(e),
            Err(e) => tracing::error!("Worker failed: {}", e),
        }
    }

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(summary),
    }
}

/// Print run totals.
pub fn print_summary(summary: &RunSummary) {
    let committed = summary.committed();
    let bad = summary.bad();

    println!(
        "\n{} Run {}: {} committed, {} skipped, {} bad",
        if bad == 0 {
            style("✓").green().bold()
        } else {
            style("!").yellow().bold()
        },
        style(&summary.run).cyan(),
        style(committed).green(),
        summary.skipped(),
        style(bad).red()
    );

    if let Some(stats) = summary.confidence_stats() {
        println!(
            "  Confidence: mean {:.4}, best {:.4}, worst {:.4} over {} micrograph(s)",
            stats.mean, stats.best, stats.worst, stats.count
        );
    }

    for outcome in summary.bad_items() {
        println!(
            "  {} {}: {}",
            style("✗").red(),
            outcome.item,
            outcome.message.as_deref().unwrap_or("")
        );
    }

    let unvisited = summary.unvisited();
    if unvisited > 0 {
        println!(
            "  {} item(s) were not reached before the run halted",
            style(unvisited).yellow()
        );
    }

    let locked = summary.count(ItemState::Locked);
    if locked > 0 {
        println!(
            "  {} item(s) were being processed by another worker",
            style(locked).dim()
        );
    }
}
