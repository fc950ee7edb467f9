//! Runs command implementation.
//!
//! Lists, shows and hides runs in the local store.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::common::{Overrides, load_config, open_store};

/// Execute the runs list command.
pub async fn execute_list(config: Option<&Path>, overrides: &Overrides, all: bool) -> Result<()> {
    let config = load_config(config, overrides)?;
    let store = open_store(&config).await?;

    let runs: Vec<_> = store
        .list_runs()
        .await?
        .into_iter()
        .filter(|run| all || !run.hidden)
        .collect();

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!("{} {} run(s):\n", style("→").cyan().bold(), runs.len());

    // Table header
    println!(
        "  {:<24}  {:<8}  {:<17}  {}",
        style("NAME").bold(),
        style("RESULTS").bold(),
        style("CREATED").bold(),
        style("PATH").bold()
    );
    println!("  {}", "-".repeat(90));

    for run in &runs {
        let results = store.load_results(&run.name).await?.len();
        let name = if run.hidden {
            style(format!("{} (hidden)", run.name)).dim()
        } else {
            style(run.name.clone())
        };
        println!(
            "  {:<24}  {:<8}  {:<17}  {}",
            name,
            results,
            run.created_at.format("%Y-%m-%d %H:%M"),
            style(run.path.display()).dim()
        );
    }

    Ok(())
}

/// Execute the runs show command.
pub async fn execute_show(
    config: Option<&Path>,
    overrides: &Overrides,
    name: &str,
    format: &str,
) -> Result<()> {
    let config = load_config(config, overrides)?;
    let store = open_store(&config).await?;

    let run = store
        .load_run(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run '{name}' not found"))?;
    let results = store.load_results(name).await?;

    match format.to_lowercase().as_str() {
        "json" => {
            let report = serde_json::json!({
                "run": run,
                "results": results,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "table" => {
            println!(
                "{} Run {} ({})",
                style("→").cyan().bold(),
                style(&run.name).green(),
                run.path.display()
            );
            println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("\n  Parameters:");
            for (key, value) in &run.parameters {
                println!("    {:<20} {}", key, style(value).yellow());
            }

            println!("\n  Results ({}):", results.len());
            for committed in &results {
                let fields = &committed.result.fields;
                println!(
                    "    {:<24} confidence {:>8.5}  defocus {:>9.1} / {:>9.1}  resolution {:>8.2}",
                    committed.result.item,
                    committed.result.confidence,
                    fields.get("defocus1").copied().unwrap_or(f64::NAN),
                    fields.get("defocus2").copied().unwrap_or(f64::NAN),
                    fields.get("resolution").copied().unwrap_or(f64::NAN),
                );
            }
        }
        other => anyhow::bail!("Unknown format: '{other}'. Available: table, json"),
    }

    Ok(())
}

/// Execute the runs hide and unhide commands.
pub async fn execute_hide(
    config: Option<&Path>,
    overrides: &Overrides,
    name: &str,
    hidden: bool,
) -> Result<()> {
    let config = load_config(config, overrides)?;
    let store = open_store(&config).await?;
    store.set_hidden(name, hidden).await?;

    println!(
        "{} Run {} is now {}",
        style("✓").green().bold(),
        style(name).cyan(),
        if hidden { "hidden" } else { "visible" }
    );
    Ok(())
}
