//! Script command implementation.
//!
//! Renders the submission script a job would get, without submitting it.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use cryo_sched::{Job, SystemRunner};

use super::common::{Overrides, ResourceArgs, load_config};

/// Execute the script command.
pub fn execute(
    config: Option<&Path>,
    name: &str,
    command: &str,
    scheduler: Option<&str>,
    resources: &ResourceArgs,
    check: bool,
) -> Result<()> {
    let overrides = Overrides {
        scheduler: scheduler.map(str::to_string),
        ..Overrides::default()
    };
    let config = load_config(config, &overrides)?;
    let adapter = config.build_adapter(Arc::new(SystemRunner::default()));

    let job = Job::new(name, command, ".").with_resources(resources.apply(&config.resources));
    let script = adapter.build_submission_script(&job);
    print!("{script}");

    if check {
        let recovered = adapter.parse_directives(&script);
        let matches = recovered == job.resources;
        eprintln!(
            "{} Directives parse back to {}",
            if matches {
                style("✓").green().bold()
            } else {
                style("✗").red().bold()
            },
            serde_json::to_string(&recovered)?
        );
        if !matches {
            anyhow::bail!("Script directives do not match the requested resources");
        }
    }

    Ok(())
}
