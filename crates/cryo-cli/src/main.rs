//! Cryo Command-Line Interface
//!
//! The main entry point for the `cryo` tool: drives ctffind4 CTF
//! estimation over a backlog of micrographs through a SLURM or PBS
//! cluster and manages the resulting runs.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::common::{Overrides, ResourceArgs};
use commands::{ctf, runs, script, version};

/// Cryo - cryo-EM image processing on HPC batch schedulers
#[derive(Parser)]
#[command(name = "cryo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "CRYO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate CTF parameters for a backlog of micrographs
    Ctf {
        /// Backlog file (YAML or JSON list of micrographs)
        #[arg(short, long)]
        backlog: PathBuf,

        /// Run name results are committed under
        #[arg(short, long)]
        run: String,

        /// Directory for scripts and engine output (default: <state_dir>/runs/<run>)
        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// Number of parallel workers
        #[arg(short = 'j', long)]
        workers: Option<usize>,

        /// Reprocess micrographs whose best confidence is at or below this value
        #[arg(long)]
        reprocess_below: Option<f64>,

        #[command(flatten)]
        overrides: Overrides,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Print the submission script for a command
    Script {
        /// Job name
        #[arg(short, long, default_value = "cryo-job")]
        name: String,

        /// Command run by the job
        #[arg(long = "command")]
        job_command: String,

        /// Batch scheduler (slurm, pbs)
        #[arg(long)]
        scheduler: Option<String>,

        /// Parse the directives back and print the recovered resources
        #[arg(long)]
        check: bool,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Inspect and manage runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,

        /// Store backend (json, sqlite)
        #[arg(long, global = true)]
        store: Option<String>,

        /// Directory holding run records and results
        #[arg(long, global = true)]
        state_dir: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs
    List {
        /// Include hidden runs
        #[arg(short, long)]
        all: bool,
    },

    /// Show a run's parameters and results
    Show {
        /// Run name
        name: String,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Hide a run from listings
    Hide {
        /// Run name
        name: String,
    },

    /// Make a hidden run visible again
    Unhide {
        /// Run name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let config = cli.config.as_deref();

    // Execute command
    let result = match cli.command {
        Commands::Ctf {
            backlog,
            run,
            run_dir,
            workers,
            reprocess_below,
            overrides,
            resources,
        } => {
            ctf::execute(ctf::CtfArgs {
                config,
                backlog: &backlog,
                run: &run,
                run_dir: run_dir.as_deref(),
                workers,
                reprocess_below,
                overrides: &overrides,
                resources: &resources,
            })
            .await
        }

        Commands::Script {
            name,
            job_command,
            scheduler,
            check,
            resources,
        } => script::execute(
            config,
            &name,
            &job_command,
            scheduler.as_deref(),
            &resources,
            check,
        ),

        Commands::Runs {
            action,
            store,
            state_dir,
        } => {
            let overrides = Overrides {
                store,
                state_dir,
                ..Overrides::default()
            };
            match action {
                RunsAction::List { all } => runs::execute_list(config, &overrides, all).await,
                RunsAction::Show { name, format } => {
                    runs::execute_show(config, &overrides, &name, &format).await
                }
                RunsAction::Hide { name } => {
                    runs::execute_hide(config, &overrides, &name, true).await
                }
                RunsAction::Unhide { name } => {
                    runs::execute_hide(config, &overrides, &name, false).await
                }
            }
        }

        Commands::Version => {
            version::execute();
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
