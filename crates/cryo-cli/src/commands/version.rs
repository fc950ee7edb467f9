//! Version command implementation.

use console::style;

/// Execute the version command.
pub fn execute() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{} {} - cryo-EM processing on HPC batch schedulers",
        style("Cryo").cyan().bold(),
        style(format!("v{version}")).yellow()
    );
    println!();
    println!("Components:");
    println!("  cryo-sched  Scheduler adapters, job lifecycle, run registry");
    println!("  cryo-cli    Command-line interface");
    println!();
    println!("Schedulers: SLURM, PBS/Torque");
    println!("Engines:    ctffind4");
    println!("License:    {}", style("Apache-2.0").dim());
}
