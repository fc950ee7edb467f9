//! PBS `#PBS` directive spelling.

use crate::job::ResourceRequest;

/// Directive bodies for the populated resource fields.
pub fn resource_directives(resources: &ResourceRequest) -> Vec<String> {
    let mut directives = Vec::new();

    // Resource requests using -l flag
    if let Some(hours) = resources.walltime_hours {
        directives.push(format!("-l walltime={:02}:00:00", hours));
    }
    if let Some(nodes) = resources.nodes {
        directives.push(format!("-l nodes={}", nodes));
    }
    if let Some(gb) = resources.memory_gb {
        directives.push(format!("-l mem={}gb", gb));
    }
    if let Some(mb) = resources.mem_per_cpu_mb {
        directives.push(format!("-l pmem={}mb", mb));
    }

    if let Some(ref queue) = resources.queue {
        directives.push(format!("-q {}", queue));
    }
    if let Some(ref account) = resources.account {
        directives.push(format!("-A {}", account));
    }

    directives
}

/// Apply one directive body to `resources`.
///
/// A `-l` line may carry several comma-separated resources
/// (`-l nodes=1:ppn=4,walltime=2:00:00`).
pub fn apply_directive(directive: &str, resources: &mut ResourceRequest) {
    let Some((flag, value)) = directive.trim().split_once(char::is_whitespace) else {
        return;
    };
    let value = value.trim();

    match flag {
        "-l" => {
            for item in value.split(',') {
                if let Some((name, amount)) = item.split_once('=') {
                    apply_resource(name.trim(), amount.trim(), resources);
                }
            }
        }
        "-q" => resources.queue = Some(value.to_string()),
        "-A" => resources.account = Some(value.to_string()),
        _ => {}
    }
}

fn apply_resource(name: &str, amount: &str, resources: &mut ResourceRequest) {
    match name {
        "walltime" => {
            if let Some(Ok(hours)) = amount.split(':').next().map(str::parse) {
                resources.walltime_hours = Some(hours);
            }
        }
        "nodes" => {
            // "2:ppn=4" requests 2 nodes
            if let Some(Ok(nodes)) = amount.split(':').next().map(str::parse) {
                resources.nodes = Some(nodes);
            }
        }
        "mem" => {
            if let Some(gb) = strip_unit(amount, "gb") {
                resources.memory_gb = Some(gb);
            }
        }
        "pmem" => {
            if let Some(mb) = strip_unit(amount, "mb") {
                resources.mem_per_cpu_mb = Some(mb);
            }
        }
        _ => {}
    }
}

fn strip_unit(amount: &str, unit: &str) -> Option<u32> {
    amount.to_lowercase().strip_suffix(unit)?.parse().ok()
}
