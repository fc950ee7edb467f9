//! SLURM `#SBATCH` directive spelling.

use crate::job::ResourceRequest;

/// Directive bodies for the populated resource fields.
pub fn resource_directives(resources: &ResourceRequest) -> Vec<String> {
    let mut directives = Vec::new();

    if let Some(hours) = resources.walltime_hours {
        directives.push(format!("-t {}", format_time(hours)));
    }
    if let Some(nodes) = resources.nodes {
        directives.push(format!("-N {}", nodes));
    }
    if let Some(gb) = resources.memory_gb {
        directives.push(format!("--mem={}gb", gb));
    }
    if let Some(mb) = resources.mem_per_cpu_mb {
        directives.push(format!("--mem-per-cpu={}M", mb));
    }
    if let Some(ref queue) = resources.queue {
        directives.push(format!("-p {}", queue));
    }
    if let Some(ref account) = resources.account {
        directives.push(format!("-A {}", account));
    }

    directives
}

/// Apply one directive body to `resources`.
///
/// Accepts both the short (`-t 02:00:00`) and long (`--time=02:00:00`)
/// spellings.
pub fn apply_directive(directive: &str, resources: &mut ResourceRequest) {
    let Some((flag, value)) = split_flag(directive) else {
        return;
    };

    match flag {
        "-t" | "--time" => {
            if let Some(hours) = parse_time(value) {
                resources.walltime_hours = Some(hours);
            }
        }
        "-N" | "--nodes" => {
            if let Ok(nodes) = value.parse() {
                resources.nodes = Some(nodes);
            }
        }
        "--mem" => {
            if let Some(gb) = parse_memory_gb(value) {
                resources.memory_gb = Some(gb);
            }
        }
        "--mem-per-cpu" => {
            let digits = value.trim_end_matches(['M', 'm']);
            if let Ok(mb) = digits.parse() {
                resources.mem_per_cpu_mb = Some(mb);
            }
        }
        "-p" | "--partition" => resources.queue = Some(value.to_string()),
        "-A" | "--account" => resources.account = Some(value.to_string()),
        _ => {}
    }
}

fn split_flag(directive: &str) -> Option<(&str, &str)> {
    let directive = directive.trim();
    let (flag, value) = if directive.starts_with("--") {
        directive
            .split_once('=')
            .or_else(|| directive.split_once(char::is_whitespace))?
    } else {
        directive.split_once(char::is_whitespace)?
    };
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some((flag.trim(), value))
    }
}

/// Format whole hours as a SLURM time limit. Days are never split out.
fn format_time(hours: u32) -> String {
    format!("{:02}:00:00", hours)
}

/// Whole hours of a `[D-]HH[:MM[:SS]]` time limit; minutes are dropped.
fn parse_time(value: &str) -> Option<u32> {
    let (days, clock) = match value.split_once('-') {
        Some((days, clock)) => (days.parse::<u32>().ok()?, clock),
        None => (0, value),
    };
    let hours: u32 = clock.split(':').next()?.parse().ok()?;
    Some(days * 24 + hours)
}

fn parse_memory_gb(value: &str) -> Option<u32> {
    let lower = value.to_lowercase();
    if let Some(gb) = lower.strip_suffix("gb").or_else(|| lower.strip_suffix('g')) {
        return gb.parse().ok();
    }
    // SLURM's default unit is megabytes.
    let mb: u32 = lower
        .strip_suffix("mb")
        .or_else(|| lower.strip_suffix('m'))
        .unwrap_or(&lower)
        .parse()
        .ok()?;
    (mb % 1024 == 0).then_some(mb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(1), "01:00:00");
        assert_eq!(format_time(23), "23:00:00");
        assert_eq!(format_time(48), "48:00:00");
        assert_eq!(format_time(120), "120:00:00");
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("02:00:00"), Some(2));
        assert_eq!(parse_time("1-06:00:00"), Some(30));
        assert_eq!(parse_time("12"), Some(12));
        assert_eq!(parse_time("soon"), None);
    }

    #[test]
    fn test_directive_order() {
        let resources = ResourceRequest::default()
            .with_account("emlab")
            .with_queue("batch")
            .with_walltime_hours(4);
        assert_eq!(
            resource_directives(&resources),
            vec!["-t 04:00:00", "-p batch", "-A emlab"]
        );
    }

    #[test]
    fn test_apply_long_spellings() {
        let mut resources = ResourceRequest::default();
        for directive in [
            "--time=1-00:00:00",
            "--nodes=2",
            "--mem=16G",
            "--mem-per-cpu=512",
            "--partition=gpu",
            "--account=cryo",
            "--gres=gpu:1",
        ] {
            apply_directive(directive, &mut resources);
        }
        assert_eq!(resources.walltime_hours, Some(24));
        assert_eq!(resources.nodes, Some(2));
        assert_eq!(resources.memory_gb, Some(16));
        assert_eq!(resources.mem_per_cpu_mb, Some(512));
        assert_eq!(resources.queue.as_deref(), Some("gpu"));
        assert_eq!(resources.account.as_deref(), Some("cryo"));
    }

    #[test]
    fn test_memory_units() {
        assert_eq!(parse_memory_gb("8gb"), Some(8));
        assert_eq!(parse_memory_gb("2048"), Some(2));
        assert_eq!(parse_memory_gb("1000M"), None);
    }
}
