//! Parsers for PBS command output.

/// Extract the state column from brief `qstat <id>` output.
///
/// Default qstat output:
/// ```text
/// Job id            Name             User              Time Use S Queue
/// ----------------  ---------------- ----------------  -------- - -----
/// 12345.pbs-server  my_job           user              00:05:23 R batch
/// ```
pub fn parse_qstat_state(output: &str) -> Option<String> {
    // Skip header and separator
    output
        .lines()
        .skip(2)
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().nth(4))
        .map(str::to_string)
}
