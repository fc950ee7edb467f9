//! Parsers for SLURM command output.

/// Extract the state code from `squeue -h -o %t` or `sacct -n -P -o State`.
///
/// Both print one line per job with the state first. `sacct` may append
/// detail (`CANCELLED by 1001`), so only the first word is kept. Empty
/// output means the command no longer knows the job.
pub fn parse_state_token(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(|token| token.trim_end_matches('+').to_string())
}
