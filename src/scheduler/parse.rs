//! Text-protocol parsing for scheduler command output.
//!
//! Every format quirk of the backend lives here so that a change in the
//! scheduler's output shows up as a failing fixture test in this module.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::QueueEntry;
use crate::error::{FanoutError, Result};
use crate::state_machine::SubTaskState;

/// Extracts the job id from an `sbatch` acknowledgement such as
/// `Submitted batch job 4242`. A bare id (`--parsable` style, optionally
/// followed by `;cluster`) is accepted too.
pub fn parse_submit(stdout: &str) -> Result<String> {
    static SUBMITTED: OnceLock<Regex> = OnceLock::new();
    let re = SUBMITTED.get_or_init(|| {
        Regex::new(r"Submitted batch job (\S+)").expect("static regex is valid")
    });
    if let Some(caps) = re.captures(stdout) {
        return Ok(caps[1].to_string());
    }

    let trimmed = stdout.trim();
    let bare = trimmed.split(';').next().unwrap_or_default();
    if !bare.is_empty() && bare.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return Ok(bare.to_string());
    }
    Err(FanoutError::Parse(format!(
        "no job id in submit acknowledgement: {trimmed:?}"
    )))
}

/// Parses a tabular queue report.
///
/// The first non-blank line names the columns. Each following line is split
/// on whitespace and mapped positionally onto those names; the last column
/// absorbs any surplus tokens. `JOBID`, `ST` (or `STATE`) and `TIME` must be
/// present.
pub fn parse_queue(text: &str) -> Result<Vec<QueueEntry>> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<&str> = header_line.split_whitespace().collect();
    let column = |names: &[&str]| {
        header
            .iter()
            .position(|h| names.contains(h))
            .ok_or_else(|| {
                FanoutError::Parse(format!(
                    "queue header {header_line:?} lacks column {}",
                    names.join("/")
                ))
            })
    };
    let id_col = column(&["JOBID"])?;
    let state_col = column(&["ST", "STATE"])?;
    let time_col = column(&["TIME"])?;

    let mut entries = Vec::new();
    for line in lines {
        let row = map_row(&header, line)?;
        entries.push(QueueEntry {
            job_id: row[id_col].clone(),
            state: row[state_col].clone(),
            elapsed: parse_elapsed(&row[time_col])?,
        });
    }
    Ok(entries)
}

fn map_row(header: &[&str], line: &str) -> Result<Vec<String>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < header.len() {
        return Err(FanoutError::Parse(format!(
            "queue row has {} columns, header has {}: {line:?}",
            tokens.len(),
            header.len()
        )));
    }
    let last = header.len() - 1;
    let mut row: Vec<String> = tokens[..last].iter().map(|t| t.to_string()).collect();
    row.push(tokens[last..].join(" "));
    Ok(row)
}

/// Parses a scheduler elapsed-time field: `S`, `M:SS`, `H:MM:SS` or
/// `D-HH:MM:SS`.
pub fn parse_elapsed(field: &str) -> Result<Duration> {
    let invalid = || FanoutError::Parse(format!("invalid elapsed time {field:?}"));
    let (days, clock) = match field.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().map_err(|_| invalid())?, clock),
        None => (0, field),
    };
    let parts = clock
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<u64>>>()?;
    let (h, m, s) = match parts.as_slice() {
        [s] => (0, 0, *s),
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(((days * 24 + h) * 60 + m) * 60 + s))
}

/// Splits a `key=value` report into a flat map. Tokens without `=` are
/// skipped; a repeated key keeps its last value.
pub fn parse_inspect(text: &str) -> Result<HashMap<String, String>> {
    let map: HashMap<String, String> = text
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    if map.is_empty() {
        return Err(FanoutError::Parse(format!(
            "no key=value pairs in inspect report: {:?}",
            text.trim()
        )));
    }
    Ok(map)
}

/// Final state of a job that left the queue, judged from its inspect report.
/// Anything the backend does not report as a clean completion or a
/// cancellation counts as a failure.
pub fn final_state_from_inspect(report: &HashMap<String, String>) -> SubTaskState {
    let state = report
        .get("JobState")
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_default();
    match state.as_str() {
        "COMPLETED" => match report.get("ExitCode").map(String::as_str) {
            None | Some("0:0") => SubTaskState::Completed,
            Some(_) => SubTaskState::Failed,
        },
        "CANCELLED" | "PREEMPTED" | "REVOKED" => SubTaskState::Cancelled,
        _ => SubTaskState::Failed,
    }
}

/// Elapsed time from an inspect report's `RunTime`, when parseable.
pub fn elapsed_from_inspect(report: &HashMap<String, String>) -> Option<Duration> {
    report.get("RunTime").and_then(|t| parse_elapsed(t).ok())
}

/// `JobState`, `Reason` and `ExitCode` of a report as `key=value` pairs,
/// the part of a report worth showing when a job did not succeed.
pub fn diagnostic_from_inspect(report: &HashMap<String, String>) -> Option<String> {
    let pairs: Vec<String> = ["JobState", "Reason", "ExitCode"]
        .iter()
        .filter_map(|key| {
            report
                .get(*key)
                .filter(|value| !(*key == "Reason" && value.as_str() == "None"))
                .map(|value| format!("{key}={value}"))
        })
        .collect();
    (!pairs.is_empty()).then(|| pairs.join(" "))
}

/// Whether a queue state code means the job is executing.
pub fn is_running_state(code: &str) -> bool {
    matches!(code, "R" | "RUNNING" | "CG" | "COMPLETING")
}

/// Whether `scancel` output says the job was already gone.
pub fn is_already_finished(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already completing or completed") || lower.contains("invalid job id")
}
