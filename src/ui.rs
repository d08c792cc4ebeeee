//! Terminal output: a spinner while a run is in flight and coloured results.
//!
//! [`RunView`] follows the orchestrator's progress channel with an
//! `indicatif` spinner and prints outcomes with `console` styles.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::FanoutError;
use crate::orchestrator::{RunOutcome, RunProgress};
use crate::state_machine::{RunState, RunSummary, SubTaskState};
use crate::store::TaskRecord;
use crate::watcher::CompletionEvent;

pub struct RunView {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunView {
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(label.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Mirrors every progress update into the spinner until the sender goes away.
    pub fn follow(&self, mut progress: watch::Receiver<RunProgress>) -> JoinHandle<()> {
        let pb = self.pb.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let current = progress.borrow_and_update().clone();
                pb.set_message(progress_message(&current));
            }
        })
    }

    pub fn succeeded(&self, outcome: &RunOutcome) {
        self.pb.finish_and_clear();
        if outcome.cached {
            println!(
                "  {} Served from an earlier run ({})",
                self.green.apply_to("✓"),
                outcome.hash
            );
        } else {
            println!("  {} Run completed ({})", self.green.apply_to("✓"), outcome.hash);
        }
        for output in &outcome.outputs {
            println!("    {}", output.display());
        }
        if !outcome.stragglers.is_empty() {
            println!(
                "  {} Stragglers cancelled: {:?}",
                self.yellow.apply_to("!"),
                outcome.stragglers
            );
        }
        if !outcome.failed.is_empty() {
            println!(
                "  {} Failed sub-tasks left out of the merge: {:?}",
                self.yellow.apply_to("!"),
                outcome.failed
            );
        }
        if let Some(summary) = &outcome.summary {
            self.print_summary(summary);
        }
    }

    pub fn failed(&self, err: &FanoutError) {
        self.pb.finish_and_clear();
        println!("  {} {}: {err}", self.red.apply_to("✗"), err.kind());
        if let Some(diagnostic) = err.diagnostic().filter(|d| !d.is_empty()) {
            println!("    {}", self.yellow.apply_to(diagnostic));
        }
    }

    fn print_summary(&self, summary: &RunSummary) {
        println!();
        println!("{}", self.green.apply_to("─── Run Summary ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }
}

fn progress_message(progress: &RunProgress) -> String {
    if progress.total == 0 {
        progress.state.to_string()
    } else {
        format!("{} {}/{}", progress.state, progress.finished, progress.total)
    }
}

/// One line per stored record.
pub fn print_records(records: &[TaskRecord]) {
    if records.is_empty() {
        println!("No task records.");
        return;
    }
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    let red = Style::new().red();
    for record in records {
        let style = if record.state == RunState::Completed {
            &green
        } else if record.is_in_flight() {
            &yellow
        } else {
            &red
        };
        println!("{}  {}", style.apply_to(record.state), record.hash);
        for output in &record.outputs {
            println!("    {}", output.display());
        }
    }
}

pub fn print_event(event: &CompletionEvent) {
    let style = match event.final_state {
        SubTaskState::Completed => Style::new().green(),
        _ => Style::new().red(),
    };
    println!(
        "{:>12}  {}  {:.1}s",
        event.job_id,
        style.apply_to(event.final_state),
        event.elapsed.as_secs_f64()
    );
}
