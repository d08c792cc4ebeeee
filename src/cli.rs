//! Command-line interface built on clap.
//!
//! [`Cli`] carries the subcommands in [`Command`] (run, hash, status,
//! release, watch)
//! and global flags that override values from `fanout.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::anomaly::StragglerPolicy;
use crate::config::FanoutConfig;

/// Fan a batch job out to a scheduler and fan the results back in.
#[derive(Debug, Parser)]
#[command(name = "fanout", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./fanout.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Queue poll period in milliseconds.
    #[arg(long, global = true)]
    pub tick_ms: Option<u64>,

    /// Multiplier applied to the majority's mean run time.
    #[arg(long, global = true)]
    pub tolerance: Option<f64>,

    /// What to do with sub-tasks that miss the deadline or fail.
    #[arg(long, global = true)]
    pub policy: Option<PolicyArg>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Cancel stragglers and merge what finished.
    AcceptPartial,
    /// Fail and roll back the whole run.
    FailRun,
}

impl From<PolicyArg> for StragglerPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::AcceptPartial => StragglerPolicy::AcceptPartial,
            PolicyArg::FailRun => StragglerPolicy::FailRun,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs COMMAND as COUNT identical sub-tasks and merges their outputs.
    Run {
        /// Shell command each sub-task runs.
        #[arg(long)]
        command: String,

        /// Number of sub-tasks.
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Directory under which run directories are created.
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Glob selecting each sub-task's output files.
        #[arg(long)]
        output: String,

        /// Files, directories or `id:<name>` references staged into every sub-task.
        #[arg(required = true)]
        resources: Vec<String>,
    },

    /// Prints the content address of each file.
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Lists stored task records.
    Status,

    /// Frees a task hash still claimed by a run that died without cleaning up.
    Release {
        /// Task hash as printed by `status`.
        hash: String,
    },

    /// Streams completion events from the live queue until interrupted.
    Watch,
}

impl Cli {
    /// Folds the global flags into `config`.
    pub fn apply(&self, config: &mut FanoutConfig) {
        if let Some(tick_ms) = self.tick_ms {
            config.tick_ms = tick_ms;
        }
        if let Some(tolerance) = self.tolerance {
            config.tolerance_factor = tolerance;
        }
        if let Some(policy) = self.policy {
            config.straggler_policy = Some(policy.into());
        }
    }
}
