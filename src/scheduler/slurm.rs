//! Slurm adapter: `sbatch`, `scancel`, `squeue` and `scontrol show job`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use super::parse;
use super::runner::{CommandOutput, CommandRunner, ProcessRunner};
use super::{CancelAck, QueueEntry, SchedulerClient};
use crate::config::SlurmConfig;
use crate::error::{FanoutError, Result};
use crate::state_machine::RetryConfig;

/// Pinned `squeue` layout. The parser maps columns by header name, but the
/// header itself must stay stable for a given backend version.
const SQUEUE_FORMAT: &str = "%.18i %.9P %.8j %.8u %.2t %.10M %.6D %R";

pub struct SlurmClient {
    binaries: SlurmConfig,
    retry: RetryConfig,
    runner: Arc<dyn CommandRunner>,
}

impl SlurmClient {
    pub fn new(binaries: SlurmConfig, retry: RetryConfig) -> Self {
        Self::with_runner(binaries, retry, Arc::new(ProcessRunner))
    }

    /// Client driving a custom runner (fixtures in tests, wrappers in prod).
    pub fn with_runner(
        binaries: SlurmConfig,
        retry: RetryConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            binaries,
            retry,
            runner,
        }
    }

    /// Runs a command, retrying retryable failures with exponential backoff.
    ///
    /// `accept` can declare a non-zero exit final (for example "already
    /// finished" on cancel). What counts as retryable is decided by
    /// [`FanoutError::is_retryable`].
    async fn run_with_retry(
        &self,
        program: &str,
        args: Vec<String>,
        accept: impl Fn(&CommandOutput) -> bool,
    ) -> Result<CommandOutput> {
        let mut attempt = 0;
        loop {
            let err = match self.runner.run(program, &args).await {
                Ok(output) if output.is_success() || accept(&output) => return Ok(output),
                Ok(output) => FanoutError::Command {
                    command: format!("{program} {}", args.join(" ")),
                    status: output.status,
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
                Err(e) => e,
            };

            attempt += 1;
            if !err.is_retryable() || attempt > self.retry.max_retries {
                return Err(err);
            }
            let delay_ms = self.retry.delay_for_attempt(attempt);
            warn!(
                program,
                attempt,
                max_retries = self.retry.max_retries,
                delay_ms,
                error = %err,
                "scheduler command failed, retrying"
            );
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

#[async_trait]
impl SchedulerClient for SlurmClient {
    async fn submit(&self, work_dir: &Path, script: &Path) -> Result<String> {
        let args = vec![
            "--chdir".to_string(),
            work_dir.display().to_string(),
            script.display().to_string(),
        ];
        let output = self
            .run_with_retry(&self.binaries.sbatch, args, |_| false)
            .await?;
        let job_id = parse::parse_submit(&output.stdout)?;
        info!(%job_id, work_dir = %work_dir.display(), "submitted job");
        Ok(job_id)
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelAck> {
        let output = self
            .run_with_retry(&self.binaries.scancel, vec![job_id.to_string()], |out| {
                parse::is_already_finished(&out.stderr)
            })
            .await?;
        if parse::is_already_finished(&output.stderr) {
            Ok(CancelAck::AlreadyFinished)
        } else {
            Ok(CancelAck::Cancelled)
        }
    }

    async fn queue(&self) -> Result<Vec<QueueEntry>> {
        let args = vec!["--format".to_string(), SQUEUE_FORMAT.to_string()];
        let output = self
            .run_with_retry(&self.binaries.squeue, args, |_| false)
            .await?;
        parse::parse_queue(&output.stdout)
    }

    async fn inspect(&self, job_id: &str) -> Result<HashMap<String, String>> {
        let args = vec!["show".to_string(), "job".to_string(), job_id.to_string()];
        let output = self
            .run_with_retry(&self.binaries.scontrol, args, |_| false)
            .await?;
        parse::parse_inspect(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Replays canned outputs per program and records every invocation.
    #[derive(Default)]
    struct FixtureRunner {
        responses: Mutex<HashMap<String, VecDeque<Result<CommandOutput>>>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FixtureRunner {
        fn push(&self, program: &str, response: Result<CommandOutput>) {
            self.responses
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(response);
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FixtureRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            self.responses
                .lock()
                .unwrap()
                .get_mut(program)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| panic!("no fixture left for {program}"))
        }
    }

    fn client(runner: Arc<FixtureRunner>, max_retries: u32) -> SlurmClient {
        SlurmClient::with_runner(
            SlurmConfig::default(),
            RetryConfig {
                max_retries,
                base_delay_ms: 100,
            },
            runner,
        )
    }

    #[tokio::test]
    async fn submit_parses_fixture_and_passes_chdir() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "sbatch",
            Ok(CommandOutput::success(include_str!(
                "../../tests/fixtures/slurm/sbatch.txt"
            ))),
        );
        let slurm = client(runner.clone(), 0);

        let id = slurm
            .submit(Path::new("/scratch/sub-0000"), Path::new("/scratch/sub-0000/run.sh"))
            .await
            .unwrap();
        assert_eq!(id, "4242");
        assert_eq!(
            runner.calls(),
            vec![(
                "sbatch".to_string(),
                vec![
                    "--chdir".to_string(),
                    "/scratch/sub-0000".to_string(),
                    "/scratch/sub-0000/run.sh".to_string()
                ]
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn command_errors_are_retried_then_succeed() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "sbatch",
            Ok(CommandOutput::failure(
                1,
                "sbatch: error: Batch job submission failed: Socket timed out on send/recv operation\n",
            )),
        );
        runner.push("sbatch", Ok(CommandOutput::success("Submitted batch job 77\n")));
        let slurm = client(runner.clone(), 3);

        let id = slurm
            .submit(&PathBuf::from("/w"), &PathBuf::from("/w/run.sh"))
            .await
            .unwrap();
        assert_eq!(id, "77");
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn command_errors_surface_after_retry_limit() {
        let runner = Arc::new(FixtureRunner::default());
        for _ in 0..3 {
            runner.push("squeue", Ok(CommandOutput::failure(1, "slurm_load_jobs error\n")));
        }
        let slurm = client(runner.clone(), 2);

        let err = slurm.queue().await.unwrap_err();
        assert_eq!(runner.calls().len(), 3);
        match err {
            FanoutError::Command { status, stderr, .. } => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "slurm_load_jobs error\n");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn backend_unavailable_is_not_retried() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "squeue",
            Err(FanoutError::BackendUnavailable {
                program: "squeue".into(),
                message: "No such file or directory".into(),
            }),
        );
        let slurm = client(runner.clone(), 5);

        let err = slurm.queue().await.unwrap_err();
        assert!(matches!(err, FanoutError::BackendUnavailable { .. }));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_spawn_failures_are_retried() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "scontrol",
            Err(FanoutError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut))),
        );
        runner.push(
            "scontrol",
            Ok(CommandOutput::success(include_str!(
                "../../tests/fixtures/slurm/scontrol_failed.txt"
            ))),
        );
        let slurm = client(runner.clone(), 2);

        let report = slurm.inspect("101").await.unwrap();
        assert_eq!(report.get("JobState").map(String::as_str), Some("FAILED"));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn queue_uses_pinned_format() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "squeue",
            Ok(CommandOutput::success(include_str!(
                "../../tests/fixtures/slurm/squeue.txt"
            ))),
        );
        let slurm = client(runner.clone(), 0);

        let entries = slurm.queue().await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries[0].is_running());
        assert!(!entries[2].is_running());
        assert_eq!(runner.calls()[0].1, vec!["--format", SQUEUE_FORMAT]);
    }

    #[tokio::test]
    async fn cancel_treats_already_finished_as_success() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "scancel",
            Ok(CommandOutput::failure(
                1,
                include_str!("../../tests/fixtures/slurm/scancel_already_completed.txt"),
            )),
        );
        runner.push("scancel", Ok(CommandOutput::success("")));
        let slurm = client(runner.clone(), 3);

        assert_eq!(slurm.cancel("100").await.unwrap(), CancelAck::AlreadyFinished);
        assert_eq!(slurm.cancel("101").await.unwrap(), CancelAck::Cancelled);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn inspect_reads_scontrol_report() {
        let runner = Arc::new(FixtureRunner::default());
        runner.push(
            "scontrol",
            Ok(CommandOutput::success(include_str!(
                "../../tests/fixtures/slurm/scontrol_completed.txt"
            ))),
        );
        let slurm = client(runner.clone(), 0);

        let report = slurm.inspect("100").await.unwrap();
        assert_eq!(report.get("JobState").map(String::as_str), Some("COMPLETED"));
        assert_eq!(runner.calls()[0].1, vec!["show", "job", "100"]);
    }
}
