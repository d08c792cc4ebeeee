//! Top-level run lifecycle: dedup lookup, staging, fan-out, fan-in, merge.
//!
//! A [`TaskOrchestrator`] owns no clock of its own. Completions arrive from
//! the shared [`WatcherHandle`] and the [`AnomalyTimeoutDetector`] decides
//! when waiting stops. Anything that goes wrong after resources are staged
//! ends in [`TaskOrchestrator::rollback`] before the error is returned.
//!
//! Identical runs are kept apart twice: a per-hash lock inside one
//! orchestrator, and an in-flight [`TaskRecord`] claimed in the shared store
//! before anything touches the run directory. A run that finds the hash
//! claimed by someone else waits for the claim to resolve.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::anomaly::{AnomalyTimeoutDetector, CohortResolution, DetectorConfig, StragglerPolicy};
use crate::cas::ContentAddressableStore;
use crate::error::{FanoutError, Result};
use crate::resolver::{IdLookup, NoIdLookup, ResourceResolver};
use crate::scheduler::{QueueEntry, SchedulerClient};
use crate::state_machine::{RunState, RunSummary, StateMachine, SubTask, SubTaskState};
use crate::store::{Store, TaskRecord};
use crate::task::{TaskRequest, TaskSpec};
use crate::watcher::{CompletionEvent, WatchMessage, WatcherHandle};

/// One execution of a [`TaskSpec`]: its sub-tasks and lifecycle.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub spec: TaskSpec,
    pub sub_tasks: Vec<SubTask>,
    machine: StateMachine,
    started_at: DateTime<Utc>,
}

impl Run {
    pub fn new(spec: TaskSpec) -> Self {
        let sub_tasks = (0..spec.sub_task_count)
            .map(|index| SubTask::new(index, spec.sub_task_dir(index)))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            spec,
            sub_tasks,
            machine: StateMachine::default(),
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::new(
            &self.id,
            &self.spec.hash,
            self.machine.history(),
            &self.sub_tasks,
            self.started_at,
        )
    }

    fn indexes_in(&self, state: SubTaskState) -> Vec<usize> {
        self.sub_tasks
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.index)
            .collect()
    }
}

/// What `run()` hands back.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub hash: String,
    pub outputs: Vec<PathBuf>,
    /// Served from a stored record without touching the scheduler.
    pub cached: bool,
    /// Sub-tasks cancelled after missing the deadline.
    pub stragglers: Vec<usize>,
    /// Sub-tasks that ended Failed or Cancelled by the backend.
    pub failed: Vec<usize>,
    pub summary: Option<RunSummary>,
}

/// Latest progress of the run in flight, for the terminal spinner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub state: RunState,
    pub finished: usize,
    pub total: usize,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            state: RunState::Created,
            finished: 0,
            total: 0,
        }
    }
}

pub struct TaskOrchestrator {
    scheduler: Arc<dyn SchedulerClient>,
    store: Arc<dyn Store>,
    cas: ContentAddressableStore,
    lookup: Arc<dyn IdLookup>,
    watcher: WatcherHandle,
    detector: DetectorConfig,
    policy: StragglerPolicy,
    claim_poll: Duration,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    progress: watch::Sender<RunProgress>,
}

impl TaskOrchestrator {
    pub fn new(
        scheduler: Arc<dyn SchedulerClient>,
        store: Arc<dyn Store>,
        cas: ContentAddressableStore,
        watcher: WatcherHandle,
        policy: StragglerPolicy,
    ) -> Self {
        Self {
            scheduler,
            store,
            cas,
            lookup: Arc::new(NoIdLookup),
            watcher,
            detector: DetectorConfig::default(),
            policy,
            claim_poll: Duration::from_secs(1),
            in_flight: Mutex::new(HashMap::new()),
            progress: watch::Sender::new(RunProgress::default()),
        }
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_id_lookup(mut self, lookup: Arc<dyn IdLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// How often the store is re-read while another run holds the hash.
    pub fn with_claim_poll(mut self, every: Duration) -> Self {
        self.claim_poll = every;
        self
    }

    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    /// Resolves, fingerprints and then either serves the stored result or
    /// executes the task. Runs with the same hash are serialized.
    pub async fn run(&self, request: TaskRequest) -> Result<RunOutcome> {
        let spec = self.prepare(request).await?;
        let lock = self.hash_lock(&spec.hash);
        let outcome = {
            let _guard = lock.lock().await;
            self.run_exclusive(spec).await
        };
        drop(lock);
        outcome
    }

    /// Resolves resources into the content store and builds the spec.
    /// Nothing is submitted here, so errors are cheap.
    pub async fn prepare(&self, request: TaskRequest) -> Result<TaskSpec> {
        let cas = self.cas.clone();
        let lookup = self.lookup.clone();
        tokio::task::spawn_blocking(move || {
            let resolver = ResourceResolver::with_lookup(cas.clone(), lookup);
            let resources = resolver.resolve(&request.resources)?;
            TaskSpec::new(request, resources, &cas)
        })
        .await
        .map_err(|e| FanoutError::Io(io::Error::other(e)))?
    }

    async fn run_exclusive(&self, spec: TaskSpec) -> Result<RunOutcome> {
        let mut run = Run::new(spec);
        if let Some(record) = self.claim(&run).await? {
            info!(hash = %record.hash, "task already completed, serving stored outputs");
            return Ok(RunOutcome {
                hash: record.hash,
                outputs: record.outputs,
                cached: true,
                stragglers: Vec::new(),
                failed: Vec::new(),
                summary: None,
            });
        }

        info!(
            run_id = %run.id,
            hash = %run.spec.hash,
            sub_tasks = run.spec.sub_task_count,
            policy = %self.policy,
            "starting run"
        );
        match self.execute(&mut run).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(run_id = %run.id, error = %err, "run failed");
                if run.state() != RunState::Failed && !run.state().is_terminal() {
                    self.transition(&mut run, RunState::Failed)?;
                }
                if let Err(rollback_err) = self.rollback(&mut run).await {
                    warn!(run_id = %run.id, error = %rollback_err, "rollback incomplete");
                }
                if run.state() != RunState::Completed
                    && let Err(store_err) = self.record(&run, Vec::new())
                {
                    warn!(run_id = %run.id, error = %store_err, "failed to release task record");
                }
                Err(err)
            }
        }
    }

    /// Claims the run's hash in the store, waiting while another run holds
    /// it. Returns the completed record instead when there is one.
    async fn claim(&self, run: &Run) -> Result<Option<TaskRecord>> {
        let mut waiting = false;
        loop {
            match TaskRecord::claim(self.store.as_ref(), &run.spec.hash, &run.id)? {
                None => return Ok(None),
                Some(record) if record.state == RunState::Completed => return Ok(Some(record)),
                Some(record) => {
                    if !waiting {
                        info!(
                            run_id = %run.id,
                            hash = %run.spec.hash,
                            holder = record.run_id.as_deref().unwrap_or("unknown"),
                            "identical run in flight, waiting for it"
                        );
                        waiting = true;
                    }
                    sleep(self.claim_poll).await;
                }
            }
        }
    }

    /// Writes the run's current state and outputs as its task record.
    fn record(&self, run: &Run, outputs: Vec<PathBuf>) -> Result<()> {
        TaskRecord {
            hash: run.spec.hash.clone(),
            outputs,
            state: run.state(),
            run_id: Some(run.id.clone()),
        }
        .upsert(self.store.as_ref())?;
        Ok(())
    }

    async fn execute(&self, run: &mut Run) -> Result<RunOutcome> {
        self.stage(run).await?;

        // Subscribe before the first submit so no completion can slip by.
        let events = self.watcher.subscribe();
        self.submit(run).await?;
        let start = Instant::now();

        self.transition(run, RunState::AwaitingCompletion)?;
        let resolution = self.await_cohort(run, events, start).await?;

        let mut stragglers = Vec::new();
        if let CohortResolution::Stragglers { indexes, deadline } = resolution {
            warn!(
                run_id = %run.id,
                ?indexes,
                deadline_ms = deadline.as_millis() as u64,
                "stragglers missed the deadline"
            );
            match self.policy {
                StragglerPolicy::FailRun => {
                    return Err(FanoutError::StragglerDetected {
                        indexes,
                        deadline_ms: deadline.as_millis() as u64,
                    });
                }
                StragglerPolicy::AcceptPartial => {
                    self.cancel_sub_tasks(run, &indexes).await?;
                    stragglers = indexes;
                }
            }
        }

        self.transition(run, RunState::Merging)?;
        let merged = self.merge(run).await?;
        self.transition(run, RunState::Completed)?;

        let outputs = vec![merged];
        self.record(run, outputs.clone())?;

        let mut failed = run.indexes_in(SubTaskState::Failed);
        failed.extend(
            run.indexes_in(SubTaskState::Cancelled)
                .into_iter()
                .filter(|i| !stragglers.contains(i)),
        );
        failed.sort_unstable();
        info!(run_id = %run.id, outputs = ?outputs, "run completed");
        Ok(RunOutcome {
            hash: run.spec.hash.clone(),
            outputs,
            cached: false,
            stragglers,
            failed,
            summary: Some(run.summary()),
        })
    }

    /// Lays out one directory per sub-task holding every resource and the
    /// job script. Directories are filled in parallel.
    pub async fn stage(&self, run: &mut Run) -> Result<()> {
        let run_dir = run.spec.run_dir();
        if tokio::fs::try_exists(&run_dir).await? {
            debug!(run_dir = %run_dir.display(), "removing leftovers of an earlier run");
            tokio::fs::remove_dir_all(&run_dir).await?;
        }

        let files = run
            .spec
            .resources
            .iter()
            .map(|r| -> Result<(PathBuf, PathBuf)> {
                Ok((self.cas.path_for(&r.address)?, r.relative.clone()))
            })
            .collect::<Result<Vec<(PathBuf, PathBuf)>>>()?;
        let files = Arc::new(files);

        let mut staging = JoinSet::new();
        for sub_task in &run.sub_tasks {
            let dir = sub_task.work_dir.clone();
            let script = run.spec.script(sub_task.index);
            let files = files.clone();
            staging.spawn(async move { stage_dir(&dir, &files, &script).await });
        }
        while let Some(joined) = staging.join_next().await {
            joined.map_err(|e| FanoutError::Io(io::Error::other(e)))??;
        }

        info!(
            run_id = %run.id,
            run_dir = %run_dir.display(),
            files = files.len(),
            "resources staged"
        );
        self.transition(run, RunState::ResourcesStaged)?;
        Ok(())
    }

    /// Submits every pending sub-task and announces its id to the watcher.
    pub async fn submit(&self, run: &mut Run) -> Result<()> {
        for sub_task in run.sub_tasks.iter_mut() {
            if sub_task.state != SubTaskState::Pending {
                continue;
            }
            let script = TaskSpec::script_path(&sub_task.work_dir);
            let job_id = self.scheduler.submit(&sub_task.work_dir, &script).await?;
            self.watcher.announce(vec![job_id.clone()]);
            sub_task.mark_submitted(job_id)?;
        }
        self.transition(run, RunState::SubTasksSubmitted)?;
        Ok(())
    }

    /// Feeds this run's completions into the detector until the cohort is
    /// complete or the deadline elapses.
    async fn await_cohort(
        &self,
        run: &mut Run,
        mut events: broadcast::Receiver<WatchMessage>,
        start: Instant,
    ) -> Result<CohortResolution> {
        let by_job: HashMap<String, usize> = run
            .sub_tasks
            .iter()
            .filter_map(|s| s.backend_job_id.clone().map(|id| (id, s.index)))
            .collect();
        let mut detector = AnomalyTimeoutDetector::new(run.sub_tasks.len(), self.detector);
        let mut snapshots = self.watcher.snapshots();
        self.mark_running(run, &by_job, &self.watcher.latest_snapshot());

        loop {
            if detector.is_complete() {
                return Ok(CohortResolution::Complete);
            }
            tokio::select! {
                message = events.recv() => match message {
                    Ok(WatchMessage::Completed(event)) => {
                        let Some(&index) = by_job.get(&event.job_id) else {
                            continue;
                        };
                        if !self.record_completion(run, index, &event)? {
                            continue;
                        }
                        detector.record(index, event.elapsed);
                        self.report_progress(run);
                        if event.final_state != SubTaskState::Completed
                            && self.policy == StragglerPolicy::FailRun
                        {
                            return Err(FanoutError::SubTaskFailed {
                                index,
                                job_id: event.job_id,
                                state: event.final_state.to_string(),
                                diagnostic: event.diagnostic,
                            });
                        }
                    }
                    Ok(WatchMessage::Halted(reason)) => {
                        return Err(FanoutError::WatcherHalted(reason));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Err(FanoutError::WatcherHalted(format!(
                            "run fell behind the event stream by {missed} events"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(FanoutError::WatcherHalted("event stream closed".into()));
                    }
                },
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        let reason = self
                            .watcher
                            .halt_reason()
                            .unwrap_or_else(|| "queue watcher stopped".into());
                        return Err(FanoutError::WatcherHalted(reason));
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.mark_running(run, &by_job, &snapshot);
                }
                _ = detector.expired(start) => {
                    return Ok(detector.resolution());
                }
            }
        }
    }

    /// Applies a completion to its sub-task. Returns false for a sub-task
    /// that was already terminal.
    fn record_completion(&self, run: &mut Run, index: usize, event: &CompletionEvent) -> Result<bool> {
        let sub_task = &mut run.sub_tasks[index];
        if sub_task.is_terminal() {
            return Ok(false);
        }
        sub_task.finish(event.final_state, event.elapsed)?;
        info!(
            run_id = %run.id,
            index,
            job_id = %event.job_id,
            state = %event.final_state,
            elapsed_ms = event.elapsed.as_millis() as u64,
            "sub-task finished"
        );
        Ok(true)
    }

    fn mark_running(&self, run: &mut Run, by_job: &HashMap<String, usize>, snapshot: &[QueueEntry]) {
        for entry in snapshot.iter().filter(|e| e.is_running()) {
            let Some(&index) = by_job.get(&entry.job_id) else {
                continue;
            };
            let sub_task = &mut run.sub_tasks[index];
            if sub_task.state == SubTaskState::Submitted
                && sub_task.advance(SubTaskState::Running).is_ok()
            {
                debug!(run_id = %run.id, index, job_id = %entry.job_id, "sub-task running");
            }
        }
    }

    async fn cancel_sub_tasks(&self, run: &mut Run, indexes: &[usize]) -> Result<()> {
        for &index in indexes {
            let sub_task = &mut run.sub_tasks[index];
            if sub_task.is_terminal() {
                continue;
            }
            if let Some(job_id) = sub_task.backend_job_id.clone() {
                match self.scheduler.cancel(&job_id).await {
                    Ok(ack) => debug!(%job_id, ?ack, "cancel acknowledged"),
                    Err(e) => warn!(%job_id, error = %e, "cancel failed"),
                }
            }
            sub_task.advance(SubTaskState::Cancelled)?;
        }
        Ok(())
    }

    /// Concatenates the outputs of every completed sub-task, in index order,
    /// into the run's merged artifact.
    async fn merge(&self, run: &Run) -> Result<PathBuf> {
        let dirs: Vec<PathBuf> = run
            .sub_tasks
            .iter()
            .filter(|s| s.state == SubTaskState::Completed)
            .map(|s| s.work_dir.clone())
            .collect();
        let pattern = run.spec.output_pattern.clone();
        let target = run.spec.merged_path();
        let merged = target.clone();

        let parts = tokio::task::spawn_blocking(move || merge_outputs(&dirs, &pattern, &merged))
            .await
            .map_err(|e| FanoutError::Io(io::Error::other(e)))??;
        info!(run_id = %run.id, parts, merged = %target.display(), "outputs merged");
        Ok(target)
    }

    /// Cancels what is still running, deletes the run directory and marks
    /// the run rolled back. A second call does nothing.
    pub async fn rollback(&self, run: &mut Run) -> Result<()> {
        if run.state() == RunState::RolledBack {
            debug!(run_id = %run.id, "already rolled back");
            return Ok(());
        }

        let pending: Vec<usize> = run
            .sub_tasks
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.index)
            .collect();
        self.cancel_sub_tasks(run, &pending).await?;

        let run_dir = run.spec.run_dir();
        match tokio::fs::remove_dir_all(&run_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.transition(run, RunState::RolledBack)?;
        info!(run_id = %run.id, cancelled = pending.len(), "run rolled back");
        Ok(())
    }

    fn transition(&self, run: &mut Run, next: RunState) -> Result<()> {
        let from = run.state();
        run.machine.transition(next)?;
        info!(run_id = %run.id, %from, to = %next, "run state changed");
        self.report_progress(run);
        Ok(())
    }

    fn report_progress(&self, run: &Run) {
        self.progress.send_replace(RunProgress {
            state: run.state(),
            finished: run.sub_tasks.iter().filter(|s| s.is_terminal()).count(),
            total: run.sub_tasks.len(),
        });
    }

    fn hash_lock(&self, hash: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // Forget locks nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(hash.to_string()).or_default().clone()
    }
}

async fn stage_dir(dir: &Path, files: &[(PathBuf, PathBuf)], script: &str) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (blob, relative) in files {
        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(blob, &target).await?;
    }
    let script_path = TaskSpec::script_path(dir);
    tokio::fs::write(&script_path, script).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

/// Appends every file under each of `dirs` whose relative path matches
/// `pattern` to `target`. Returns how many files were appended.
fn merge_outputs(dirs: &[PathBuf], pattern: &str, target: &Path) -> Result<usize> {
    let mut sources = Vec::new();
    for dir in dirs {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if glob_match::glob_match(pattern, &relative) {
                sources.push(entry.into_path());
            }
        }
    }
    if sources.is_empty() {
        return Err(FanoutError::Merge(format!(
            "no completed sub-task produced files matching {pattern:?}"
        )));
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(target)?);
    for source in &sources {
        io::copy(&mut File::open(source)?, &mut out)?;
    }
    out.flush()?;
    Ok(sources.len())
}
