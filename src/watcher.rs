//! Queue watcher: one ticking poller for every run.
//!
//! Each tick takes a snapshot of the global queue and compares it with the
//! previous one. A job id present before and absent now has terminated; it
//! is inspected once and published as a [`CompletionEvent`] on a broadcast
//! channel. Runs subscribe and keep only the ids they submitted.
//!
//! Runs also announce the ids they just submitted. An announced id missing
//! from the very next snapshot finished before the watcher ever saw it and is
//! reported the same way, so short jobs are not lost between two ticks.
//!
//! A failed poll is skipped and the previous snapshot kept. After
//! `failure_limit` failed polls in a row, or at once when the backend is
//! unavailable, the watcher publishes [`WatchMessage::Halted`] and stops.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::{FanoutError, Result};
use crate::scheduler::{QueueEntry, SchedulerClient};
use crate::state_machine::SubTaskState;

const EVENT_CAPACITY: usize = 4096;
/// How many reported ids are remembered to keep late announcements from
/// producing a second event.
const REPORTED_MEMORY: usize = 4096;
/// Consecutive failed polls tolerated before the watcher halts.
pub const DEFAULT_FAILURE_LIMIT: u32 = 3;

/// A job that left the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub final_state: SubTaskState,
    pub elapsed: Duration,
    /// Backend explanation for a job that did not complete cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    Completed(CompletionEvent),
    /// The watcher stopped for good; carries the backend diagnostic.
    Halted(String),
}

/// Entries of `previous` whose job id is absent from `current`, in the
/// order they appear in `previous`.
pub fn disappeared<'a>(previous: &'a [QueueEntry], current: &[QueueEntry]) -> Vec<&'a QueueEntry> {
    let current_ids: HashSet<&str> = current.iter().map(|e| e.job_id.as_str()).collect();
    let mut seen = HashSet::new();
    previous
        .iter()
        .filter(|e| !current_ids.contains(e.job_id.as_str()))
        .filter(|e| seen.insert(e.job_id.as_str()))
        .collect()
}

pub struct QueueWatcher {
    client: Arc<dyn SchedulerClient>,
    tick: Duration,
    failure_limit: u32,
    previous: Option<Vec<QueueEntry>>,
    announced: HashSet<String>,
    reported: HashSet<String>,
    reported_order: VecDeque<String>,
}

impl QueueWatcher {
    pub fn new(client: Arc<dyn SchedulerClient>, tick: Duration) -> Self {
        Self {
            client,
            tick,
            failure_limit: DEFAULT_FAILURE_LIMIT,
            previous: None,
            announced: HashSet::new(),
            reported: HashSet::new(),
            reported_order: VecDeque::new(),
        }
    }

    /// Halts after `limit` consecutive failed polls (at least one).
    pub fn with_failure_limit(mut self, limit: u32) -> Self {
        self.failure_limit = limit.max(1);
        self
    }

    /// Registers freshly submitted ids for the next tick.
    pub fn announce(&mut self, ids: impl IntoIterator<Item = String>) {
        self.announced.extend(ids);
    }

    /// Takes one snapshot and returns the completions it reveals. On error
    /// the previous snapshot is kept, so nothing is lost by a failed tick.
    pub async fn poll_once(&mut self) -> Result<(Vec<CompletionEvent>, &[QueueEntry])> {
        let current = self.client.queue().await?;
        let current_ids: HashSet<&str> = current.iter().map(|e| e.job_id.as_str()).collect();

        let mut finished: Vec<(String, Option<Duration>)> = match &self.previous {
            Some(previous) => disappeared(previous, &current)
                .into_iter()
                .filter(|e| !self.reported.contains(&e.job_id))
                .map(|e| (e.job_id.clone(), Some(e.elapsed)))
                .collect(),
            None => Vec::new(),
        };
        let previous_ids: HashSet<&str> = self
            .previous
            .iter()
            .flatten()
            .map(|e| e.job_id.as_str())
            .collect();
        let mut unseen: Vec<String> = self
            .announced
            .drain()
            .filter(|id| {
                !current_ids.contains(id.as_str())
                    && !previous_ids.contains(id.as_str())
                    && !self.reported.contains(id)
            })
            .collect();
        unseen.sort();
        finished.extend(unseen.into_iter().map(|id| (id, None)));

        let mut events = Vec::with_capacity(finished.len());
        for (job_id, snapshot_elapsed) in finished {
            self.remember(&job_id);
            events.push(self.complete(job_id, snapshot_elapsed).await);
        }

        debug!(
            jobs = current.len(),
            completions = events.len(),
            "queue snapshot"
        );
        let snapshot = self.previous.insert(current);
        Ok((events, snapshot.as_slice()))
    }

    fn remember(&mut self, job_id: &str) {
        if self.reported.insert(job_id.to_string()) {
            self.reported_order.push_back(job_id.to_string());
        }
        while self.reported_order.len() > REPORTED_MEMORY {
            if let Some(oldest) = self.reported_order.pop_front() {
                self.reported.remove(&oldest);
            }
        }
    }

    async fn complete(&self, job_id: String, snapshot_elapsed: Option<Duration>) -> CompletionEvent {
        match self.client.inspect(&job_id).await {
            Ok(report) => {
                let final_state = self.client.final_state(&report);
                CompletionEvent {
                    final_state,
                    elapsed: self
                        .client
                        .reported_elapsed(&report)
                        .or(snapshot_elapsed)
                        .unwrap_or_default(),
                    diagnostic: if final_state == SubTaskState::Completed {
                        None
                    } else {
                        self.client.diagnostic(&report)
                    },
                    job_id,
                }
            }
            Err(e) => {
                warn!(%job_id, error = %e, "inspect failed, reporting job as failed");
                CompletionEvent {
                    job_id,
                    final_state: SubTaskState::Failed,
                    elapsed: snapshot_elapsed.unwrap_or_default(),
                    diagnostic: Some(format!("inspect failed: {e}")),
                }
            }
        }
    }

    /// Starts the tick loop on the runtime and returns the handle runs use.
    pub fn spawn(self) -> (WatcherHandle, JoinHandle<()>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Vec::new()));
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let halted = Arc::new(OnceLock::new());

        let handle = WatcherHandle {
            events: events.clone(),
            snapshot: snapshot_rx,
            announce: announce_tx,
            shutdown: Arc::new(shutdown_tx),
            halted: halted.clone(),
        };
        let task = tokio::spawn(self.run(events, snapshot_tx, announce_rx, shutdown_rx, halted));
        (handle, task)
    }

    async fn run(
        mut self,
        events: broadcast::Sender<WatchMessage>,
        snapshot: watch::Sender<Arc<Vec<QueueEntry>>>,
        mut announcements: mpsc::UnboundedReceiver<Vec<String>>,
        mut shutdown: watch::Receiver<bool>,
        halted: Arc<OnceLock<String>>,
    ) {
        let halt = |reason: String| {
            let _ = halted.set(reason.clone());
            let _ = events.send(WatchMessage::Halted(reason));
        };
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick.as_millis() as u64, "queue watcher started");
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            loop {
                match announcements.try_recv() {
                    Ok(ids) => self.announce(ids),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        info!("all watcher handles dropped, stopping");
                        return;
                    }
                }
            }

            match self.poll_once().await {
                Ok((completions, current)) => {
                    failures = 0;
                    snapshot.send_replace(Arc::new(current.to_vec()));
                    for event in completions {
                        debug!(job_id = %event.job_id, state = %event.final_state, "job left the queue");
                        // No subscriber is not an error: nobody is waiting for this job.
                        let _ = events.send(WatchMessage::Completed(event));
                    }
                }
                Err(e @ FanoutError::BackendUnavailable { .. }) => {
                    error!(error = %e, "scheduler unavailable, queue watcher halting");
                    halt(e.to_string());
                    return;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.failure_limit {
                        error!(error = %e, failures, "queue keeps failing, queue watcher halting");
                        halt(e.to_string());
                        return;
                    }
                    warn!(error = %e, failures, limit = self.failure_limit, "queue poll failed, skipping tick");
                }
            }
        }
        info!("queue watcher stopped");
    }
}

/// Shared access to a running [`QueueWatcher`]. Cheap to clone.
#[derive(Clone)]
pub struct WatcherHandle {
    events: broadcast::Sender<WatchMessage>,
    snapshot: watch::Receiver<Arc<Vec<QueueEntry>>>,
    announce: mpsc::UnboundedSender<Vec<String>>,
    shutdown: Arc<watch::Sender<bool>>,
    halted: Arc<OnceLock<String>>,
}

impl WatcherHandle {
    /// Why the watcher stopped, once it has halted on a backend error.
    pub fn halt_reason(&self) -> Option<String> {
        self.halted.get().cloned()
    }

    /// New receiver for every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchMessage> {
        self.events.subscribe()
    }

    /// Tells the watcher about ids that were just submitted.
    pub fn announce(&self, ids: Vec<String>) {
        if self.announce.send(ids).is_err() {
            warn!("queue watcher is gone, announcement dropped");
        }
    }

    /// Most recent queue snapshot.
    pub fn latest_snapshot(&self) -> Arc<Vec<QueueEntry>> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every successful tick.
    pub fn snapshots(&self) -> watch::Receiver<Arc<Vec<QueueEntry>>> {
        self.snapshot.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
