use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use fanout::cas::ContentAddressableStore;
use fanout::cli::{Cli, Command};
use fanout::config::FanoutConfig;
use fanout::orchestrator::TaskOrchestrator;
use fanout::resolver::{DirectoryIdLookup, ResourceRef};
use fanout::scheduler::{SchedulerClient, SlurmClient};
use fanout::store::{JsonStore, TaskRecord};
use fanout::task::TaskRequest;
use fanout::ui::{self, RunView};
use fanout::watcher::{QueueWatcher, WatchMessage};

/// Where task records live when `store_path` is not configured.
const DEFAULT_STORE: &str = ".fanout/records.json";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "fanout=debug" } else { "fanout=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = FanoutConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    let cas = ContentAddressableStore::new(&config.cas_root, config.hash_algorithm);

    match cli.command {
        Command::Hash { files } => {
            for file in files {
                let address = cas
                    .hash(&file)
                    .with_context(|| format!("failed to hash {}", file.display()))?;
                println!("{address}  {}", file.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let store = open_store(&config)?;
            ui::print_records(&TaskRecord::list(&store)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Release { hash } => {
            let store = open_store(&config)?;
            if TaskRecord::release(&store, &hash)? {
                println!("released {hash}");
            } else {
                println!("no in-flight record for {hash}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch => watch(&config).await,
        Command::Run {
            command,
            count,
            work_dir,
            output,
            resources,
        } => {
            let policy = config.require_policy()?;
            let resources = resources
                .iter()
                .map(|r| r.parse::<ResourceRef>())
                .collect::<Result<Vec<_>, _>>()?;

            let scheduler: Arc<dyn SchedulerClient> =
                Arc::new(SlurmClient::new(config.slurm.clone(), config.retry()));
            let (watcher, watcher_task) = QueueWatcher::new(scheduler.clone(), config.tick())
                .with_failure_limit(config.max_failed_polls)
                .spawn();
            let store = Arc::new(open_store(&config)?);
            let mut orchestrator =
                TaskOrchestrator::new(scheduler, store, cas, watcher.clone(), policy)
                    .with_detector(config.detector())
                    .with_claim_poll(config.tick());
            if let Ok(root) = std::env::var("FANOUT_ID_ROOT") {
                orchestrator = orchestrator.with_id_lookup(Arc::new(DirectoryIdLookup::new(root)));
            }

            let view = RunView::start(&format!("{count} x {command}"));
            let follower = view.follow(orchestrator.progress());
            let result = orchestrator
                .run(TaskRequest {
                    work_dir,
                    sub_task_count: count,
                    command,
                    resources,
                    output_pattern: output,
                })
                .await;
            follower.abort();
            watcher.shutdown();
            let _ = watcher_task.await;

            match result {
                Ok(outcome) => {
                    view.succeeded(&outcome);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    view.failed(&err);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn open_store(config: &FanoutConfig) -> Result<JsonStore> {
    let path = config
        .store_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE));
    JsonStore::open(&path).with_context(|| format!("failed to open store {}", path.display()))
}

/// Prints completions from the live queue until Ctrl-C.
async fn watch(config: &FanoutConfig) -> Result<ExitCode> {
    let scheduler: Arc<dyn SchedulerClient> =
        Arc::new(SlurmClient::new(config.slurm.clone(), config.retry()));
    let (watcher, watcher_task) = QueueWatcher::new(scheduler, config.tick())
        .with_failure_limit(config.max_failed_polls)
        .spawn();
    let mut events = watcher.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = events.recv() => match message {
                Ok(WatchMessage::Completed(event)) => ui::print_event(&event),
                Ok(WatchMessage::Halted(reason)) => bail!("queue watcher halted: {reason}"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "dropped completion events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    watcher.shutdown();
    let _ = watcher_task.await;
    Ok(ExitCode::SUCCESS)
}
