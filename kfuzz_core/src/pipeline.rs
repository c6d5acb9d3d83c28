use crate::cluster::{
    ClusterError, ClusterOracle, CommandOracle, CrashClusterer, ExactTraceOracle, MigrationReport,
};
use crate::config::{KfuzzConfig, ProgressStream};
use crate::failure::RunOutcome;
use crate::reproducer::{ReproducerWriter, RustTestTemplate};
use crate::runner::{LogCrateSink, ProcessRunner, RunnerError};
use crate::stats::{self, ParsedLog, StatsEntry, StatsError};
use crate::store::{
    ArtifactStore, STDERR_LOG_EXTENSION, STDOUT_LOG_EXTENSION, StoreError, TargetPaths,
};
use crate::target::FuzzTarget;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("Worker thread for {0} panicked")]
    WorkerPanicked(String),
}

/// What one full cycle produced for a target.
#[derive(Debug)]
pub struct TargetReport {
    pub target: FuzzTarget,
    pub exit_code: Option<i32>,
    pub outcome: RunOutcome,
    /// Last point of the parsed timeline.
    pub last_stats: StatsEntry,
    pub crash_events: usize,
    pub has_progress_data: bool,
    /// A failed migration leaves the flat layout intact for the next pass,
    /// so it does not discard the rest of the report.
    pub migration: Result<MigrationReport, ClusterError>,
}

/// Result of converting one stored log into its CSV exports.
#[derive(Debug, Clone)]
pub struct ConvertedLog {
    pub target: FuzzTarget,
    pub log: PathBuf,
    pub parsed: ParsedLog,
}

/// Builds the oracle described by the configuration, falling back to exact
/// trace comparison when no external command is configured.
pub fn oracle_from_config(config: &KfuzzConfig) -> Box<dyn ClusterOracle> {
    match &config.oracle.command {
        Some(command) if !command.is_empty() => Box::new(CommandOracle::new(command.clone())),
        _ => {
            warn!("No clustering oracle configured; only identical stack traces will be grouped");
            Box::new(ExactTraceOracle)
        }
    }
}

pub fn clusterer_from_config(
    config: &KfuzzConfig,
    oracle: Box<dyn ClusterOracle>,
) -> CrashClusterer {
    let template = RustTestTemplate::new(config.reproducer.input_type.clone());
    CrashClusterer::new(oracle).with_reproducers(ReproducerWriter::new(Box::new(template)))
}

/// Drives run → recover → parse → export → cluster for each target.
pub struct Pipeline {
    config: KfuzzConfig,
    store: ArtifactStore,
    runner: ProcessRunner,
    clusterer: CrashClusterer,
}

impl Pipeline {
    pub fn new(
        config: KfuzzConfig,
        store: ArtifactStore,
        runner: ProcessRunner,
        clusterer: CrashClusterer,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            clusterer,
        }
    }

    /// Opens the configured store and wires every component from `config`.
    pub fn from_config(config: KfuzzConfig) -> Result<Self, PipelineError> {
        let store = ArtifactStore::open(config.store.root.clone())?;
        let runner = ProcessRunner::new(config.engine.clone()).with_sink(Arc::new(LogCrateSink));
        let clusterer = clusterer_from_config(&config, oracle_from_config(&config));
        Ok(Self::new(config, store, runner, clusterer))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &KfuzzConfig {
        &self.config
    }

    /// Runs one complete cycle for `target`.
    pub fn process_target(&self, target: &FuzzTarget) -> Result<TargetReport, PipelineError> {
        let paths = self.store.prepare(target)?;
        let settings = self.config.run_settings(target);
        let run = self.runner.run(target, &paths, &settings)?;

        match &run.outcome {
            RunOutcome::Passed => info!("{target} passed"),
            RunOutcome::Failed(failure) => info!(
                "{target} failed with {}: {}",
                failure.class_name,
                failure.message.as_deref().unwrap_or("<no message>")
            ),
            RunOutcome::Undecodable(reason) => warn!("{target} failed undecodably: {reason}"),
        }

        let log = progress_log(&paths, self.config.engine.progress_stream);
        let parsed = stats::parse_log_file(&log, settings.max_total_time_secs)?;
        stats::export_parsed(&parsed, &paths.stats_csv, &paths.crashes_csv)?;

        let migration = self.clusterer.migrate(target, &paths.reproducer_dir);
        if let Err(e) = &migration {
            warn!("Clustering crashes of {target} failed, flat layout kept: {e}");
        }

        Ok(TargetReport {
            target: target.clone(),
            exit_code: run.exit_code,
            outcome: run.outcome,
            last_stats: *parsed.last(),
            crash_events: parsed.crashes().len(),
            has_progress_data: parsed.has_progress_data(),
            migration,
        })
    }

    /// Processes `targets` on `jobs` worker threads. Results come back in the
    /// order of `targets`; one target's failure does not stop the others.
    pub fn run_all(
        &self,
        targets: &[FuzzTarget],
        jobs: usize,
    ) -> Vec<(FuzzTarget, Result<TargetReport, PipelineError>)> {
        let workers = jobs.max(1).min(targets.len().max(1));
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Result<TargetReport, PipelineError>>>> =
            Mutex::new((0..targets.len()).map(|_| None).collect());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(target) = targets.get(index) else {
                            break;
                        };
                        let result = self.process_target(target);
                        if let Err(e) = &result {
                            error!("Processing {target} failed: {e}");
                        }
                        let mut slots = slots.lock().unwrap_or_else(|p| p.into_inner());
                        slots[index] = Some(result);
                    }
                });
            }
        });

        let slots = slots.into_inner().unwrap_or_else(|p| p.into_inner());
        targets
            .iter()
            .cloned()
            .zip(slots)
            .map(|(target, slot)| {
                let result =
                    slot.unwrap_or_else(|| Err(PipelineError::WorkerPanicked(target.to_string())));
                (target, result)
            })
            .collect()
    }
}

fn progress_log(paths: &TargetPaths, stream: ProgressStream) -> PathBuf {
    match stream {
        ProgressStream::Stdout => paths.stdout_log.clone(),
        ProgressStream::Stderr => paths.stderr_log.clone(),
    }
}

/// Converts every stored log of the progress stream into the per-target
/// statistics and crash CSVs, using `duration_secs` as each run's duration.
pub fn convert_logs(
    store: &ArtifactStore,
    stream: ProgressStream,
    duration_secs: u64,
) -> Result<Vec<ConvertedLog>, PipelineError> {
    let extension = match stream {
        ProgressStream::Stdout => STDOUT_LOG_EXTENSION,
        ProgressStream::Stderr => STDERR_LOG_EXTENSION,
    };
    let mut converted = Vec::new();
    for stem in store.logged_targets(extension)? {
        let target = FuzzTarget::new(stem);
        let paths = store.paths(&target);
        let log = progress_log(&paths, stream);
        let parsed = stats::parse_log_file(&log, duration_secs)?;
        stats::export_parsed(&parsed, &paths.stats_csv, &paths.crashes_csv)?;
        converted.push(ConvertedLog {
            target,
            log,
            parsed,
        });
    }
    info!("Converted {} logs to CSV", converted.len());
    Ok(converted)
}

/// Runs a migration pass over every target that has a reproducer subtree.
pub fn cluster_store(
    store: &ArtifactStore,
    clusterer: &CrashClusterer,
) -> Result<Vec<(FuzzTarget, MigrationReport)>, PipelineError> {
    let mut reports = Vec::new();
    for stem in store.reproducer_targets()? {
        let target = FuzzTarget::new(stem);
        let dir = store.paths(&target).reproducer_dir;
        let report = clusterer.migrate(&target, &dir)?;
        reports.push((target, report));
    }
    Ok(reports)
}
