use kfuzz_core::config::{KfuzzConfig, ProgressStream};
use kfuzz_core::failure::RunOutcome;
use kfuzz_core::overall::{self, OVERALL_STATS_FILE};
use kfuzz_core::pipeline::{self, Pipeline};
use kfuzz_core::store::ArtifactStore;
use kfuzz_core::target::FuzzTarget;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::{Env, TimestampPrecision};
use log::{info, warn};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "kfuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; `kfuzz.toml` in the working directory is used if present.
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine for each target, then parse, export and cluster.
    Run {
        /// Targets to run; defaults to every `[[targets]]` entry.
        #[clap(short, long)]
        target: Vec<String>,
        /// Number of targets processed concurrently.
        #[clap(short, long, default_value_t = 1)]
        jobs: usize,
    },
    /// Convert every stored log into statistics and crash CSVs.
    ParseLogs {
        /// Run duration in seconds; defaults to the configured time budget.
        #[clap(short, long)]
        duration: Option<u64>,
        #[clap(short, long, value_enum)]
        stream: Option<StreamArg>,
    },
    /// Migrate flat crashes into clusters for one or every target.
    Cluster {
        #[clap(short, long)]
        target: Vec<String>,
    },
    /// Combine the last statistics row of every target into one CSV.
    OverallStats {
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StreamArg {
    Stdout,
    Stderr,
}

impl From<StreamArg> for ProgressStream {
    fn from(arg: StreamArg) -> Self {
        match arg {
            StreamArg::Stdout => ProgressStream::Stdout,
            StreamArg::Stderr => ProgressStream::Stderr,
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<KfuzzConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            KfuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("Loading default configuration {default_config_path:?}");
                KfuzzConfig::load_from_file(&default_config_path)
            } else {
                info!("No configuration file found, using built-in defaults");
                Ok(KfuzzConfig::default())
            }
        }
    }
}

fn selected_targets(config: &KfuzzConfig, names: Vec<String>) -> Vec<FuzzTarget> {
    if names.is_empty() {
        config.fuzz_targets()
    } else {
        names.into_iter().map(FuzzTarget::new).collect()
    }
}

fn run(config: KfuzzConfig, targets: Vec<String>, jobs: usize) -> Result<(), anyhow::Error> {
    let targets = selected_targets(&config, targets);
    if targets.is_empty() {
        anyhow::bail!("No targets to run: pass --target or add [[targets]] to the configuration");
    }
    let pipeline = Pipeline::from_config(config).context("Failed to set up the pipeline")?;

    let mut failed = 0usize;
    for (target, result) in pipeline.run_all(&targets, jobs) {
        match result {
            Ok(report) => {
                let verdict = match &report.outcome {
                    RunOutcome::Passed => "passed".to_string(),
                    RunOutcome::Failed(failure) => format!("crashed ({})", failure.class_name),
                    RunOutcome::Undecodable(_) => "failed (no failure record)".to_string(),
                };
                println!(
                    "{target}: {verdict}, {} execs, cov {}, ft {}, {} crash events",
                    report.last_stats.exec_count,
                    report.last_stats.coverage,
                    report.last_stats.features,
                    report.crash_events
                );
                if let Ok(migration) = &report.migration {
                    if !migration.is_noop() {
                        println!(
                            "  clustered {} crashes ({} new clusters, {} reproducers)",
                            migration.flat_triads,
                            migration.clusters_created,
                            migration.reproducers_written
                        );
                    }
                }
            }
            Err(e) => {
                failed += 1;
                println!("{target}: error: {e}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} targets could not be processed", targets.len());
    }
    Ok(())
}

fn parse_logs(
    config: KfuzzConfig,
    duration: Option<u64>,
    stream: Option<StreamArg>,
) -> Result<(), anyhow::Error> {
    let store = ArtifactStore::open(config.store.root.clone())
        .with_context(|| format!("Failed to open store {:?}", config.store.root))?;
    let stream = stream.map_or(config.engine.progress_stream, ProgressStream::from);
    let duration = duration.unwrap_or(config.engine.max_total_time_secs);

    let converted = pipeline::convert_logs(&store, stream, duration)
        .context("Failed to convert logs to CSV")?;
    for log in &converted {
        if !log.parsed.has_progress_data() {
            warn!("{}: no progress data in {:?}", log.target, log.log);
        }
        println!(
            "{}: {} stats rows, {} crash events",
            log.target,
            log.parsed.timeline().len(),
            log.parsed.crashes().len()
        );
    }
    Ok(())
}

fn cluster(config: KfuzzConfig, targets: Vec<String>) -> Result<(), anyhow::Error> {
    let store = ArtifactStore::open(config.store.root.clone())
        .with_context(|| format!("Failed to open store {:?}", config.store.root))?;
    let clusterer =
        pipeline::clusterer_from_config(&config, pipeline::oracle_from_config(&config));

    let reports = if targets.is_empty() {
        pipeline::cluster_store(&store, &clusterer).context("Clustering pass failed")?
    } else {
        let mut reports = Vec::new();
        for name in targets {
            let target = FuzzTarget::new(name);
            let dir = store.paths(&target).reproducer_dir;
            let report = clusterer
                .migrate(&target, &dir)
                .with_context(|| format!("Clustering crashes of {target} failed"))?;
            reports.push((target, report));
        }
        reports
    };

    for (target, report) in reports {
        println!(
            "{target}: {} flat crashes, {} new clusters, {} reused, {} reproducers written",
            report.flat_triads,
            report.clusters_created,
            report.clusters_reused,
            report.reproducers_written
        );
    }
    Ok(())
}

fn overall_stats(config: KfuzzConfig, output: Option<PathBuf>) -> Result<(), anyhow::Error> {
    let store = ArtifactStore::open(config.store.root.clone())
        .with_context(|| format!("Failed to open store {:?}", config.store.root))?;
    let output = output.unwrap_or_else(|| store.root().join(OVERALL_STATS_FILE));
    let rows = overall::write_overall(&store, &output)
        .with_context(|| format!("Failed to write overall statistics to {output:?}"))?;
    println!("Wrote {} targets to {output:?}", rows.len());
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let log_env = Env::new()
        .filter_or("KFUZZ_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = load_config(cli.config_file)?;
    match cli.command {
        Commands::Run { target, jobs } => run(config, target, jobs),
        Commands::ParseLogs { duration, stream } => parse_logs(config, duration, stream),
        Commands::Cluster { target } => cluster(config, target),
        Commands::OverallStats { output } => overall_stats(config, output),
    }
}
