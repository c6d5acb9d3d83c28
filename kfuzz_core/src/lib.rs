pub mod cluster;
pub mod config;
pub mod failure;
pub mod overall;
pub mod pipeline;
pub mod reproducer;
pub mod runner;
pub mod stats;
pub mod store;
pub mod target;

pub use cluster::{
    ClusterError, ClusterOracle, CommandOracle, CrashClusterer, ExactTraceOracle, MigrationReport,
};
pub use config::{KfuzzConfig, ProgressStream, RunSettings};
pub use failure::{Failure, FailureRecord, RunOutcome};
pub use overall::{OverallError, OverallRow};
pub use pipeline::{Pipeline, PipelineError, TargetReport};
pub use reproducer::{ReproducerTemplate, ReproducerWriter, RustTestTemplate};
pub use runner::{LogCrateSink, LogSink, ProcessRunner, RunResult, RunnerError};
pub use stats::{CrashEvent, ParsedLog, StatsEntry, StatsError};
pub use store::{ArtifactStore, StoreError, TargetPaths};
pub use target::FuzzTarget;
