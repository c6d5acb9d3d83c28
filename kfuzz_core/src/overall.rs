//! Campaign-wide summary built from the per-target statistics exports.

use crate::stats::{self, StatsEntry, StatsError};
use crate::store::{ArtifactStore, StoreError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default file name of the combined summary, written under the store root.
pub const OVERALL_STATS_FILE: &str = "overall_stats.csv";

#[derive(Error, Debug)]
pub enum OverallError {
    #[error("No statistics found under {0:?}")]
    NoStatistics(PathBuf),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Final statistics of one target, labelled with the target's name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OverallRow {
    pub target_name: String,
    pub exec_count: u64,
    pub coverage: u64,
    pub features: u64,
    pub crashes: u64,
    pub time_seconds: u64,
}

impl OverallRow {
    fn new(target_name: String, last: &StatsEntry) -> Self {
        Self {
            target_name,
            exec_count: last.exec_count,
            coverage: last.coverage,
            features: last.features,
            crashes: last.crashes,
            time_seconds: last.time_seconds,
        }
    }
}

impl stats::CsvRecord for OverallRow {
    const HEADER: &'static [&'static str] = &[
        "target_name",
        "exec_count",
        "coverage",
        "features",
        "crashes",
        "time_seconds",
    ];
}

/// Collects the last row of every `stats/<target>.csv`, ordered by target.
/// Exports holding only a header are skipped.
pub fn collect(store: &ArtifactStore) -> Result<Vec<OverallRow>, OverallError> {
    let dir = store.stats_dir();
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
        let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("csv") {
            files.push(path);
        }
    }
    files.sort();

    let mut rows = Vec::new();
    for path in files {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let entries = stats::read_stats_csv(&path)?;
        match entries.last() {
            Some(last) => rows.push(OverallRow::new(name.to_string(), last)),
            None => debug!("Skipping empty statistics export {path:?}"),
        }
    }

    if rows.is_empty() {
        return Err(OverallError::NoStatistics(dir));
    }
    Ok(rows)
}

/// Writes the combined summary to `output` and returns the rows written.
pub fn write_overall(store: &ArtifactStore, output: &Path) -> Result<Vec<OverallRow>, OverallError> {
    let rows = collect(store)?;
    stats::write_csv_file(output, &rows)?;
    info!("Wrote overall statistics for {} targets to {output:?}", rows.len());
    Ok(rows)
}
