//! Groups crash triads into equivalence clusters with an external oracle and
//! migrates them from the flat layout into per-cluster directories.
//!
//! A triad is the set of files sharing one content-hash suffix:
//! `stacktrace-<h>`, `crash-<h>` and `reproducer-<h>.src`. In the flat layout
//! triads sit directly in a target's reproducer directory; after migration
//! they live in `cluster-<representative hash>/`.
//!
//! Migration copies every file of a triad, confirms each copy, and only then
//! removes the originals (stack trace last, since it is what makes a triad
//! visible to the next pass). A failed oracle call aborts before anything on
//! disk changes.

use crate::reproducer::{ReproducerError, ReproducerWriter, reproducer_file_name};
use crate::store::{StoreError, ensure_dir};
use crate::target::FuzzTarget;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;

pub const STACKTRACE_PREFIX: &str = "stacktrace-";
pub const CRASH_PREFIX: &str = "crash-";
pub const CLUSTER_PREFIX: &str = "cluster-";

const JAVA_STYLE_HEADER: &str = "Exception in thread \"main\" ";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Clustering oracle failed: {0:#}")]
    Oracle(anyhow::Error),
    #[error("Clustering oracle returned {got} ids for {expected} stack traces")]
    OracleLength { expected: usize, got: usize },
    #[error("Cluster I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Copy of {src:?} to {dst:?} could not be confirmed")]
    UnconfirmedCopy { src: PathBuf, dst: PathBuf },
    #[error(transparent)]
    Reproducer(#[from] ReproducerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClusterError {
    fn io(path: &Path, source: io::Error) -> Self {
        ClusterError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Opaque crash-equivalence classifier.
///
/// Returns one id per input trace, in input order. Equal ids mean "judged
/// equivalent"; ids only need to be consistent within a single call.
pub trait ClusterOracle: Send + Sync {
    fn cluster(&self, stack_traces: &[String]) -> Result<Vec<i64>, anyhow::Error>;
}

impl<F> ClusterOracle for F
where
    F: Fn(&[String]) -> Result<Vec<i64>, anyhow::Error> + Send + Sync,
{
    fn cluster(&self, stack_traces: &[String]) -> Result<Vec<i64>, anyhow::Error> {
        self(stack_traces)
    }
}

/// Runs an external oracle process: the traces go to its stdin as a JSON array
/// of strings, and a JSON array of integer ids is expected on its stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: Vec<String>,
}

impl CommandOracle {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ClusterOracle for CommandOracle {
    fn cluster(&self, stack_traces: &[String]) -> Result<Vec<i64>, anyhow::Error> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow::anyhow!("Oracle command is empty"))?;
        let payload = serde_json::to_vec(stack_traces)?;

        let mut child = Command::new(program)
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn oracle {:?}: {}", self.command, e))?;

        // Feed stdin from its own thread while wait_with_output drains the
        // other two pipes.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Oracle stdin was not available after piping"))?;
        let feeder = thread::spawn(move || stdin.write_all(&payload));

        let output = child.wait_with_output()?;
        let fed = feeder
            .join()
            .map_err(|_| anyhow::anyhow!("Oracle stdin feeder panicked"))?;

        if !output.status.success() {
            anyhow::bail!(
                "Oracle {:?} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        fed.map_err(|e| anyhow::anyhow!("Failed to write traces to oracle: {}", e))?;

        let ids: Vec<i64> = serde_json::from_slice(&output.stdout)
            .map_err(|e| anyhow::anyhow!("Oracle produced malformed output: {}", e))?;
        Ok(ids)
    }
}

/// Treats byte-identical traces as equivalent and nothing else.
///
/// Used when no real oracle is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactTraceOracle;

impl ClusterOracle for ExactTraceOracle {
    fn cluster(&self, stack_traces: &[String]) -> Result<Vec<i64>, anyhow::Error> {
        let mut seen: HashMap<&str, i64> = HashMap::new();
        Ok(stack_traces
            .iter()
            .map(|trace| {
                let next = seen.len() as i64;
                *seen.entry(trace.as_str()).or_insert(next)
            })
            .collect())
    }
}

/// Gives a trace the `Exception in thread "main" ` header the oracle's parser
/// expects, if it does not have one already.
pub fn normalize_stack_trace(raw: &str) -> String {
    let Some(first) = raw.lines().next() else {
        return raw.to_string();
    };
    if first.starts_with(JAVA_STYLE_HEADER) {
        return raw.to_string();
    }
    format!("{JAVA_STYLE_HEADER}{raw}")
}

/// One crash's files inside a directory, keyed by their shared hash suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashTriad {
    pub hash: String,
    pub dir: PathBuf,
}

impl CrashTriad {
    pub fn new(hash: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            hash: hash.into(),
            dir: dir.into(),
        }
    }

    pub fn stacktrace_path(&self) -> PathBuf {
        self.dir.join(format!("{STACKTRACE_PREFIX}{}", self.hash))
    }

    pub fn crash_path(&self) -> PathBuf {
        self.dir.join(format!("{CRASH_PREFIX}{}", self.hash))
    }

    pub fn reproducer_path(&self) -> PathBuf {
        self.dir.join(reproducer_file_name(&self.hash))
    }

    /// File names in deletion order: the stack trace goes last.
    fn file_names(&self) -> [String; 3] {
        [
            format!("{CRASH_PREFIX}{}", self.hash),
            reproducer_file_name(&self.hash),
            format!("{STACKTRACE_PREFIX}{}", self.hash),
        ]
    }
}

/// Lists the triads sitting directly in `dir`, ordered by hash. A triad is
/// recognised by its `stacktrace-<hash>` file.
pub fn flat_triads(dir: &Path) -> Result<Vec<CrashTriad>, ClusterError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut triads = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| ClusterError::io(dir, e))? {
        let entry = entry.map_err(|e| ClusterError::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| ClusterError::io(&entry.path(), e))?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(hash) = name.to_str().and_then(|n| n.strip_prefix(STACKTRACE_PREFIX)) else {
            continue;
        };
        if hash.is_empty() {
            continue;
        }
        triads.push(CrashTriad::new(hash, dir));
    }
    triads.sort_by(|a, b| a.hash.cmp(&b.hash));
    Ok(triads)
}

/// Lists the cluster directories under `dir` together with their members.
pub fn clusters(dir: &Path) -> Result<Vec<(PathBuf, Vec<CrashTriad>)>, ClusterError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| ClusterError::io(dir, e))? {
        let path = entry.map_err(|e| ClusterError::io(dir, e))?.path();
        let is_cluster = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(CLUSTER_PREFIX));
        if is_cluster && path.is_dir() {
            let members = flat_triads(&path)?;
            found.push((path, members));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Summary of one migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Triads found in the flat layout at the start of the pass.
    pub flat_triads: usize,
    pub clusters_created: usize,
    pub clusters_reused: usize,
    pub files_moved: usize,
    pub reproducers_written: usize,
    /// Clustered members that already had a reproducer.
    pub reproducers_skipped: usize,
    /// Final cluster directory of every triad migrated in this pass, by hash.
    pub placements: Vec<(String, PathBuf)>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.flat_triads == 0
    }
}

/// Maintains the flat → clustered migration for one target at a time.
///
/// Not safe to run concurrently with another pass, or with crash discovery,
/// on the same target.
pub struct CrashClusterer {
    oracle: Box<dyn ClusterOracle>,
    reproducers: Option<ReproducerWriter>,
}

impl CrashClusterer {
    pub fn new(oracle: Box<dyn ClusterOracle>) -> Self {
        Self {
            oracle,
            reproducers: None,
        }
    }

    pub fn with_reproducers(mut self, writer: ReproducerWriter) -> Self {
        self.reproducers = Some(writer);
        self
    }

    /// Runs one migration pass over `reproducer_dir`.
    ///
    /// Only triads still in the flat layout are submitted to the oracle, in
    /// hash order. A group whose member is already clustered goes to that
    /// member's cluster; otherwise it is stored in `cluster-<hash>` named
    /// after its first member, reusing an existing directory of that name.
    /// A rediscovered crash always returns to the cluster already holding it.
    /// Every member, the representative included, is removed from the flat
    /// layout once all its copies are confirmed.
    ///
    /// Reproducers are then backfilled for every clustered member lacking
    /// one, even when a move failed, so a pass interrupted halfway still
    /// leaves each settled crash replayable.
    pub fn migrate(
        &self,
        target: &FuzzTarget,
        reproducer_dir: &Path,
    ) -> Result<MigrationReport, ClusterError> {
        let triads = flat_triads(reproducer_dir)?;
        let mut report = MigrationReport {
            flat_triads: triads.len(),
            ..MigrationReport::default()
        };

        let moved = if triads.is_empty() {
            debug!("No flat crashes for {target}");
            Ok(())
        } else {
            self.cluster_flat(&triads, reproducer_dir, &mut report)
        };

        let filled = match &self.reproducers {
            Some(writer) => backfill_reproducers(writer, target, reproducer_dir, &mut report),
            None => Ok(()),
        };
        moved?;
        filled?;

        if !report.is_noop() || report.reproducers_written > 0 {
            info!(
                "Clustered {} crashes of {target}: {} new clusters, {} reused, {} reproducers written",
                report.flat_triads,
                report.clusters_created,
                report.clusters_reused,
                report.reproducers_written
            );
        }
        Ok(report)
    }

    fn cluster_flat(
        &self,
        triads: &[CrashTriad],
        reproducer_dir: &Path,
        report: &mut MigrationReport,
    ) -> Result<(), ClusterError> {
        let mut traces = Vec::with_capacity(triads.len());
        for triad in triads {
            let path = triad.stacktrace_path();
            let bytes = fs::read(&path).map_err(|e| ClusterError::io(&path, e))?;
            traces.push(normalize_stack_trace(&String::from_utf8_lossy(&bytes)));
        }

        let ids = self.oracle.cluster(&traces).map_err(ClusterError::Oracle)?;
        if ids.len() != triads.len() {
            return Err(ClusterError::OracleLength {
                expected: triads.len(),
                got: ids.len(),
            });
        }

        let settled = settled_members(reproducer_dir)?;
        let mut group_dirs: HashMap<i64, PathBuf> = HashMap::new();
        for (triad, id) in triads.iter().zip(&ids) {
            if let Some(dir) = settled.get(&triad.hash) {
                if let Entry::Vacant(slot) = group_dirs.entry(*id) {
                    slot.insert(dir.clone());
                    report.clusters_reused += 1;
                }
            }
        }

        let mut destinations = Vec::with_capacity(triads.len());
        for (triad, id) in triads.iter().zip(&ids) {
            let group = group_dirs.entry(*id).or_insert_with(|| {
                let dir = reproducer_dir.join(format!("{CLUSTER_PREFIX}{}", triad.hash));
                if dir.is_dir() {
                    report.clusters_reused += 1;
                } else {
                    report.clusters_created += 1;
                }
                dir
            });
            let dest = settled.get(&triad.hash).unwrap_or(&*group).clone();
            destinations.push(dest);
        }

        for (triad, dir) in triads.iter().zip(destinations) {
            ensure_dir(&dir)?;
            report.files_moved += move_triad(triad, &dir)?;
            report.placements.push((triad.hash.clone(), dir));
        }
        Ok(())
    }
}

/// Maps each clustered crash hash to the cluster directory holding it.
fn settled_members(reproducer_dir: &Path) -> Result<HashMap<String, PathBuf>, ClusterError> {
    let mut settled = HashMap::new();
    for (dir, members) in clusters(reproducer_dir)? {
        for member in members {
            settled.entry(member.hash).or_insert_with(|| dir.clone());
        }
    }
    Ok(settled)
}

fn backfill_reproducers(
    writer: &ReproducerWriter,
    target: &FuzzTarget,
    reproducer_dir: &Path,
    report: &mut MigrationReport,
) -> Result<(), ClusterError> {
    for (_, members) in clusters(reproducer_dir)? {
        for member in members {
            match fill_reproducer(writer, target, &member)? {
                Some(true) => report.reproducers_written += 1,
                Some(false) => report.reproducers_skipped += 1,
                None => {}
            }
        }
    }
    Ok(())
}

/// Copies every existing file of `triad` into `cluster_dir`, confirms the
/// copies, then deletes the originals. Returns the number of files moved.
fn move_triad(triad: &CrashTriad, cluster_dir: &Path) -> Result<usize, ClusterError> {
    let mut confirmed = Vec::new();
    for name in triad.file_names() {
        let src = triad.dir.join(&name);
        if !src.exists() {
            continue;
        }
        let dst = cluster_dir.join(&name);
        copy_confirmed(&src, &dst)?;
        confirmed.push(src);
    }
    for src in &confirmed {
        fs::remove_file(src).map_err(|e| ClusterError::io(src, e))?;
        debug!("Moved {src:?} into {cluster_dir:?}");
    }
    Ok(confirmed.len())
}

fn copy_confirmed(src: &Path, dst: &Path) -> Result<(), ClusterError> {
    let copied = fs::copy(src, dst).map_err(|e| ClusterError::io(dst, e))?;
    let src_len = fs::metadata(src)
        .map_err(|e| ClusterError::io(src, e))?
        .len();
    let dst_len = fs::metadata(dst)
        .map_err(|e| ClusterError::io(dst, e))?
        .len();
    if copied != src_len || dst_len != src_len {
        return Err(ClusterError::UnconfirmedCopy {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
    }
    Ok(())
}

/// Generates the reproducer of a settled triad if it has crash bytes and no
/// reproducer yet. `None` when there are no crash bytes to replay.
fn fill_reproducer(
    writer: &ReproducerWriter,
    target: &FuzzTarget,
    triad: &CrashTriad,
) -> Result<Option<bool>, ClusterError> {
    if triad.reproducer_path().exists() {
        return Ok(Some(false));
    }
    let crash_path = triad.crash_path();
    let crash = match fs::read(&crash_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No crash bytes for {crash_path:?}, skipping reproducer");
            return Ok(None);
        }
        Err(e) => return Err(ClusterError::io(&crash_path, e)),
    };
    let write = writer.write_if_missing(target, &crash, &triad.dir)?;
    if write.written && write.digest != triad.hash {
        warn!(
            "Crash {crash_path:?} has digest {}; its reproducer does not share the triad suffix",
            write.digest
        );
    }
    Ok(Some(write.written))
}
