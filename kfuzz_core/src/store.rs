use crate::target::FuzzTarget;
use log::debug;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while laying out the artifact store on disk.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A filesystem call on `path` failed.
    #[error("Store I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path that must be a directory exists as something else.
    #[error("Store path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

const CORPUS_DIR: &str = "corpus";
const LOGS_DIR: &str = "logs";
const EXCEPTIONS_DIR: &str = "exceptions";
const REPRODUCERS_DIR: &str = "reproducers";
const STATS_DIR: &str = "stats";
const CRASHES_DIR: &str = "crashes";

/// Extension of the captured stdout log.
pub const STDOUT_LOG_EXTENSION: &str = "log";
/// Extension of the captured stderr log.
pub const STDERR_LOG_EXTENSION: &str = "err";

/// Every on-disk location owned by one fuzz target.
///
/// Computing a `TargetPaths` never touches the filesystem; use
/// [`ArtifactStore::prepare`] to materialise the directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    pub corpus_dir: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub exception_file: PathBuf,
    pub reproducer_dir: PathBuf,
    pub stats_csv: PathBuf,
    pub crashes_csv: PathBuf,
}

/// The shared directory layout every other component reads and writes.
///
/// ```text
/// <root>/corpus/<target>/
/// <root>/logs/<target>.log, <target>.err
/// <root>/exceptions/<target>.exception
/// <root>/reproducers/<target>/{stacktrace-<h>, crash-<h>, reproducer-<h>.src, cluster-<h>/}
/// <root>/stats/<target>.csv
/// <root>/crashes/<target>.csv
/// ```
///
/// All creation is create-if-missing; existing files are never truncated here.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        ensure_dir(&store.root)?;
        for sub in [
            CORPUS_DIR,
            LOGS_DIR,
            EXCEPTIONS_DIR,
            REPRODUCERS_DIR,
            STATS_DIR,
            CRASHES_DIR,
        ] {
            ensure_dir(&store.root.join(sub))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.root.join(STATS_DIR)
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.root.join(CRASHES_DIR)
    }

    pub fn reproducers_dir(&self) -> PathBuf {
        self.root.join(REPRODUCERS_DIR)
    }

    pub fn paths(&self, target: &FuzzTarget) -> TargetPaths {
        let stem = target.file_stem();
        let logs = self.logs_dir();
        TargetPaths {
            corpus_dir: self.root.join(CORPUS_DIR).join(&stem),
            stdout_log: logs.join(format!("{stem}.{STDOUT_LOG_EXTENSION}")),
            stderr_log: logs.join(format!("{stem}.{STDERR_LOG_EXTENSION}")),
            exception_file: self
                .root
                .join(EXCEPTIONS_DIR)
                .join(format!("{stem}.exception")),
            reproducer_dir: self.reproducers_dir().join(&stem),
            stats_csv: self.stats_dir().join(format!("{stem}.csv")),
            crashes_csv: self.crashes_dir().join(format!("{stem}.csv")),
        }
    }

    /// Lazily creates the target's corpus directory, reproducer subtree and
    /// log-file pair. Safe to call any number of times.
    ///
    /// The exception file is deliberately left alone: its presence is the
    /// signal the failure channel reads.
    pub fn prepare(&self, target: &FuzzTarget) -> Result<TargetPaths, StoreError> {
        let paths = self.paths(target);
        ensure_dir(&paths.corpus_dir)?;
        ensure_dir(&paths.reproducer_dir)?;
        for log in [&paths.stdout_log, &paths.stderr_log] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .map_err(|e| StoreError::io(log, e))?;
        }
        debug!("Prepared store layout for {target}");
        Ok(paths)
    }

    /// Lists the file stems of every target that has a log with `extension`.
    pub fn logged_targets(&self, extension: &str) -> Result<Vec<String>, StoreError> {
        let logs = self.logs_dir();
        let mut stems = Vec::new();
        for entry in fs::read_dir(&logs).map_err(|e| StoreError::io(&logs, e))? {
            let path = entry.map_err(|e| StoreError::io(&logs, e))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    /// Lists the file stems of every target that owns a reproducer subtree.
    pub fn reproducer_targets(&self) -> Result<Vec<String>, StoreError> {
        let root = self.reproducers_dir();
        let mut stems = Vec::new();
        for entry in fs::read_dir(&root).map_err(|e| StoreError::io(&root, e))? {
            let path = entry.map_err(|e| StoreError::io(&root, e))?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                stems.push(name.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    if path.exists() {
        if !path.is_dir() {
            return Err(StoreError::NotADirectory(path.to_path_buf()));
        }
        return Ok(());
    }
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
