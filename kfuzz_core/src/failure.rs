//! Side channel for handing a structured failure from the fuzzing child back
//! to the parent once the child has exited.
//!
//! The child writes a tagged JSON record to its target's exception file just
//! before terminating abnormally:
//!
//! ```json
//! {"kind":"failure","payload":{"class_name":"...","message":"...","stack_trace":"..."}}
//! ```
//!
//! The parent only reads the record when the exit code is nonzero. A missing
//! or unreadable record is reported as [`RunOutcome::Undecodable`], never as a
//! pass.

use crate::store::StoreError;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// The failure object raised inside the child.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub class_name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack_trace: String,
}

/// Discriminated record stored in the exception file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum FailureRecord {
    None,
    Failure(Failure),
}

/// What the parent concludes about one finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code 0; the exception file is not consulted.
    Passed,
    /// Nonzero exit with a decodable failure record.
    Failed(Failure),
    /// Nonzero exit but no usable record. Carries the reason.
    Undecodable(String),
}

impl RunOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, RunOutcome::Passed)
    }
}

/// Writes `record` to `path` atomically (temp file in the same directory,
/// then rename), so the parent never observes a half-written record.
pub fn write_failure_record(path: &Path, record: &FailureRecord) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    let encoded = serde_json::to_vec(record).map_err(|e| StoreError::io(path, e.into()))?;
    tmp.write_all(&encoded)
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Removes a record left behind by a previous run of the same target.
pub fn clear_failure_record(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale failure record {path:?}");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Maps a finished child's exit code to a [`RunOutcome`], reading the failure
/// record only when the code is nonzero. `None` means the child was killed by
/// a signal and is treated like any other nonzero exit.
pub fn recover_outcome(exit_code: Option<i32>, record_path: &Path) -> RunOutcome {
    if exit_code == Some(0) {
        return RunOutcome::Passed;
    }
    let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());

    let bytes = match fs::read(record_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Child exited with {code} but its failure record {record_path:?} is unreadable: {e}");
            return RunOutcome::Undecodable(format!(
                "failure record {record_path:?} could not be read: {e}"
            ));
        }
    };

    match serde_json::from_slice::<FailureRecord>(&bytes) {
        Ok(FailureRecord::Failure(failure)) => RunOutcome::Failed(failure),
        Ok(FailureRecord::None) => RunOutcome::Undecodable(format!(
            "child exited with {code} but recorded no failure"
        )),
        Err(e) => {
            warn!("Failure record {record_path:?} is malformed: {e}");
            RunOutcome::Undecodable(format!("failure record {record_path:?} is malformed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_failure() -> Failure {
        Failure {
            class_name: "java.lang.IllegalStateException".to_string(),
            message: Some("boom".to_string()),
            stack_trace: "java.lang.IllegalStateException: boom\n\tat a.B.c(B.kt:1)".to_string(),
        }
    }

    #[test]
    fn exit_zero_passes_without_reading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.exception");
        fs::write(&path, "not even json").unwrap();
        assert_eq!(recover_outcome(Some(0), &path), RunOutcome::Passed);
    }

    #[test]
    fn nonzero_exit_recovers_written_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.exception");
        write_failure_record(&path, &FailureRecord::Failure(sample_failure())).unwrap();
        assert_eq!(
            recover_outcome(Some(1), &path),
            RunOutcome::Failed(sample_failure())
        );
    }

    #[test]
    fn missing_record_is_undecodable_not_passed() {
        let dir = tempdir().unwrap();
        let outcome = recover_outcome(Some(77), &dir.path().join("absent.exception"));
        assert!(matches!(outcome, RunOutcome::Undecodable(_)));
        assert!(!outcome.is_passed());
    }

    #[test]
    fn signal_death_is_treated_as_nonzero() {
        let dir = tempdir().unwrap();
        let outcome = recover_outcome(None, &dir.path().join("absent.exception"));
        assert!(matches!(outcome, RunOutcome::Undecodable(_)));
    }

    #[test]
    fn malformed_or_empty_record_is_undecodable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.exception");
        fs::write(&path, "{\"kind\":\"failure\"").unwrap();
        assert!(matches!(
            recover_outcome(Some(1), &path),
            RunOutcome::Undecodable(_)
        ));

        write_failure_record(&path, &FailureRecord::None).unwrap();
        match recover_outcome(Some(1), &path) {
            RunOutcome::Undecodable(reason) => assert!(reason.contains("recorded no failure")),
            other => panic!("Expected Undecodable, got {other:?}"),
        }
    }

    #[test]
    fn record_encoding_is_tagged() {
        let encoded = serde_json::to_value(FailureRecord::Failure(sample_failure())).unwrap();
        assert_eq!(encoded["kind"], "failure");
        assert_eq!(encoded["payload"]["message"], "boom");
        let none = serde_json::to_value(FailureRecord::None).unwrap();
        assert_eq!(none["kind"], "none");
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.exception");
        write_failure_record(&path, &FailureRecord::None).unwrap();
        clear_failure_record(&path).unwrap();
        assert!(!path.exists());
        clear_failure_record(&path).unwrap();
    }
}
