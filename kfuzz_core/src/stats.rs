use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// First token of the line the engine prints when it writes a crash artifact:
/// `artifact_prefix='./'; Test unit written to ./crash-<sha1>`.
pub const CRASH_MARKER: &str = "artifact_prefix=";
/// Progress tags that carry a usable `cov:`/`ft:` pair.
pub const PROGRESS_TAGS: [&str; 3] = ["NEW", "REDUCE", "pulse"];

const CRASH_PATH_FIELD: usize = 5;
const MIN_PROGRESS_FIELDS: usize = 14;
const COVERAGE_FIELD: usize = 3;
const FEATURE_FIELD: usize = 5;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Failed to read log {path:?}: {source}")]
    ReadLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error for {path:?}: {source}")]
    CsvFile {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One point of a run's statistics timeline.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsEntry {
    pub exec_count: u64,
    pub coverage: u64,
    pub features: u64,
    pub crashes: u64,
    pub time_seconds: u64,
}

/// A crash announcement, attributed to the last progress point seen before it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashEvent {
    pub exec_count: u64,
    pub artifact_path: String,
    pub time_seconds: u64,
}

/// Column names written as the header row of each CSV export.
pub trait CsvRecord: Serialize + DeserializeOwned {
    const HEADER: &'static [&'static str];
}

impl CsvRecord for StatsEntry {
    const HEADER: &'static [&'static str] =
        &["exec_count", "coverage", "features", "crashes", "time_seconds"];
}

impl CsvRecord for CrashEvent {
    const HEADER: &'static [&'static str] = &["exec_count", "artifact_path", "time_seconds"];
}

/// Parsed form of one run's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLog {
    /// Never empty: the first entry is the synthetic zero anchor.
    timeline: Vec<StatsEntry>,
    crashes: Vec<CrashEvent>,
}

impl ParsedLog {
    pub fn timeline(&self) -> &[StatsEntry] {
        &self.timeline
    }

    pub fn crashes(&self) -> &[CrashEvent] {
        &self.crashes
    }

    /// `false` when the log contained no recognised progress line, in which
    /// case the timeline is only the anchor and every timestamp is 0.
    pub fn has_progress_data(&self) -> bool {
        self.max_exec_count() > 0
    }

    pub fn max_exec_count(&self) -> u64 {
        self.timeline.iter().map(|e| e.exec_count).max().unwrap_or(0)
    }

    pub fn last(&self) -> &StatsEntry {
        // Only `parse_log` builds a ParsedLog, and it always seeds the anchor.
        &self.timeline[self.timeline.len() - 1]
    }
}

/// Converts captured engine output into a statistics timeline and a list of
/// crash events sharing one timestamp function.
///
/// Lines are scanned in order. A crash-marker line yields a [`CrashEvent`] at
/// the exec count of the latest timeline entry. A `#<n> <TAG> ...` line with a
/// recognised tag and at least 14 fields yields a [`StatsEntry`] whose crash
/// count is the number of crash events seen so far. Everything else is ignored.
///
/// Timestamps are interpolated afterwards as
/// `exec_count * duration_secs / max_exec_count` (floor), so the last entry
/// never exceeds `duration_secs`.
pub fn parse_log(text: &str, duration_secs: u64) -> ParsedLog {
    let mut timeline = vec![StatsEntry::default()];
    let mut crashes = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }

        if tokens[0].starts_with(CRASH_MARKER) {
            let Some(path) = tokens.get(CRASH_PATH_FIELD) else {
                debug!("Crash marker without artifact path: {line:?}");
                continue;
            };
            let last_exec = timeline.last().map_or(0, |e: &StatsEntry| e.exec_count);
            crashes.push(CrashEvent {
                exec_count: last_exec,
                artifact_path: path.to_string(),
                time_seconds: 0,
            });
        } else if let Some(entry) = parse_progress(&tokens, crashes.len() as u64) {
            let last_exec = timeline.last().map_or(0, |e: &StatsEntry| e.exec_count);
            if entry.exec_count < last_exec {
                debug!(
                    "Dropping progress line going backwards ({} < {last_exec})",
                    entry.exec_count
                );
                continue;
            }
            timeline.push(entry);
        }
    }

    let max_exec = timeline.iter().map(|e| e.exec_count).max().unwrap_or(0);
    for entry in &mut timeline {
        entry.time_seconds = interpolate(entry.exec_count, duration_secs, max_exec);
    }
    for crash in &mut crashes {
        crash.time_seconds = interpolate(crash.exec_count, duration_secs, max_exec);
    }

    ParsedLog { timeline, crashes }
}

/// Reads and parses a log file. Bytes that are not valid UTF-8 are replaced,
/// since engines may echo raw inputs.
pub fn parse_log_file(path: &Path, duration_secs: u64) -> Result<ParsedLog, StatsError> {
    let bytes = fs::read(path).map_err(|source| StatsError::ReadLog {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = parse_log(&String::from_utf8_lossy(&bytes), duration_secs);
    if !parsed.has_progress_data() {
        warn!("No progress data in {path:?}");
    }
    Ok(parsed)
}

fn parse_progress(tokens: &[&str], crashes_so_far: u64) -> Option<StatsEntry> {
    let exec = tokens[0].strip_prefix('#')?;
    if tokens.len() < MIN_PROGRESS_FIELDS || !PROGRESS_TAGS.contains(&tokens[1]) {
        return None;
    }
    Some(StatsEntry {
        exec_count: exec.parse().ok()?,
        coverage: tokens[COVERAGE_FIELD].parse().ok()?,
        features: tokens[FEATURE_FIELD].parse().ok()?,
        crashes: crashes_so_far,
        time_seconds: 0,
    })
}

fn interpolate(exec_count: u64, duration_secs: u64, max_exec: u64) -> u64 {
    if max_exec == 0 {
        return 0;
    }
    (u128::from(exec_count) * u128::from(duration_secs) / u128::from(max_exec)) as u64
}

/// Writes a header row followed by one row per record, in the given order.
pub fn write_records<W: Write, T: CsvRecord>(writer: W, records: &[T]) -> Result<(), StatsError> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record(T::HEADER)?;
    for record in records {
        csv_writer.serialize(record)?;
    }
    csv_writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn read_records<R: Read, T: CsvRecord>(reader: R) -> Result<Vec<T>, StatsError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut records = Vec::new();
    for record in csv_reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

pub fn write_csv_file<T: CsvRecord>(path: &Path, records: &[T]) -> Result<(), StatsError> {
    let file = File::create(path).map_err(|e| StatsError::CsvFile {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    write_records(file, records).map_err(|e| match e {
        StatsError::Csv(source) => StatsError::CsvFile {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

pub fn read_csv_file<T: CsvRecord>(path: &Path) -> Result<Vec<T>, StatsError> {
    let file = File::open(path).map_err(|e| StatsError::CsvFile {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    read_records(file).map_err(|e| match e {
        StatsError::Csv(source) => StatsError::CsvFile {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

pub fn read_stats_csv(path: &Path) -> Result<Vec<StatsEntry>, StatsError> {
    read_csv_file(path)
}

pub fn read_crash_csv(path: &Path) -> Result<Vec<CrashEvent>, StatsError> {
    read_csv_file(path)
}

/// Writes the two per-run exports: the statistics timeline and the crash events.
pub fn export_parsed(
    parsed: &ParsedLog,
    stats_csv: &Path,
    crashes_csv: &Path,
) -> Result<(), StatsError> {
    write_csv_file(stats_csv, &parsed.timeline)?;
    write_csv_file(crashes_csv, &parsed.crashes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CRASH_LINE: &str =
        "artifact_prefix='./'; Test unit written to ./crash-0123456789abcdef0123456789abcdef01234567";

    fn progress(exec: u64, tag: &str, cov: u64, ft: u64) -> String {
        format!(
            "#{exec}\t{tag}    cov: {cov} ft: {ft} corp: 2/3b lim: 4 exec/s: 0 rss: 41Mb L: 2/2 MS: 1 ChangeBit-"
        )
    }

    #[test]
    fn crash_before_progress_is_attributed_to_anchor() {
        let log = format!("INFO: Seed: 1\n{CRASH_LINE}\nnoise\n{}\n", progress(120, "NEW", 5, 7));
        let parsed = parse_log(&log, 60);

        assert_eq!(parsed.crashes.len(), 1);
        assert_eq!(parsed.crashes[0].exec_count, 0);
        assert_eq!(parsed.crashes[0].time_seconds, 0);
        assert_eq!(
            parsed.crashes[0].artifact_path,
            "./crash-0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(
            parsed.timeline,
            vec![
                StatsEntry::default(),
                StatsEntry {
                    exec_count: 120,
                    coverage: 5,
                    features: 7,
                    crashes: 1,
                    time_seconds: 60,
                },
            ]
        );
    }

    #[test]
    fn no_progress_lines_yield_only_anchor() {
        let parsed = parse_log("INFO: Running with entropic power schedule\n\n#5 INITED cov: 1\n", 30);
        assert_eq!(parsed.timeline, vec![StatsEntry::default()]);
        assert!(parsed.crashes.is_empty());
        assert!(!parsed.has_progress_data());
    }

    #[test]
    fn empty_log_still_has_a_last_entry() {
        let parsed = parse_log("", 30);
        assert_eq!(parsed.timeline(), &[StatsEntry::default()]);
        assert_eq!(parsed.last(), &StatsEntry::default());
        assert!(parsed.crashes().is_empty());
        assert!(!parsed.has_progress_data());
    }

    #[test]
    fn crashes_without_progress_get_zero_timestamps() {
        let parsed = parse_log(&format!("{CRASH_LINE}\n{CRASH_LINE}\n"), 30);
        assert_eq!(parsed.crashes.len(), 2);
        assert!(parsed.crashes.iter().all(|c| c.time_seconds == 0));
        assert!(!parsed.has_progress_data());
    }

    #[test]
    fn crash_count_and_attribution_carry_forward() {
        let log = [
            progress(100, "NEW", 1, 1),
            CRASH_LINE.to_string(),
            progress(200, "REDUCE", 2, 3),
            CRASH_LINE.to_string(),
            progress(400, "pulse", 2, 3),
        ]
        .join("\n");
        let parsed = parse_log(&log, 100);

        let execs: Vec<u64> = parsed.crashes.iter().map(|c| c.exec_count).collect();
        assert_eq!(execs, vec![100, 200]);
        let times: Vec<u64> = parsed.crashes.iter().map(|c| c.time_seconds).collect();
        assert_eq!(times, vec![25, 50]);
        let counts: Vec<u64> = parsed.timeline.iter().map(|e| e.crashes).collect();
        assert_eq!(counts, vec![0, 0, 1, 2]);
        assert_eq!(parsed.last().time_seconds, 100);
    }

    #[test]
    fn short_or_unknown_progress_lines_are_ignored() {
        let log = [
            "#100 NEW cov: 1 ft: 1".to_string(),
            progress(150, "INITED", 1, 1),
            progress(175, "DONE", 1, 1),
            "#abc NEW cov: 1 ft: 1 corp: 2/3b lim: 4 exec/s: 0 rss: 41Mb L: 2/2".to_string(),
            "artifact_prefix='./'; Test unit".to_string(),
            progress(200, "NEW", 4, 4),
        ]
        .join("\n");
        let parsed = parse_log(&log, 10);
        assert_eq!(parsed.timeline.len(), 2);
        assert_eq!(parsed.timeline[1].exec_count, 200);
        assert!(parsed.crashes.is_empty());
    }

    #[test]
    fn timeline_is_monotonic_and_bounded() {
        let log = [
            progress(10, "NEW", 1, 1),
            progress(7, "NEW", 1, 1),
            progress(33, "NEW", 2, 2),
            progress(33, "pulse", 2, 2),
            progress(1000, "REDUCE", 3, 3),
        ]
        .join("\n");
        let duration = 7;
        let parsed = parse_log(&log, duration);
        for pair in parsed.timeline.windows(2) {
            assert!(pair[0].exec_count <= pair[1].exec_count);
            assert!(pair[0].time_seconds <= pair[1].time_seconds);
        }
        assert!(parsed.timeline.iter().all(|e| e.time_seconds <= duration));
        assert_eq!(parsed.last().time_seconds, duration);
        assert_eq!(parsed.timeline.len(), 5);
    }

    #[test]
    fn interpolation_does_not_overflow() {
        assert_eq!(interpolate(u64::MAX, u64::MAX, u64::MAX), u64::MAX);
        assert_eq!(interpolate(1, 10, 3), 3);
        assert_eq!(interpolate(5, 10, 0), 0);
    }

    #[test]
    fn csv_round_trip_preserves_order() {
        let log = [
            progress(100, "NEW", 1, 1),
            CRASH_LINE.to_string(),
            progress(300, "NEW", 2, 5),
        ]
        .join("\n");
        let parsed = parse_log(&log, 90);

        let mut stats_buf = Vec::new();
        write_records(&mut stats_buf, &parsed.timeline).unwrap();
        let text = String::from_utf8(stats_buf.clone()).unwrap();
        assert!(text.starts_with("exec_count,coverage,features,crashes,time_seconds\n"));
        let stats_back: Vec<StatsEntry> = read_records(stats_buf.as_slice()).unwrap();
        assert_eq!(stats_back, parsed.timeline);

        let mut crash_buf = Vec::new();
        write_records(&mut crash_buf, &parsed.crashes).unwrap();
        let crashes_back: Vec<CrashEvent> = read_records(crash_buf.as_slice()).unwrap();
        assert_eq!(crashes_back, parsed.crashes);
    }

    #[test]
    fn empty_crash_export_still_has_header() {
        let dir = tempdir().unwrap();
        let parsed = parse_log("", 10);
        let stats = dir.path().join("stats.csv");
        let crashes = dir.path().join("crashes.csv");
        export_parsed(&parsed, &stats, &crashes).unwrap();

        assert_eq!(
            fs::read_to_string(&crashes).unwrap(),
            "exec_count,artifact_path,time_seconds\n"
        );
        let back: Vec<CrashEvent> = read_csv_file(&crashes).unwrap();
        assert!(back.is_empty());
        let stats_back: Vec<StatsEntry> = read_csv_file(&stats).unwrap();
        assert_eq!(stats_back, vec![StatsEntry::default()]);
    }

    #[test]
    fn parse_log_file_tolerates_invalid_utf8() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.err");
        let mut bytes = b"\xff\xfe garbage\n".to_vec();
        bytes.extend_from_slice(progress(64, "NEW", 6, 9).as_bytes());
        fs::write(&path, bytes).unwrap();
        let parsed = parse_log_file(&path, 12).unwrap();
        assert_eq!(parsed.last().exec_count, 64);
        assert_eq!(parsed.last().time_seconds, 12);

        assert!(matches!(
            parse_log_file(&dir.path().join("missing.err"), 12),
            Err(StatsError::ReadLog { .. })
        ));
    }
}
