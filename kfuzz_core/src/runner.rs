use crate::config::{EngineSettings, RunSettings};
use crate::failure::{self, RunOutcome};
use crate::store::{StoreError, TargetPaths};
use crate::target::FuzzTarget;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const ENV_TARGET: &str = "KFUZZ_TARGET";
pub const ENV_EXCEPTION_FILE: &str = "KFUZZ_EXCEPTION_FILE";
pub const ENV_REPRODUCER_DIR: &str = "KFUZZ_REPRODUCER_DIR";
pub const ENV_CORPUS_DIR: &str = "KFUZZ_CORPUS_DIR";
pub const ENV_DEBUG_ATTACHED: &str = "KFUZZ_DEBUG_ATTACHED";

const DEBUG_ATTACH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Engine command is empty")]
    EmptyCommand,
    #[error("Target {0} already has a run in progress")]
    TargetBusy(String),
    #[error("Failed to spawn engine command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("Child {0} was not available after piping")]
    MissingPipe(StreamKind),
    #[error("Draining {stream} into {path:?} failed: {source}")]
    Drain {
        stream: StreamKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Drain thread for {0} panicked")]
    DrainPanicked(StreamKind),
    #[error("Error waiting for engine process: {0}")]
    Wait(#[source] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Receives every captured line as it is drained, in addition to the log file.
pub trait LogSink: Send + Sync {
    fn line(&self, target: &FuzzTarget, stream: StreamKind, line: &str);
}

/// Forwards captured lines to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn line(&self, target: &FuzzTarget, stream: StreamKind, line: &str) {
        debug!("[{target}:{stream}] {line}");
    }
}

/// Outcome of one engine invocation. Immutable once produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub target: FuzzTarget,
    pub exit_code: Option<i32>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

/// Runs the external engine once per call, one outstanding run per target.
pub struct ProcessRunner {
    engine: EngineSettings,
    working_dir: Option<PathBuf>,
    sink: Option<Arc<dyn LogSink>>,
    active: Mutex<HashSet<FuzzTarget>>,
}

struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<FuzzTarget>>,
    target: FuzzTarget,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.target);
        }
    }
}

impl ProcessRunner {
    pub fn new(engine: EngineSettings) -> Self {
        Self {
            engine,
            working_dir: None,
            sink: None,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn claim(&self, target: &FuzzTarget) -> Result<ActiveGuard<'_>, RunnerError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(target.clone()) {
            return Err(RunnerError::TargetBusy(target.to_string()));
        }
        Ok(ActiveGuard {
            active: &self.active,
            target: target.clone(),
        })
    }

    /// The full argv handed to the engine for one run.
    pub fn engine_args(&self, paths: &TargetPaths, settings: &RunSettings) -> Vec<String> {
        let mut args: Vec<String> = self.engine.command.iter().skip(1).cloned().collect();
        args.push(paths.corpus_dir.to_string_lossy().into_owned());
        args.push(format!("-max_total_time={}", settings.max_total_time_secs));
        args.push(format!("-rss_limit_mb={}", settings.rss_limit_mb));
        args.extend(self.engine.extra_flags.iter().cloned());
        args
    }

    /// Spawns the engine for `target`, drains both output streams into the
    /// target's log files on two dedicated threads, waits for EOF on both and
    /// for the process to exit, then recovers the failure record if the exit
    /// code is nonzero.
    pub fn run(
        &self,
        target: &FuzzTarget,
        paths: &TargetPaths,
        settings: &RunSettings,
    ) -> Result<RunResult, RunnerError> {
        let program = self.engine.command.first().ok_or(RunnerError::EmptyCommand)?;
        let _guard = self.claim(target)?;

        failure::clear_failure_record(&paths.exception_file)?;

        let mut cmd = Command::new(program);
        cmd.args(self.engine_args(paths, settings));
        if let Some(cwd) = &self.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.envs(&settings.properties);
        cmd.env(ENV_TARGET, target.name())
            .env(ENV_EXCEPTION_FILE, &paths.exception_file)
            .env(ENV_REPRODUCER_DIR, &paths.reproducer_dir)
            .env(ENV_CORPUS_DIR, &paths.corpus_dir);

        if let Some(addr) = &self.engine.debug_attach {
            match attach_debugger(addr, target) {
                Ok(()) => {
                    info!("Debugger at {addr} acknowledged {target}");
                    cmd.env(ENV_DEBUG_ATTACHED, "1");
                }
                Err(e) => warn!("Debugger handshake with {addr} failed, running without it: {e}"),
            }
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let stdout_file = create_log(&paths.stdout_log)?;
        let stderr_file = create_log(&paths.stderr_log)?;

        info!(
            "Starting engine for {target} ({}s budget)",
            settings.max_total_time_secs
        );
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: self.engine.command.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(RunnerError::MissingPipe(StreamKind::Stdout))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(RunnerError::MissingPipe(StreamKind::Stderr))?;

        let (tx, rx) = mpsc::channel::<(StreamKind, String)>();
        let stdout_drain = spawn_drain(stdout, StreamKind::Stdout, stdout_file, tx.clone());
        let stderr_drain = spawn_drain(stderr, StreamKind::Stderr, stderr_file, tx);

        // Closes once both drains hit EOF and drop their senders.
        for (stream, line) in rx {
            if let Some(sink) = &self.sink {
                sink.line(target, stream, &line);
            }
        }

        let status = child.wait().map_err(RunnerError::Wait)?;
        let stdout_lines = join_drain(stdout_drain, StreamKind::Stdout, &paths.stdout_log)?;
        let stderr_lines = join_drain(stderr_drain, StreamKind::Stderr, &paths.stderr_log)?;
        let elapsed = started.elapsed();

        info!(
            "Engine for {target} finished in {elapsed:.2?}: {} ({stdout_lines} stdout / {stderr_lines} stderr lines)",
            describe_exit(&status)
        );

        let exit_code = status.code();
        let outcome = failure::recover_outcome(exit_code, &paths.exception_file);
        Ok(RunResult {
            target: target.clone(),
            exit_code,
            stdout_log: paths.stdout_log.clone(),
            stderr_log: paths.stderr_log.clone(),
            outcome,
            elapsed,
        })
    }
}

fn create_log(path: &Path) -> Result<File, RunnerError> {
    File::create(path).map_err(|e| RunnerError::Store(StoreError::io(path, e)))
}

fn spawn_drain<R: Read + Send + 'static>(
    reader: R,
    stream: StreamKind,
    log: File,
    tx: Sender<(StreamKind, String)>,
) -> JoinHandle<io::Result<u64>> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(log);
        let mut buf = Vec::with_capacity(4096);
        let mut lines = 0u64;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            writer.write_all(&buf)?;
            lines += 1;
            let text = String::from_utf8_lossy(&buf);
            // The receiver only goes away if the orchestrator itself failed.
            let _ = tx.send((stream, text.trim_end_matches(['\n', '\r']).to_string()));
        }
        writer.flush()?;
        Ok(lines)
    })
}

fn join_drain(
    handle: JoinHandle<io::Result<u64>>,
    stream: StreamKind,
    path: &Path,
) -> Result<u64, RunnerError> {
    handle
        .join()
        .map_err(|_| RunnerError::DrainPanicked(stream))?
        .map_err(|source| RunnerError::Drain {
            stream,
            path: path.to_path_buf(),
            source,
        })
}

/// Asks a debugger listening on `addr` to attach to the upcoming run and waits
/// for a one-line `ok` acknowledgement.
fn attach_debugger(addr: &str, target: &FuzzTarget) -> io::Result<()> {
    let socket_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))?;
    let mut stream = TcpStream::connect_timeout(&socket_addr, DEBUG_ATTACH_TIMEOUT)?;
    stream.set_read_timeout(Some(DEBUG_ATTACH_TIMEOUT))?;
    stream.set_write_timeout(Some(DEBUG_ATTACH_TIMEOUT))?;
    writeln!(stream, "attach {}", target.name())?;

    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply)?;
    if reply.trim() == "ok" {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "unexpected handshake reply {:?}",
            reply.trim()
        )))
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited abnormally".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::failure::Failure;
    use crate::store::ArtifactStore;
    use std::collections::BTreeMap;
    use std::fs;
    use std::net::TcpListener;
    use tempfile::tempdir;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn engine_for(script: &str) -> EngineSettings {
        let target_path = get_test_target_path(script);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        EngineSettings {
            command: vec!["sh".to_string(), target_path.to_str().unwrap().to_string()],
            max_total_time_secs: 5,
            extra_flags: vec!["-use_value_profile=1".to_string()],
            ..EngineSettings::default()
        }
    }

    fn settings() -> RunSettings {
        RunSettings {
            max_total_time_secs: 5,
            rss_limit_mb: 512,
            properties: BTreeMap::from([("KFUZZ_PROP_SEED".to_string(), "42".to_string())]),
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        lines: Mutex<Vec<(StreamKind, String)>>,
    }

    impl LogSink for CollectingSink {
        fn line(&self, _target: &FuzzTarget, stream: StreamKind, line: &str) {
            self.lines.lock().unwrap().push((stream, line.to_string()));
        }
    }

    #[test]
    fn successful_run_captures_both_streams() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Ok.run");
        let paths = store.prepare(&target).unwrap();
        let sink = Arc::new(CollectingSink::default());
        let runner = ProcessRunner::new(engine_for("fake_engine_ok.sh")).with_sink(sink.clone());

        let result = runner.run(&target, &paths, &settings()).unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.outcome, RunOutcome::Passed);

        let stdout = fs::read_to_string(&result.stdout_log).unwrap();
        assert!(stdout.contains("target=org.example.Ok.run"));
        assert!(stdout.contains("seed=42"));
        assert!(stdout.contains("-max_total_time=5"));
        assert!(stdout.contains("-rss_limit_mb=512"));
        assert!(stdout.contains("-use_value_profile=1"));
        let stderr = fs::read_to_string(&result.stderr_log).unwrap();
        assert!(stderr.contains("#120"));

        let lines = sink.lines.lock().unwrap();
        assert!(lines.iter().any(|(s, _)| *s == StreamKind::Stdout));
        assert!(lines.iter().any(|(s, l)| *s == StreamKind::Stderr && l.contains("DONE")));
    }

    #[test]
    fn crashing_run_recovers_failure_record() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Crash.run");
        let paths = store.prepare(&target).unwrap();
        let runner = ProcessRunner::new(engine_for("fake_engine_crash.sh"));

        let result = runner.run(&target, &paths, &settings()).unwrap();
        assert_eq!(result.exit_code, Some(1));
        match result.outcome {
            RunOutcome::Failed(Failure { class_name, .. }) => {
                assert_eq!(class_name, "java.lang.IllegalStateException")
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn nonzero_exit_without_record_is_undecodable() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Silent.run");
        let paths = store.prepare(&target).unwrap();
        // A record from an earlier run must not be picked up again.
        failure::write_failure_record(
            &paths.exception_file,
            &failure::FailureRecord::Failure(Failure {
                class_name: "Stale".to_string(),
                message: None,
                stack_trace: String::new(),
            }),
        )
        .unwrap();
        let runner = ProcessRunner::new(engine_for("fake_engine_no_record.sh"));

        let result = runner.run(&target, &paths, &settings()).unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(matches!(result.outcome, RunOutcome::Undecodable(_)));
    }

    #[test]
    fn flooding_both_streams_does_not_deadlock() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Flood.run");
        let paths = store.prepare(&target).unwrap();
        let runner = ProcessRunner::new(engine_for("fake_engine_flood.sh"));

        let result = runner.run(&target, &paths, &settings()).unwrap();
        assert_eq!(result.exit_code, Some(0));
        let out_lines = fs::read_to_string(&result.stdout_log).unwrap().lines().count();
        let err_lines = fs::read_to_string(&result.stderr_log).unwrap().lines().count();
        assert_eq!(out_lines, 20000);
        assert_eq!(err_lines, 20000);
    }

    #[test]
    fn invalid_command_reports_spawn_error() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Missing.run");
        let paths = store.prepare(&target).unwrap();
        let runner = ProcessRunner::new(EngineSettings {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            ..EngineSettings::default()
        });
        assert!(matches!(
            runner.run(&target, &paths, &settings()),
            Err(RunnerError::Spawn { .. })
        ));

        let empty = ProcessRunner::new(EngineSettings::default());
        assert!(matches!(
            empty.run(&target, &paths, &settings()),
            Err(RunnerError::EmptyCommand)
        ));
    }

    #[test]
    fn concurrent_run_of_same_target_is_rejected() {
        let runner = ProcessRunner::new(engine_for("fake_engine_ok.sh"));
        let target = FuzzTarget::new("org.example.Busy.run");
        let guard = runner.claim(&target).unwrap();
        assert!(matches!(
            runner.claim(&target),
            Err(RunnerError::TargetBusy(_))
        ));
        drop(guard);
        assert!(runner.claim(&target).is_ok());
    }

    #[test]
    fn failed_debugger_handshake_is_ignored() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Debug.run");
        let paths = store.prepare(&target).unwrap();
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut engine = engine_for("fake_engine_ok.sh");
        engine.debug_attach = Some(format!("127.0.0.1:{port}"));
        let runner = ProcessRunner::new(engine);

        let result = runner.run(&target, &paths, &settings()).unwrap();
        assert_eq!(result.outcome, RunOutcome::Passed);
        let stdout = fs::read_to_string(&result.stdout_log).unwrap();
        assert!(stdout.contains("debug=none"));
    }

    #[test]
    fn acknowledged_debugger_handshake_is_announced_to_child() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = FuzzTarget::new("org.example.Debug.run");
        let paths = store.prepare(&target).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let debugger = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(stream.try_clone().unwrap())
                .read_line(&mut line)
                .unwrap();
            let mut stream = stream;
            writeln!(stream, "ok").unwrap();
            line
        });
        let mut engine = engine_for("fake_engine_ok.sh");
        engine.debug_attach = Some(addr.to_string());
        let runner = ProcessRunner::new(engine);

        let result = runner.run(&target, &paths, &settings()).unwrap();
        assert_eq!(debugger.join().unwrap().trim(), "attach org.example.Debug.run");
        let stdout = fs::read_to_string(&result.stdout_log).unwrap();
        assert!(stdout.contains("debug=1"));
    }
}
