//! Test execution backend: isolated harness processes.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::config::SessionConfig;
use crate::coverage::SuiteStats;
use crate::worker::CancelToken;

/// Environment variable naming the active mutant for a harness run.
pub const MUTANT_ENV: &str = "FAULTLINE_MUTANT";
/// Environment variable naming the file a stats run writes its data to.
pub const STATS_FILE_ENV: &str = "FAULTLINE_STATS_FILE";
/// Environment variable carrying the configured test directories.
pub const TESTS_DIRS_ENV: &str = "FAULTLINE_TESTS_DIRS";

/// Sentinel value selecting the forced-fail wiring check.
pub const FORCED_FAIL_SENTINEL: &str = "fail";
/// Sentinel value selecting the stats collection mode.
pub const STATS_SENTINEL: &str = "stats";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const EXCERPT_MAX_CHARS: usize = 4_000;

/// Which mutant a harness run activates.
///
/// The value travels as a single environment variable; source files are never
/// rewritten per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveMutant {
    /// No mutant: clean baseline behavior.
    None,
    /// Every activation point fails unconditionally.
    ForcedFail,
    /// Instrumented stats collection run.
    Stats,
    /// One specific mutant by id.
    Mutant(String),
}

impl ActiveMutant {
    /// Environment variable value for this selection.
    pub fn env_value(&self) -> &str {
        match self {
            Self::None => "",
            Self::ForcedFail => FORCED_FAIL_SENTINEL,
            Self::Stats => STATS_SENTINEL,
            Self::Mutant(id) => id,
        }
    }
}

/// Normalized result of one harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunVerdict {
    /// Every selected test passed.
    Passed,
    /// At least one selected test failed.
    Failed,
    /// The harness collected zero tests. Not a failure.
    NoTestsCollected,
    /// The run exceeded its timeout and was forcibly terminated.
    TimedOut,
    /// The harness process died abnormally.
    Crashed {
        /// Terminating signal, when known.
        signal: Option<i32>,
    },
    /// The run was terminated by session cancellation.
    Cancelled,
}

/// Immutable request for one harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    /// Mutant selection for this run.
    pub active: ActiveMutant,
    /// Tests appended to the command line. Empty means the full suite.
    pub tests: Vec<String>,
    /// Wall-clock bound. `None` disables timeout enforcement.
    pub timeout: Option<Duration>,
}

/// Captured result of one harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunOutput {
    /// Normalized verdict.
    pub verdict: RunVerdict,
    /// Raw exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Tail of the combined stdout and stderr.
    pub output_excerpt: String,
}

/// Result of one stats collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsCollection {
    /// Parsed suite stats. Empty when the harness reported no tests.
    pub suite: SuiteStats,
    /// Wall-clock cost of the stats run.
    pub duration: Duration,
}

/// Backend-level errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The configured test command is empty.
    #[error("test command is empty")]
    EmptyCommand,
    /// The test command's executable was not found.
    #[error("test command not found: {command}")]
    CommandNotFound {
        /// Missing executable.
        command: String,
    },
    /// The stats run finished with a failure verdict.
    #[error("stats collection run failed: {excerpt}")]
    StatsRunFailed {
        /// Raw exit code, when known.
        exit_code: Option<i32>,
        /// Output tail.
        excerpt: String,
    },
    /// The stats file could not be parsed.
    #[error("malformed suite stats: {message}")]
    MalformedStats {
        /// Parser detail.
        message: String,
    },
    /// The backend implementation panicked during a run.
    #[error("test backend panicked: {message}")]
    Panicked {
        /// Panic payload text.
        message: String,
    },
    /// Underlying process or file IO failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability the session consumes to run tests.
pub trait TestBackend {
    /// Execute one harness run.
    fn run(&self, request: &TestRun, cancel: &CancelToken) -> Result<TestRunOutput, BackendError>;

    /// Execute one instrumented full-suite run and gather timing and
    /// coverage data.
    fn collect_stats(&self, cancel: &CancelToken) -> Result<StatsCollection, BackendError>;
}

/// Backend spawning the configured command as a fresh child process per run.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    argv: Vec<String>,
    project_dir: PathBuf,
    tests_dirs: Vec<PathBuf>,
    no_tests_exit_codes: Vec<i32>,
}

impl CommandBackend {
    /// Backend configured from a session configuration.
    pub fn from_config(config: &SessionConfig) -> Result<Self, BackendError> {
        let argv = split_command(&config.test_command);
        if argv.is_empty() {
            return Err(BackendError::EmptyCommand);
        }
        Ok(Self {
            argv,
            project_dir: config.project_dir.clone(),
            tests_dirs: config.tests_dirs.clone(),
            no_tests_exit_codes: config.no_tests_exit_codes.clone(),
        })
    }

    fn spawn(&self, request: &TestRun, stats_file: Option<&Path>) -> Result<Child, BackendError> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .args(&request.tests)
            .current_dir(&self.project_dir)
            .env(MUTANT_ENV, request.active.env_value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if !self.tests_dirs.is_empty() {
            let joined = self
                .tests_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(":");
            cmd.env(TESTS_DIRS_ENV, joined);
        }
        if let Some(path) = stats_file {
            cmd.env(STATS_FILE_ENV, path);
        }

        match cmd.spawn() {
            Ok(child) => Ok(child),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::CommandNotFound {
                    command: self.argv[0].clone(),
                })
            }
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    fn run_with_stats_file(
        &self,
        request: &TestRun,
        cancel: &CancelToken,
        stats_file: Option<&Path>,
    ) -> Result<TestRunOutput, BackendError> {
        let started = Instant::now();
        let deadline = request.timeout.map(|timeout| started + timeout);

        let mut child = self.spawn(request, stats_file)?;
        let stdout_reader = child.stdout.take().map(drain_pipe);
        let stderr_reader = child.stderr.take().map(drain_pipe);

        let mut timed_out = false;
        let mut cancelled = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break kill_and_reap(&mut child)?;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                timed_out = true;
                break kill_and_reap(&mut child)?;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let duration = started.elapsed();
        let stdout = join_pipe(stdout_reader);
        let stderr = join_pipe(stderr_reader);
        let output_excerpt = tail_excerpt(&stdout, &stderr);

        let exit_code = status.as_ref().and_then(ExitStatus::code);
        let verdict = if cancelled {
            RunVerdict::Cancelled
        } else if timed_out {
            RunVerdict::TimedOut
        } else {
            match status {
                Some(status) if status.success() => RunVerdict::Passed,
                Some(status) => match status.code() {
                    Some(code) if self.no_tests_exit_codes.contains(&code) => {
                        RunVerdict::NoTestsCollected
                    }
                    Some(_) => RunVerdict::Failed,
                    None => RunVerdict::Crashed {
                        signal: signal_of(&status),
                    },
                },
                None => RunVerdict::Crashed { signal: None },
            }
        };

        debug!(
            verdict = ?verdict,
            exit_code = ?exit_code,
            duration_ms = duration.as_millis() as u64,
            "harness run finished"
        );

        Ok(TestRunOutput {
            verdict,
            exit_code,
            duration,
            output_excerpt,
        })
    }
}

impl TestBackend for CommandBackend {
    fn run(&self, request: &TestRun, cancel: &CancelToken) -> Result<TestRunOutput, BackendError> {
        self.run_with_stats_file(request, cancel, None)
    }

    fn collect_stats(&self, cancel: &CancelToken) -> Result<StatsCollection, BackendError> {
        let stats_file = tempfile::Builder::new()
            .prefix("faultline-stats-")
            .suffix(".json")
            .tempfile()?;

        let request = TestRun {
            active: ActiveMutant::Stats,
            tests: Vec::new(),
            timeout: None,
        };
        let output = self.run_with_stats_file(&request, cancel, Some(stats_file.path()))?;

        match output.verdict {
            RunVerdict::Passed => {
                let raw = std::fs::read_to_string(stats_file.path())?;
                let suite = if raw.trim().is_empty() {
                    SuiteStats::default()
                } else {
                    serde_json::from_str(&raw).map_err(|err| BackendError::MalformedStats {
                        message: err.to_string(),
                    })?
                };
                Ok(StatsCollection {
                    suite,
                    duration: output.duration,
                })
            }
            RunVerdict::NoTestsCollected | RunVerdict::Cancelled => Ok(StatsCollection {
                suite: SuiteStats::default(),
                duration: output.duration,
            }),
            RunVerdict::Failed | RunVerdict::TimedOut | RunVerdict::Crashed { .. } => {
                Err(BackendError::StatsRunFailed {
                    exit_code: output.exit_code,
                    excerpt: output.output_excerpt,
                })
            }
        }
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn kill_and_reap(child: &mut Child) -> Result<Option<ExitStatus>, BackendError> {
    // Kill can race a natural exit; either way the wait below reaps.
    let _ = child.kill();
    Ok(Some(child.wait()?))
}

fn tail_excerpt(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    combined.push_str(stdout);
    if !stdout.is_empty() && !stderr.is_empty() {
        combined.push('\n');
    }
    combined.push_str(stderr);
    tail_chars(combined.trim_end(), EXCERPT_MAX_CHARS)
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}
