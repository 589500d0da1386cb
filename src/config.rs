//! Session configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Exit code pytest uses when the selected test set collects zero tests.
pub const PYTEST_NO_TESTS_EXIT_CODE: i32 = 5;

/// Immutable configuration for one mutation session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Project directory where the test command is executed.
    pub project_dir: PathBuf,
    /// Directory where cached results and suite stats are persisted.
    pub cache_dir: PathBuf,
    /// Source paths in scope for mutation. Empty means all catalog output.
    pub paths_to_mutate: Vec<PathBuf>,
    /// Test directories forwarded to the harness environment.
    pub tests_dirs: Vec<PathBuf>,
    /// Command line that runs the test suite, split on whitespace.
    pub test_command: String,
    /// Number of concurrent worker slots. Zero is normalized to one.
    pub parallelism: usize,
    /// Fixed component of the per-mutant timeout, in seconds.
    pub timeout_base: f64,
    /// Multiplier applied to a mutant's baseline-equivalent duration.
    pub timeout_multiplier: f64,
    /// Stack-depth ceiling for coverage contexts. `None` means unlimited.
    pub max_stack_depth: Option<u32>,
    /// Skip mutants on lines no test reaches instead of executing them.
    pub mutate_only_covered_lines: bool,
    /// Operator kinds excluded from the session.
    pub disabled_operators: Vec<String>,
    /// Re-execute every mutant regardless of cached results.
    pub rerun_all: bool,
    /// Mutant ids re-executed even when a terminal result is cached.
    pub rerun_mutants: Vec<String>,
    /// Optional substring filter restricting which mutants the session touches.
    pub filter: Option<String>,
    /// Harness exit codes meaning "zero tests collected", not failure.
    pub no_tests_exit_codes: Vec<i32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let project_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let cache_dir = project_dir.join(".faultline");
        Self {
            project_dir,
            cache_dir,
            paths_to_mutate: Vec::new(),
            tests_dirs: Vec::new(),
            test_command: String::new(),
            parallelism: 1,
            timeout_base: 15.0,
            timeout_multiplier: 15.0,
            max_stack_depth: None,
            mutate_only_covered_lines: false,
            disabled_operators: Vec::new(),
            rerun_all: false,
            rerun_mutants: Vec::new(),
            filter: None,
            no_tests_exit_codes: vec![PYTEST_NO_TESTS_EXIT_CODE],
        }
    }
}

impl SessionConfig {
    /// Set project directory.
    pub fn with_project_dir(mut self, project_dir: impl Into<PathBuf>) -> Self {
        self.project_dir = project_dir.into();
        self
    }

    /// Set cache directory.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Set mutation scope paths.
    pub fn with_paths_to_mutate<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.paths_to_mutate = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set test directories.
    pub fn with_tests_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.tests_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the test command line.
    pub fn with_test_command(mut self, test_command: impl Into<String>) -> Self {
        self.test_command = test_command.into();
        self
    }

    /// Set worker slot count.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the fixed timeout component in seconds.
    pub fn with_timeout_base(mut self, timeout_base: f64) -> Self {
        self.timeout_base = timeout_base;
        self
    }

    /// Set the timeout multiplier.
    pub fn with_timeout_multiplier(mut self, timeout_multiplier: f64) -> Self {
        self.timeout_multiplier = timeout_multiplier;
        self
    }

    /// Set the coverage stack-depth ceiling.
    pub fn with_max_stack_depth(mut self, max_stack_depth: u32) -> Self {
        self.max_stack_depth = Some(max_stack_depth);
        self
    }

    /// Restrict execution to mutants on covered lines.
    pub fn with_mutate_only_covered_lines(mut self, enabled: bool) -> Self {
        self.mutate_only_covered_lines = enabled;
        self
    }

    /// Set excluded operator kinds.
    pub fn with_disabled_operators<I, S>(mut self, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_operators = operators.into_iter().map(Into::into).collect();
        self
    }

    /// Force re-execution of all mutants.
    pub fn with_rerun_all(mut self, rerun_all: bool) -> Self {
        self.rerun_all = rerun_all;
        self
    }

    /// Force re-execution of specific mutant ids.
    pub fn with_rerun_mutants<I, S>(mut self, mutants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rerun_mutants = mutants.into_iter().map(Into::into).collect();
        self
    }

    /// Set selector filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set harness exit codes treated as "zero tests collected".
    pub fn with_no_tests_exit_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = i32>,
    {
        self.no_tests_exit_codes = codes.into_iter().collect();
        self
    }

    /// Worker slot count clamped to at least one.
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    /// Timeout in seconds for a mutant whose candidate tests take
    /// `estimated_secs` on a clean baseline.
    pub fn timeout_secs_for(&self, estimated_secs: f64) -> f64 {
        self.timeout_base + self.timeout_multiplier * estimated_secs
    }
}
