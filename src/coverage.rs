//! Coverage-derived test selection.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Timing and coverage data produced by one instrumented full-suite run.
///
/// `tests` maps test id to its baseline duration in milliseconds. `contexts`
/// maps source file (as written by the harness, matching manifest paths) to
/// line to the tests reaching that line, each with the shallowest call-stack
/// depth observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteStats {
    /// Baseline duration per test id, milliseconds.
    #[serde(default)]
    pub tests: BTreeMap<String, u64>,
    /// Per-line coverage contexts: file -> line -> test id -> stack depth.
    #[serde(default)]
    pub contexts: BTreeMap<String, BTreeMap<u32, BTreeMap<String, u32>>>,
}

impl SuiteStats {
    /// True when no tests were recorded.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Maps mutant locations to ordered candidate test subsets.
///
/// Candidates are ordered ascending by baseline duration, tie-broken
/// lexicographically by test id, so the cheapest kill signal comes first and
/// scheduling stays deterministic.
#[derive(Debug, Clone)]
pub struct CoverageIndex {
    durations: BTreeMap<String, u64>,
    contexts: BTreeMap<String, BTreeMap<u32, BTreeMap<String, u32>>>,
    max_stack_depth: Option<u32>,
}

impl CoverageIndex {
    /// Index over `suite`, honoring an optional stack-depth ceiling.
    pub fn new(suite: &SuiteStats, max_stack_depth: Option<u32>) -> Self {
        Self {
            durations: suite.tests.clone(),
            contexts: suite.contexts.clone(),
            max_stack_depth,
        }
    }

    /// Number of known tests.
    pub fn test_count(&self) -> usize {
        self.durations.len()
    }

    /// True when any per-line context data exists.
    pub fn has_context_data(&self) -> bool {
        !self.contexts.is_empty()
    }

    /// Every known test in candidate order.
    pub fn all_tests(&self) -> Vec<String> {
        self.sorted(self.durations.keys().cloned())
    }

    /// Ordered candidate tests for a mutant at `file:line`.
    ///
    /// Falls back to the full test set only when no context data exists at
    /// all. A location absent from a nonempty context map yields an empty
    /// subset.
    pub fn candidate_tests(&self, file: &Path, line: u32) -> Vec<String> {
        if !self.has_context_data() {
            return self.all_tests();
        }

        let covering = match self.covering_tests(file, line) {
            Some(covering) => covering,
            None => return Vec::new(),
        };

        self.sorted(covering.into_iter())
    }

    /// True when at least one test reaches `file:line` within the depth
    /// ceiling.
    pub fn line_covered(&self, file: &Path, line: u32) -> bool {
        self.covering_tests(file, line)
            .is_some_and(|tests| !tests.is_empty())
    }

    /// Sum of baseline durations for `tests`, in milliseconds. Tests without
    /// a recorded duration contribute zero.
    pub fn estimated_duration_ms(&self, tests: &[String]) -> u64 {
        tests
            .iter()
            .map(|test| self.durations.get(test).copied().unwrap_or(0))
            .sum()
    }

    /// Baseline duration of one test, when recorded.
    pub fn test_duration_ms(&self, test: &str) -> Option<u64> {
        self.durations.get(test).copied()
    }

    fn covering_tests(&self, file: &Path, line: u32) -> Option<Vec<String>> {
        let key = file.to_string_lossy();
        let by_line = self.contexts.get(key.as_ref())?;
        let tests = by_line.get(&line)?;
        Some(
            tests
                .iter()
                .filter(|(_, depth)| match self.max_stack_depth {
                    Some(ceiling) => **depth <= ceiling,
                    None => true,
                })
                .map(|(test, _)| test.clone())
                .collect(),
        )
    }

    fn sorted(&self, tests: impl Iterator<Item = String>) -> Vec<String> {
        let mut out: Vec<String> = tests.collect();
        out.sort_by(|a, b| {
            let da = self.durations.get(a).copied().unwrap_or(0);
            let db = self.durations.get(b).copied().unwrap_or(0);
            da.cmp(&db).then_with(|| a.cmp(b))
        });
        out
    }
}
