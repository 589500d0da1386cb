//! Session summaries and cached-result rendering.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::coverage::CoverageIndex;
use crate::mutant::{MutantSpec, MutantStatus, MutantStore};
use crate::persist::FileRecord;

/// Supported output formats for result listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human-readable text.
    Text,
    /// JSON with all mutants inline.
    Json,
}

/// Aggregated counts for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Total mutants admitted to the session.
    pub total: usize,
    /// Mutation score (killed / testable mutants), percentage.
    pub mutation_score: f64,
    /// Killed mutants.
    pub killed: usize,
    /// Survived mutants.
    pub survived: usize,
    /// Survivors for which no test was even a candidate.
    pub survived_no_tests: usize,
    /// Timed-out mutants.
    pub timeout: usize,
    /// Suspicious mutants (crashes and runner faults).
    pub suspicious: usize,
    /// Skipped mutants.
    pub skipped: usize,
    /// Results served from the cache without a run.
    pub cached: usize,
    /// Mutants left without a terminal status.
    pub incomplete: usize,
    /// Whether the session stopped on an interrupt.
    pub interrupted: bool,
    /// Wall-clock duration of the session, milliseconds.
    pub total_duration_ms: u64,
}

impl SessionSummary {
    /// Build a summary from the in-memory store.
    pub fn from_store(
        store: &MutantStore,
        cached: usize,
        interrupted: bool,
        total_duration_ms: u64,
    ) -> Self {
        Self::tally(
            store.iter_in_generation_order().map(|entry| {
                (
                    entry.status,
                    entry.outcome.as_ref().map(|o| o.tests_considered),
                )
            }),
            cached,
            interrupted,
            total_duration_ms,
        )
    }

    /// Build a summary from persisted records alone.
    pub fn from_records(records: &[FileRecord]) -> Self {
        let statuses = records.iter().flat_map(|record| {
            record.mutants.values().map(|m| {
                (
                    m.status,
                    m.outcome.as_ref().map(|o| o.tests_considered),
                )
            })
        });
        let cached = records.iter().map(|r| r.mutants.len()).sum();
        let duration: u64 = records
            .iter()
            .flat_map(|r| r.mutants.values())
            .filter_map(|m| m.outcome.as_ref())
            .map(|o| o.duration_ms)
            .sum();
        Self::tally(statuses, cached, false, duration)
    }

    fn tally(
        statuses: impl Iterator<Item = (MutantStatus, Option<usize>)>,
        cached: usize,
        interrupted: bool,
        total_duration_ms: u64,
    ) -> Self {
        let mut out = Self {
            total: 0,
            mutation_score: 0.0,
            killed: 0,
            survived: 0,
            survived_no_tests: 0,
            timeout: 0,
            suspicious: 0,
            skipped: 0,
            cached,
            incomplete: 0,
            interrupted,
            total_duration_ms,
        };

        for (status, tests_considered) in statuses {
            out.total += 1;
            match status {
                MutantStatus::Killed => out.killed += 1,
                MutantStatus::Survived => {
                    out.survived += 1;
                    if tests_considered == Some(0) {
                        out.survived_no_tests += 1;
                    }
                }
                MutantStatus::Timeout => out.timeout += 1,
                MutantStatus::Suspicious => out.suspicious += 1,
                MutantStatus::Skipped => out.skipped += 1,
                MutantStatus::Untested | MutantStatus::Running => out.incomplete += 1,
            }
        }

        let testable = out.total.saturating_sub(out.skipped + out.incomplete);
        if testable > 0 {
            out.mutation_score = (out.killed as f64) * 100.0 / (testable as f64);
        } else {
            out.mutation_score = 100.0;
        }

        out
    }

    /// True when every testable mutant was killed.
    pub fn is_clean(&self) -> bool {
        self.survived == 0 && self.timeout == 0 && self.suspicious == 0 && self.incomplete == 0
    }

    /// One-line rendering for terminal output.
    pub fn one_line(&self) -> String {
        format!(
            "{} mutants: {} killed, {} survived, {} timeout, {} suspicious, {} skipped, {} cached, score {:.1}%",
            self.total,
            self.killed,
            self.survived,
            self.timeout,
            self.suspicious,
            self.skipped,
            self.cached,
            self.mutation_score
        )
    }
}

/// Per-mutant runtime estimate derived from coverage timings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutantEstimate {
    /// Mutant id.
    pub id: String,
    /// Number of candidate tests.
    pub tests: usize,
    /// Expected clean-run duration, milliseconds.
    pub estimated_ms: u64,
    /// Timeout the session would grant, seconds.
    pub timeout_secs: f64,
}

/// Estimate the runtime of each mutant from candidate-test timings.
pub fn estimate_mutants(
    specs: &[MutantSpec],
    index: &CoverageIndex,
    config: &SessionConfig,
) -> Vec<MutantEstimate> {
    specs
        .iter()
        .map(|spec| {
            let tests = index.candidate_tests(&spec.file, spec.line);
            let estimated_ms = index.estimated_duration_ms(&tests);
            MutantEstimate {
                id: spec.id.clone(),
                tests: tests.len(),
                estimated_ms,
                timeout_secs: config.timeout_secs_for(estimated_ms as f64 / 1000.0),
            }
        })
        .collect()
}

/// Render runtime estimates in the requested format.
pub fn render_estimates(estimates: &[MutantEstimate], format: ReportFormat) -> String {
    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "mutants": estimates,
            "total_estimated_ms": estimates.iter().map(|e| e.estimated_ms).sum::<u64>(),
        }))
        .expect("estimate JSON should serialize"),
        ReportFormat::Text => {
            let mut out = String::from("id\ttests\testimated_ms\ttimeout_secs\n");
            for e in estimates {
                out.push_str(&format!(
                    "{}\t{}\t{}\t{:.1}\n",
                    e.id, e.tests, e.estimated_ms, e.timeout_secs
                ));
            }
            let total: u64 = estimates.iter().map(|e| e.estimated_ms).sum();
            out.push_str(&format!(
                "total: {} mutants, ~{:.1}s serial\n",
                estimates.len(),
                total as f64 / 1000.0
            ));
            out
        }
    }
}

/// Render cached results grouped by source file.
pub fn render_results(records: &[FileRecord], format: ReportFormat) -> String {
    let summary = SessionSummary::from_records(records);

    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "summary": summary,
            "files": records,
        }))
        .expect("results JSON should serialize"),
        ReportFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("{}\n", summary.one_line()));

            for record in records {
                let flagged: Vec<_> = record
                    .mutants
                    .iter()
                    .filter(|(_, m)| {
                        matches!(
                            m.status,
                            MutantStatus::Survived
                                | MutantStatus::Timeout
                                | MutantStatus::Suspicious
                        )
                    })
                    .collect();
                if flagged.is_empty() {
                    continue;
                }

                out.push_str(&format!("\n{}\n", record.source_file));
                for (id, m) in flagged {
                    let detail = match &m.outcome {
                        Some(o) if o.tests_considered == 0 => " (no covering tests)".to_string(),
                        Some(o) => format!(" ({}ms, {} tests)", o.duration_ms, o.tests_considered),
                        None => String::new(),
                    };
                    out.push_str(&format!("  {}: {}{}\n", id, m.status.as_str(), detail));
                }
            }

            out
        }
    }
}
