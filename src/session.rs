//! Session orchestration: catalog to verified baseline to tested mutants.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{ActiveMutant, BackendError, RunVerdict, TestBackend, TestRun};
use crate::catalog::{CatalogError, MutationCatalog};
use crate::config::SessionConfig;
use crate::coverage::{CoverageIndex, SuiteStats};
use crate::events::{EventSink, SessionEvent, now_timestamp_ms};
use crate::mutant::{MutantSpec, MutantStore, Outcome, StoreError};
use crate::persist::{CacheStore, FileRecord, MutantRecord, PersistError, StatsRecord};
use crate::report::SessionSummary;
use crate::worker::{CancelToken, WorkerError, WorkerJob, WorkerPool, WorkerResult};

static SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Phase of a running session.
///
/// Phases advance monotonically; `Failed` is reachable from any of them.
/// Graceful interruption is not a failure: a cancelled session drains and
/// still ends in `Done` with its summary marked interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, not yet run.
    Init,
    /// Producing the mutant catalog.
    Generating,
    /// Running or loading the instrumented stats collection.
    CollectingStats,
    /// Applying cached terminal results.
    LoadingCache,
    /// Verifying that the clean suite passes.
    VerifyClean,
    /// Verifying that mutant activation is wired into the harness.
    VerifyForcedFail,
    /// Executing mutants.
    Testing,
    /// Finished with a summary.
    Done,
    /// Stopped on an unrecoverable error.
    Failed,
}

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration or its interaction with the project is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The clean baseline run did not pass.
    #[error("clean test suite does not pass: {excerpt}")]
    Baseline {
        /// Output tail of the failing run.
        excerpt: String,
    },
    /// The forced-fail check observed no failure.
    #[error("forced-fail check passed; mutant activation is not wired into the test command")]
    Wiring,
    /// Catalog generation failed.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    /// A baseline or stats run failed at the backend level.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    /// Result cache could not be read or written.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
    /// Mutant store bookkeeping failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Worker pool failed.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl SessionError {
    /// Stable kind label used in error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Baseline { .. } => "baseline",
            Self::Wiring => "wiring",
            Self::Catalog(_) => "catalog",
            Self::Backend(_) => "backend",
            Self::Persist(_) => "persist",
            Self::Store(_) => "store",
            Self::Worker(_) => "worker",
        }
    }
}

/// Test selection override.
///
/// Returns `Some(tests)` to pin the candidate list for a mutant, or `None`
/// to fall back to coverage-based selection. The hook must be pure: same
/// mutant and index, same answer.
pub type TestSelector = Box<dyn Fn(&MutantSpec, &CoverageIndex) -> Option<Vec<String>> + Send + Sync>;

/// One mutation-testing session over a project.
///
/// The session owns all mutable state; catalog, backend, and sink are
/// capabilities supplied by the caller. Results persist incrementally, so a
/// later session over the same cache directory resumes instead of repeating
/// work.
pub struct MutationSession<'a> {
    config: SessionConfig,
    catalog: &'a dyn MutationCatalog,
    backend: Arc<dyn TestBackend + Send + Sync>,
    sink: &'a dyn EventSink,
    cancel: CancelToken,
    selector: Option<TestSelector>,
    phase: SessionPhase,
    session_id: String,
}

impl<'a> MutationSession<'a> {
    /// Session over `config` using the given capabilities.
    pub fn new(
        config: SessionConfig,
        catalog: &'a dyn MutationCatalog,
        backend: Arc<dyn TestBackend + Send + Sync>,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            config,
            catalog,
            backend,
            sink,
            cancel: CancelToken::new(),
            selector: None,
            phase: SessionPhase::Init,
            session_id: generate_session_id(),
        }
    }

    /// Observe and honor an external cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override coverage-based test selection.
    pub fn with_selector(mut self, selector: TestSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the session to completion and return its summary.
    pub fn run(&mut self) -> Result<SessionSummary, SessionError> {
        match self.run_inner() {
            Ok(summary) => {
                self.phase = SessionPhase::Done;
                Ok(summary)
            }
            Err(err) => {
                self.phase = SessionPhase::Failed;
                self.emit_error(err.kind(), &err.to_string());
                Err(err)
            }
        }
    }

    fn run_inner(&mut self) -> Result<SessionSummary, SessionError> {
        let session_started = Instant::now();
        self.validate_config()?;
        let cache = CacheStore::new(self.config.cache_dir.clone());

        self.phase = SessionPhase::Generating;
        let generated = self.catalog.generate()?;
        if generated.is_empty() {
            return Err(SessionError::Configuration(
                "mutation catalog produced no mutants".to_string(),
            ));
        }
        let admitted = self.filter_specs(generated);
        if admitted.is_empty() {
            return Err(SessionError::Configuration(
                "every mutant was excluded by operator, filter, or path scope".to_string(),
            ));
        }
        let mut store = MutantStore::new();
        for spec in admitted {
            store.insert(spec)?;
        }
        for id in &self.config.rerun_mutants {
            if !store.contains(id) {
                return Err(SessionError::Configuration(format!(
                    "unknown mutant id in rerun list: {id}"
                )));
            }
        }
        debug!(mutants = store.len(), "catalog admitted");

        self.phase = SessionPhase::CollectingStats;
        let suite = self.load_or_collect_stats(&cache)?;
        if self.cancel.is_cancelled() {
            return Ok(self.finish(&store, 0, true, session_started));
        }
        let index = CoverageIndex::new(&suite, self.config.max_stack_depth);
        if index.test_count() == 0 {
            return Err(SessionError::Configuration(
                "the test suite reported zero tests".to_string(),
            ));
        }
        if self.config.mutate_only_covered_lines && !index.has_context_data() {
            return Err(SessionError::Configuration(
                "covered-lines-only mode requires per-line coverage contexts, none were collected"
                    .to_string(),
            ));
        }

        self.phase = SessionPhase::LoadingCache;
        let cached_ids = self.apply_cached_results(&cache, &mut store)?;
        self.sink.emit(&SessionEvent::SessionStarted {
            session_id: self.session_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            mutants: store.len(),
            tests: index.test_count(),
        });

        self.phase = SessionPhase::VerifyClean;
        let clean = self.backend.run(
            &TestRun {
                active: ActiveMutant::None,
                tests: Vec::new(),
                timeout: None,
            },
            &self.cancel,
        )?;
        match clean.verdict {
            RunVerdict::Passed => {}
            RunVerdict::Cancelled => {
                return Ok(self.finish(&store, cached_ids.len(), true, session_started));
            }
            RunVerdict::NoTestsCollected => {
                return Err(SessionError::Configuration(
                    "clean baseline run collected no tests".to_string(),
                ));
            }
            RunVerdict::Failed | RunVerdict::TimedOut | RunVerdict::Crashed { .. } => {
                return Err(SessionError::Baseline {
                    excerpt: clean.output_excerpt,
                });
            }
        }

        self.phase = SessionPhase::VerifyForcedFail;
        let forced = self.backend.run(
            &TestRun {
                active: ActiveMutant::ForcedFail,
                tests: Vec::new(),
                timeout: None,
            },
            &self.cancel,
        )?;
        match forced.verdict {
            RunVerdict::Failed | RunVerdict::Crashed { .. } => {}
            RunVerdict::Cancelled => {
                return Ok(self.finish(&store, cached_ids.len(), true, session_started));
            }
            RunVerdict::Passed | RunVerdict::NoTestsCollected | RunVerdict::TimedOut => {
                return Err(SessionError::Wiring);
            }
        }

        self.phase = SessionPhase::Testing;
        let mut immediate: Vec<(String, Outcome)> = Vec::new();
        let mut jobs: Vec<WorkerJob> = Vec::new();
        let mut selected: BTreeMap<String, usize> = BTreeMap::new();
        for entry in store.iter_in_generation_order() {
            let id = entry.spec.id.clone();
            if cached_ids.contains(&id) {
                continue;
            }
            if entry.spec.skip {
                immediate.push((id, Outcome::skipped()));
                continue;
            }
            if self.config.mutate_only_covered_lines
                && !index.line_covered(&entry.spec.file, entry.spec.line)
            {
                immediate.push((id, Outcome::skipped()));
                continue;
            }
            let tests = self.select_tests(&entry.spec, &index);
            if tests.is_empty() {
                immediate.push((id, Outcome::survived_no_tests()));
                continue;
            }
            let estimated_ms = index.estimated_duration_ms(&tests);
            let timeout_secs = self.config.timeout_secs_for(estimated_ms as f64 / 1000.0);
            // The product of two finite configured values can still overflow
            // what Duration represents; such a bound is effectively unlimited.
            let timeout = Duration::try_from_secs_f64(timeout_secs).unwrap_or(Duration::MAX);
            selected.insert(id.clone(), tests.len());
            jobs.push(WorkerJob {
                mutant_id: id.clone(),
                request: TestRun {
                    active: ActiveMutant::Mutant(id),
                    tests,
                    timeout: Some(timeout),
                },
            });
        }

        for id in &cached_ids {
            if let Some(outcome) = store.get(id).and_then(|entry| entry.outcome.clone()) {
                self.emit_finished(id, outcome, true);
            }
        }
        for (id, outcome) in immediate {
            store.finalize(&id, outcome.clone())?;
            self.persist_mutant(&cache, &store, &id)?;
            self.emit_finished(&id, outcome, false);
        }

        let slots = self.config.effective_parallelism();
        let pool = WorkerPool::new(Arc::clone(&self.backend), slots, self.cancel.clone());
        let mut queue: VecDeque<WorkerJob> = jobs.into();
        let mut in_flight = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                queue.clear();
            }
            while in_flight < slots {
                let Some(job) = queue.pop_front() else { break };
                store.mark_running(&job.mutant_id)?;
                self.sink.emit(&SessionEvent::MutantStarted {
                    session_id: self.session_id.clone(),
                    timestamp_ms: now_timestamp_ms(),
                    mutant_id: job.mutant_id.clone(),
                });
                debug!(
                    mutant_id = %job.mutant_id,
                    tests = job.request.tests.len(),
                    "mutant dispatched"
                );
                pool.submit(job)?;
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let result = pool.collect()?;
            in_flight -= 1;
            self.absorb_result(&mut store, &cache, &selected, result)?;
        }
        pool.shutdown();

        let interrupted = self.cancel.is_cancelled();
        Ok(self.finish(&store, cached_ids.len(), interrupted, session_started))
    }

    fn validate_config(&self) -> Result<(), SessionError> {
        if self.config.test_command.trim().is_empty() {
            return Err(SessionError::Configuration(
                "test command is empty".to_string(),
            ));
        }
        if !self.config.timeout_base.is_finite() || !self.config.timeout_multiplier.is_finite() {
            return Err(SessionError::Configuration(
                "timeout base and multiplier must be finite".to_string(),
            ));
        }
        if self.config.timeout_base < 0.0 || self.config.timeout_multiplier < 0.0 {
            return Err(SessionError::Configuration(
                "timeout base and multiplier must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    fn filter_specs(&self, specs: Vec<MutantSpec>) -> Vec<MutantSpec> {
        specs
            .into_iter()
            .filter(|spec| {
                !self
                    .config
                    .disabled_operators
                    .iter()
                    .any(|operator| operator == &spec.operator)
            })
            .filter(|spec| match &self.config.filter {
                Some(needle) => {
                    spec.id.contains(needle)
                        || spec.description.contains(needle)
                        || spec.file.to_string_lossy().contains(needle.as_str())
                }
                None => true,
            })
            .filter(|spec| {
                self.config.paths_to_mutate.is_empty()
                    || self
                        .config
                        .paths_to_mutate
                        .iter()
                        .any(|path| spec.file.starts_with(path))
            })
            .collect()
    }

    fn load_or_collect_stats(&self, cache: &CacheStore) -> Result<SuiteStats, SessionError> {
        if !self.config.rerun_all {
            if let Some(record) = cache.load_stats()? {
                if !record.suite.is_empty() {
                    debug!(tests = record.suite.tests.len(), "reusing cached suite stats");
                    return Ok(record.suite);
                }
            }
        }

        let collection = self.backend.collect_stats(&self.cancel)?;
        if self.cancel.is_cancelled() {
            return Ok(collection.suite);
        }
        cache.save_stats(&StatsRecord::new(
            collection.suite.clone(),
            collection.duration.as_millis() as u64,
        ))?;
        info!(
            tests = collection.suite.tests.len(),
            duration_ms = collection.duration.as_millis() as u64,
            "suite stats collected"
        );
        Ok(collection.suite)
    }

    fn apply_cached_results(
        &self,
        cache: &CacheStore,
        store: &mut MutantStore,
    ) -> Result<BTreeSet<String>, SessionError> {
        let mut cached_ids = BTreeSet::new();
        if self.config.rerun_all {
            return Ok(cached_ids);
        }

        let rerun: BTreeSet<&str> = self
            .config
            .rerun_mutants
            .iter()
            .map(String::as_str)
            .collect();
        for (file, ids) in store.ids_by_file() {
            let Some(record) = cache.load_file_record(&file)? else {
                continue;
            };
            for id in ids {
                if rerun.contains(id.as_str()) {
                    continue;
                }
                let Some(cached) = record.mutants.get(&id) else {
                    continue;
                };
                if !cached.status.is_terminal() {
                    continue;
                }
                let outcome = cached.outcome.clone().unwrap_or(Outcome {
                    status: cached.status,
                    duration_ms: 0,
                    tests_considered: 0,
                    output_excerpt: None,
                    signal: None,
                });
                store.finalize(&id, outcome)?;
                cached_ids.insert(id);
            }
        }
        debug!(cached = cached_ids.len(), "cache applied");
        Ok(cached_ids)
    }

    fn select_tests(&self, spec: &MutantSpec, index: &CoverageIndex) -> Vec<String> {
        if let Some(selector) = &self.selector {
            if let Some(tests) = selector(spec, index) {
                return tests;
            }
        }
        index.candidate_tests(&spec.file, spec.line)
    }

    fn absorb_result(
        &self,
        store: &mut MutantStore,
        cache: &CacheStore,
        selected: &BTreeMap<String, usize>,
        result: WorkerResult,
    ) -> Result<(), SessionError> {
        let WorkerResult { mutant_id, output } = result;
        let tests_considered = selected.get(&mutant_id).copied().unwrap_or(0);

        let outcome = match output {
            Ok(run) => {
                let duration_ms = run.duration.as_millis() as u64;
                let excerpt = (!run.output_excerpt.is_empty()).then_some(run.output_excerpt);
                match run.verdict {
                    // Discarded: the interrupt supersedes whatever the run
                    // was about to report.
                    RunVerdict::Cancelled => return Ok(()),
                    RunVerdict::Failed => Outcome {
                        status: crate::mutant::MutantStatus::Killed,
                        duration_ms,
                        tests_considered,
                        output_excerpt: excerpt,
                        signal: None,
                    },
                    RunVerdict::Passed => Outcome {
                        status: crate::mutant::MutantStatus::Survived,
                        duration_ms,
                        tests_considered,
                        output_excerpt: None,
                        signal: None,
                    },
                    RunVerdict::NoTestsCollected => Outcome {
                        status: crate::mutant::MutantStatus::Survived,
                        duration_ms,
                        tests_considered: 0,
                        output_excerpt: None,
                        signal: None,
                    },
                    RunVerdict::TimedOut => Outcome {
                        status: crate::mutant::MutantStatus::Timeout,
                        duration_ms,
                        tests_considered,
                        output_excerpt: excerpt,
                        signal: None,
                    },
                    RunVerdict::Crashed { signal } => Outcome {
                        status: crate::mutant::MutantStatus::Suspicious,
                        duration_ms,
                        tests_considered,
                        output_excerpt: excerpt,
                        signal,
                    },
                }
            }
            Err(err) => {
                self.emit_error("backend", &format!("mutant {mutant_id}: {err}"));
                Outcome {
                    status: crate::mutant::MutantStatus::Suspicious,
                    duration_ms: 0,
                    tests_considered,
                    output_excerpt: Some(err.to_string()),
                    signal: None,
                }
            }
        };

        debug!(mutant_id = %mutant_id, status = outcome.status.as_str(), "mutant finalized");
        store.finalize(&mutant_id, outcome.clone())?;
        self.persist_mutant(cache, store, &mutant_id)?;
        self.emit_finished(&mutant_id, outcome, false);
        Ok(())
    }

    fn persist_mutant(
        &self,
        cache: &CacheStore,
        store: &MutantStore,
        id: &str,
    ) -> Result<(), SessionError> {
        let entry = store.get(id).ok_or_else(|| StoreError::UnknownMutant {
            id: id.to_string(),
        })?;
        let file = entry.spec.file.clone();

        let mut record = FileRecord::new(file.display().to_string());
        for sibling in store.iter_in_generation_order() {
            if sibling.spec.file == file && sibling.status.is_terminal() {
                record.mutants.insert(
                    sibling.spec.id.clone(),
                    MutantRecord {
                        status: sibling.status,
                        outcome: sibling.outcome.clone(),
                    },
                );
            }
        }
        cache.save_file_record(&record)?;
        Ok(())
    }

    fn finish(
        &self,
        store: &MutantStore,
        cached: usize,
        interrupted: bool,
        started: Instant,
    ) -> SessionSummary {
        let summary = SessionSummary::from_store(
            store,
            cached,
            interrupted,
            started.elapsed().as_millis() as u64,
        );
        self.sink.emit(&SessionEvent::SessionFinished {
            session_id: self.session_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            summary: summary.clone(),
        });
        info!(
            killed = summary.killed,
            survived = summary.survived,
            timeout = summary.timeout,
            suspicious = summary.suspicious,
            skipped = summary.skipped,
            cached = summary.cached,
            interrupted = summary.interrupted,
            score = summary.mutation_score,
            "session finished"
        );
        summary
    }

    fn emit_finished(&self, mutant_id: &str, outcome: Outcome, cached: bool) {
        self.sink.emit(&SessionEvent::MutantFinished {
            session_id: self.session_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            mutant_id: mutant_id.to_string(),
            outcome,
            cached,
        });
    }

    fn emit_error(&self, kind: &str, message: &str) {
        self.sink.emit(&SessionEvent::Error {
            session_id: self.session_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }
}

fn generate_session_id() -> String {
    let seq = SESSION_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!(
        "session-{}-{}-{}",
        now_timestamp_ms(),
        std::process::id(),
        seq
    )
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use tempfile::tempdir;

    use super::*;
    use crate::backend::{StatsCollection, TestRunOutput};
    use crate::events::MemorySink;
    use crate::mutant::MutantStatus;

    struct FakeCatalog {
        specs: Vec<MutantSpec>,
    }

    impl MutationCatalog for FakeCatalog {
        fn generate(&self) -> Result<Vec<MutantSpec>, CatalogError> {
            Ok(self.specs.clone())
        }
    }

    struct FakeBackend {
        suite: SuiteStats,
        verdicts: BTreeMap<String, RunVerdict>,
        run_log: Mutex<Vec<(String, Vec<String>)>>,
        stats_calls: AtomicUsize,
        fail_clean: bool,
        forced_fail_passes: bool,
        cancel_on: Option<(String, CancelToken)>,
        panic_on: Option<String>,
    }

    impl FakeBackend {
        fn new(suite: SuiteStats, verdicts: BTreeMap<String, RunVerdict>) -> Self {
            Self {
                suite,
                verdicts,
                run_log: Mutex::new(Vec::new()),
                stats_calls: AtomicUsize::new(0),
                fail_clean: false,
                forced_fail_passes: false,
                cancel_on: None,
                panic_on: None,
            }
        }

        fn log(&self) -> Vec<(String, Vec<String>)> {
            self.run_log.lock().expect("run log should lock").clone()
        }

        fn mutant_runs(&self) -> Vec<String> {
            self.log()
                .into_iter()
                .map(|(active, _)| active)
                .filter(|active| !active.is_empty() && active != "fail" && active != "stats")
                .collect()
        }

        fn output(verdict: RunVerdict) -> TestRunOutput {
            TestRunOutput {
                verdict,
                exit_code: Some(0),
                duration: Duration::from_millis(5),
                output_excerpt: "harness output".to_string(),
            }
        }
    }

    impl TestBackend for FakeBackend {
        fn run(
            &self,
            request: &TestRun,
            _cancel: &CancelToken,
        ) -> Result<TestRunOutput, BackendError> {
            self.run_log
                .lock()
                .expect("run log should lock")
                .push((request.active.env_value().to_string(), request.tests.clone()));

            let verdict = match &request.active {
                ActiveMutant::None => {
                    if self.fail_clean {
                        RunVerdict::Failed
                    } else {
                        RunVerdict::Passed
                    }
                }
                ActiveMutant::ForcedFail => {
                    if self.forced_fail_passes {
                        RunVerdict::Passed
                    } else {
                        RunVerdict::Failed
                    }
                }
                ActiveMutant::Stats => RunVerdict::Passed,
                ActiveMutant::Mutant(id) => {
                    if self.panic_on.as_deref() == Some(id.as_str()) {
                        panic!("fake backend panicked on {id}");
                    }
                    if let Some((target, token)) = &self.cancel_on {
                        if id == target {
                            token.cancel();
                            return Ok(Self::output(RunVerdict::Cancelled));
                        }
                    }
                    self.verdicts
                        .get(id)
                        .cloned()
                        .unwrap_or(RunVerdict::Passed)
                }
            };
            Ok(Self::output(verdict))
        }

        fn collect_stats(&self, _cancel: &CancelToken) -> Result<StatsCollection, BackendError> {
            self.stats_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(StatsCollection {
                suite: self.suite.clone(),
                duration: Duration::from_millis(40),
            })
        }
    }

    fn spec_for(id: &str, file: &str, line: u32) -> MutantSpec {
        MutantSpec {
            id: id.to_string(),
            file: PathBuf::from(file),
            line,
            column: 0,
            operator: "binary_operator".to_string(),
            description: format!("replace == with != ({id})"),
            skip: false,
        }
    }

    fn cover(suite: &mut SuiteStats, file: &str, line: u32, test: &str, depth: u32) {
        suite
            .contexts
            .entry(file.to_string())
            .or_default()
            .entry(line)
            .or_default()
            .insert(test.to_string(), depth);
    }

    fn full_suite() -> SuiteStats {
        let mut suite = SuiteStats::default();
        suite.tests.insert("t_calc".to_string(), 40);
        suite.tests.insert("t_util".to_string(), 10);
        suite.tests.insert("t_deep".to_string(), 100);
        for line in 1..=6 {
            cover(&mut suite, "src/calc.py", line, "t_calc", 1);
        }
        for line in 1..=3 {
            cover(&mut suite, "src/util.py", line, "t_util", 1);
            cover(&mut suite, "src/util.py", line, "t_deep", 3);
        }
        suite
    }

    fn ten_mutant_catalog() -> FakeCatalog {
        let mut specs = Vec::new();
        for line in 1..=6 {
            specs.push(spec_for(&format!("m{line}"), "src/calc.py", line));
        }
        for line in 1..=3 {
            specs.push(spec_for(&format!("m{}", 6 + line), "src/util.py", line));
        }
        specs.push(spec_for("m10", "src/orphan.py", 1));
        FakeCatalog { specs }
    }

    fn kill_six_verdicts() -> BTreeMap<String, RunVerdict> {
        let mut verdicts = BTreeMap::new();
        for id in ["m1", "m2", "m3", "m4", "m5", "m7"] {
            verdicts.insert(id.to_string(), RunVerdict::Failed);
        }
        for id in ["m6", "m8", "m9"] {
            verdicts.insert(id.to_string(), RunVerdict::Passed);
        }
        verdicts
    }

    fn config_for(cache_dir: &Path) -> SessionConfig {
        SessionConfig::default()
            .with_test_command("harness")
            .with_cache_dir(cache_dir)
    }

    fn statuses_in(cache_dir: &Path) -> BTreeMap<String, MutantStatus> {
        let store = CacheStore::new(cache_dir);
        let mut out = BTreeMap::new();
        for record in store
            .load_all_file_records()
            .expect("cache scan should work")
        {
            for (id, mutant) in record.mutants {
                out.insert(id, mutant.status);
            }
        }
        out
    }

    #[test]
    fn full_session_reaches_expected_terminal_statuses() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let sink = MemorySink::new();

        let summary = MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink)
            .run()
            .expect("session should succeed");

        assert_eq!(summary.total, 10);
        assert_eq!(summary.killed, 6);
        assert_eq!(summary.survived, 4);
        assert_eq!(summary.survived_no_tests, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.incomplete, 0);
        assert_eq!(summary.cached, 0);
        assert!(!summary.interrupted);
        assert!((summary.mutation_score - 60.0).abs() < 1e-9);

        // The uncovered mutant must survive without a harness run.
        let runs = backend.mutant_runs();
        assert_eq!(runs.len(), 9);
        assert!(!runs.contains(&"m10".to_string()));

        let statuses = statuses_in(tmp.path());
        assert_eq!(statuses.get("m1"), Some(&MutantStatus::Killed));
        assert_eq!(statuses.get("m6"), Some(&MutantStatus::Survived));
        assert_eq!(statuses.get("m10"), Some(&MutantStatus::Survived));
        assert_eq!(statuses.len(), 10);

        let events = sink.events();
        let started = events.iter().find(|event| {
            matches!(event, SessionEvent::SessionStarted { mutants: 10, tests: 3, .. })
        });
        assert!(started.is_some(), "session start event should be emitted");
        let finished_count = events
            .iter()
            .filter(|event| matches!(event, SessionEvent::MutantFinished { .. }))
            .count();
        assert_eq!(finished_count, 10);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::SessionFinished { .. })
        ));
    }

    #[test]
    fn selected_tests_follow_coverage_candidates() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = FakeCatalog {
            specs: vec![spec_for("m7", "src/util.py", 1)],
        };
        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let sink = MemorySink::new();

        MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink)
            .run()
            .expect("session should succeed");

        let mutant_requests: Vec<_> = backend
            .log()
            .into_iter()
            .filter(|(active, _)| active == "m7")
            .collect();
        assert_eq!(mutant_requests.len(), 1);
        // Duration-ascending order: t_util (10ms) before t_deep (100ms).
        assert_eq!(
            mutant_requests[0].1,
            vec!["t_util".to_string(), "t_deep".to_string()]
        );
    }

    #[test]
    fn selector_override_pins_the_test_list() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = FakeCatalog {
            specs: vec![
                spec_for("m1", "src/calc.py", 1),
                spec_for("m2", "src/calc.py", 2),
            ],
        };
        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let sink = MemorySink::new();

        let selector: TestSelector = Box::new(|spec, _index| {
            (spec.id == "m1").then(|| vec!["t_pinned".to_string()])
        });
        MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink)
            .with_selector(selector)
            .run()
            .expect("session should succeed");

        let log = backend.log();
        let m1 = log
            .iter()
            .find(|(active, _)| active == "m1")
            .expect("m1 should run");
        let m2 = log
            .iter()
            .find(|(active, _)| active == "m2")
            .expect("m2 should run");
        assert_eq!(m1.1, vec!["t_pinned".to_string()]);
        assert_eq!(m2.1, vec!["t_calc".to_string()]);
    }

    #[test]
    fn empty_catalog_is_a_configuration_error() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = FakeCatalog { specs: Vec::new() };
        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let sink = MemorySink::new();

        let mut session =
            MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink);
        let err = session.run().expect_err("empty catalog should fail");
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert!(backend.log().is_empty(), "no harness run should happen");
    }

    #[test]
    fn invalid_configuration_is_rejected_before_any_run() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let sink = MemorySink::new();

        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let err = MutationSession::new(
            config_for(tmp.path()).with_test_command("   "),
            &catalog,
            backend.clone(),
            &sink,
        )
        .run()
        .expect_err("blank command should fail");
        assert!(matches!(err, SessionError::Configuration(_)));

        let err = MutationSession::new(
            config_for(tmp.path()).with_timeout_base(-1.0),
            &catalog,
            backend.clone(),
            &sink,
        )
        .run()
        .expect_err("negative timeout should fail");
        assert!(matches!(err, SessionError::Configuration(_)));

        let err = MutationSession::new(
            config_for(tmp.path()).with_timeout_base(f64::NAN),
            &catalog,
            backend.clone(),
            &sink,
        )
        .run()
        .expect_err("NaN timeout should fail");
        assert!(matches!(err, SessionError::Configuration(_)));

        let err = MutationSession::new(
            config_for(tmp.path()).with_timeout_multiplier(f64::INFINITY),
            &catalog,
            backend.clone(),
            &sink,
        )
        .run()
        .expect_err("infinite multiplier should fail");
        assert!(matches!(err, SessionError::Configuration(_)));
        assert!(backend.log().is_empty());
    }

    #[test]
    fn oversized_timeouts_saturate_instead_of_panicking() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let sink = MemorySink::new();

        // Finite inputs whose derived timeout overflows Duration.
        let summary = MutationSession::new(
            config_for(tmp.path()).with_timeout_multiplier(1e300),
            &catalog,
            backend,
            &sink,
        )
        .run()
        .expect("session should finish despite an unrepresentable timeout");
        assert_eq!(summary.killed, 6);
        assert_eq!(summary.incomplete, 0);
    }

    #[test]
    fn filters_can_exclude_every_mutant() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let sink = MemorySink::new();

        let err = MutationSession::new(
            config_for(tmp.path()).with_disabled_operators(["binary_operator"]),
            &catalog,
            backend,
            &sink,
        )
        .run()
        .expect_err("all-excluded catalog should fail");
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn substring_filter_narrows_the_session() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let sink = MemorySink::new();

        let summary = MutationSession::new(
            config_for(tmp.path()).with_filter("util"),
            &catalog,
            backend.clone(),
            &sink,
        )
        .run()
        .expect("session should succeed");

        assert_eq!(summary.total, 3);
        let runs = backend.mutant_runs();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|id| ["m7", "m8", "m9"].contains(&id.as_str())));
    }

    #[test]
    fn unknown_rerun_id_is_rejected() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let sink = MemorySink::new();

        let err = MutationSession::new(
            config_for(tmp.path()).with_rerun_mutants(["m_missing"]),
            &catalog,
            backend,
            &sink,
        )
        .run()
        .expect_err("unknown rerun id should fail");
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn zero_tests_is_a_configuration_error() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let backend = Arc::new(FakeBackend::new(SuiteStats::default(), BTreeMap::new()));
        let sink = MemorySink::new();

        let err = MutationSession::new(config_for(tmp.path()), &catalog, backend, &sink)
            .run()
            .expect_err("empty suite should fail");
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn failing_clean_baseline_stops_the_session() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let mut backend = FakeBackend::new(full_suite(), kill_six_verdicts());
        backend.fail_clean = true;
        let backend = Arc::new(backend);
        let sink = MemorySink::new();

        let mut session =
            MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink);
        let err = session.run().expect_err("dirty baseline should fail");
        assert!(matches!(err, SessionError::Baseline { .. }));
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert!(backend.mutant_runs().is_empty(), "no mutant may run");
        assert!(sink.events().iter().any(|event| matches!(
            event,
            SessionEvent::Error { kind, .. } if kind == "baseline"
        )));
    }

    #[test]
    fn unwired_harness_fails_the_forced_fail_check() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let mut backend = FakeBackend::new(full_suite(), kill_six_verdicts());
        backend.forced_fail_passes = true;
        let backend = Arc::new(backend);
        let sink = MemorySink::new();

        let err = MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink)
            .run()
            .expect_err("unwired harness should fail");
        assert!(matches!(err, SessionError::Wiring));
        assert!(backend.mutant_runs().is_empty());
    }

    #[test]
    fn second_session_reuses_cached_results() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let sink = MemorySink::new();

        let first_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let first =
            MutationSession::new(config_for(tmp.path()), &catalog, first_backend, &sink)
                .run()
                .expect("first session should succeed");

        let second_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let second_sink = MemorySink::new();
        let second = MutationSession::new(
            config_for(tmp.path()),
            &catalog,
            second_backend.clone(),
            &second_sink,
        )
        .run()
        .expect("second session should succeed");

        assert_eq!(second.killed, first.killed);
        assert_eq!(second.survived, first.survived);
        assert_eq!(second.cached, 10);
        assert_eq!(
            second_backend
                .stats_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0,
            "cached stats should be reused"
        );
        assert!(second_backend.mutant_runs().is_empty());
        assert!(second_sink.events().iter().any(|event| matches!(
            event,
            SessionEvent::MutantFinished { cached: true, .. }
        )));
    }

    #[test]
    fn forced_rerun_executes_only_listed_mutants() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let sink = MemorySink::new();

        let first_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        MutationSession::new(config_for(tmp.path()), &catalog, first_backend, &sink)
            .run()
            .expect("first session should succeed");

        // m6 survived the first session; a fixed suite now kills it.
        let mut verdicts = kill_six_verdicts();
        verdicts.insert("m6".to_string(), RunVerdict::Failed);
        let second_backend = Arc::new(FakeBackend::new(full_suite(), verdicts));
        let second = MutationSession::new(
            config_for(tmp.path()).with_rerun_mutants(["m6"]),
            &catalog,
            second_backend.clone(),
            &sink,
        )
        .run()
        .expect("rerun session should succeed");

        assert_eq!(second_backend.mutant_runs(), vec!["m6".to_string()]);
        assert_eq!(second.cached, 9);
        assert_eq!(second.killed, 7);
        let statuses = statuses_in(tmp.path());
        assert_eq!(statuses.get("m6"), Some(&MutantStatus::Killed));
        assert_eq!(statuses.get("m8"), Some(&MutantStatus::Survived));
    }

    #[test]
    fn rerun_all_ignores_the_cache() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let sink = MemorySink::new();

        let first_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        MutationSession::new(config_for(tmp.path()), &catalog, first_backend, &sink)
            .run()
            .expect("first session should succeed");

        let second_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let second = MutationSession::new(
            config_for(tmp.path()).with_rerun_all(true),
            &catalog,
            second_backend.clone(),
            &sink,
        )
        .run()
        .expect("rerun-all session should succeed");

        assert_eq!(second.cached, 0);
        assert_eq!(
            second_backend
                .stats_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1,
            "stats should be collected fresh"
        );
        assert_eq!(second_backend.mutant_runs().len(), 9);
    }

    #[test]
    fn timeouts_and_crashes_map_to_their_statuses() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = FakeCatalog {
            specs: vec![
                spec_for("m_loop", "src/calc.py", 1),
                spec_for("m_crash", "src/calc.py", 2),
            ],
        };
        let mut verdicts = BTreeMap::new();
        verdicts.insert("m_loop".to_string(), RunVerdict::TimedOut);
        verdicts.insert("m_crash".to_string(), RunVerdict::Crashed { signal: Some(11) });
        let backend = Arc::new(FakeBackend::new(full_suite(), verdicts));
        let sink = MemorySink::new();

        let summary = MutationSession::new(config_for(tmp.path()), &catalog, backend, &sink)
            .run()
            .expect("session should succeed");

        assert_eq!(summary.timeout, 1);
        assert_eq!(summary.suspicious, 1);
        assert!(!summary.is_clean());

        let crash_outcome = sink
            .events()
            .into_iter()
            .find_map(|event| match event {
                SessionEvent::MutantFinished {
                    mutant_id, outcome, ..
                } if mutant_id == "m_crash" => Some(outcome),
                _ => None,
            })
            .expect("crash outcome should be reported");
        assert_eq!(crash_outcome.signal, Some(11));
    }

    #[test]
    fn panicking_backend_is_absorbed_as_suspicious() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = FakeCatalog {
            specs: vec![
                spec_for("m_boom", "src/calc.py", 1),
                spec_for("m_ok", "src/calc.py", 2),
            ],
        };
        let mut verdicts = BTreeMap::new();
        verdicts.insert("m_ok".to_string(), RunVerdict::Failed);
        let mut backend = FakeBackend::new(full_suite(), verdicts);
        backend.panic_on = Some("m_boom".to_string());
        let backend = Arc::new(backend);
        let sink = MemorySink::new();

        let summary = MutationSession::new(config_for(tmp.path()), &catalog, backend, &sink)
            .run()
            .expect("session should survive a panicking backend");

        assert_eq!(summary.suspicious, 1);
        assert_eq!(summary.killed, 1);
        assert_eq!(summary.incomplete, 0);
        let statuses = statuses_in(tmp.path());
        assert_eq!(statuses.get("m_boom"), Some(&MutantStatus::Suspicious));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            SessionEvent::Error { kind, .. } if kind == "backend"
        )));
    }

    #[test]
    fn catalog_skips_and_uncovered_lines_are_skipped() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut marked = spec_for("m_marked", "src/calc.py", 1);
        marked.skip = true;
        let catalog = FakeCatalog {
            specs: vec![
                marked,
                spec_for("m_uncovered", "src/calc.py", 99),
                spec_for("m_live", "src/calc.py", 2),
            ],
        };
        let backend = Arc::new(FakeBackend::new(full_suite(), BTreeMap::new()));
        let sink = MemorySink::new();

        let summary = MutationSession::new(
            config_for(tmp.path()).with_mutate_only_covered_lines(true),
            &catalog,
            backend.clone(),
            &sink,
        )
        .run()
        .expect("session should succeed");

        assert_eq!(summary.skipped, 2);
        assert_eq!(backend.mutant_runs(), vec!["m_live".to_string()]);
        let statuses = statuses_in(tmp.path());
        assert_eq!(statuses.get("m_marked"), Some(&MutantStatus::Skipped));
        assert_eq!(statuses.get("m_uncovered"), Some(&MutantStatus::Skipped));
    }

    #[test]
    fn covered_only_mode_requires_context_data() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let mut suite = SuiteStats::default();
        suite.tests.insert("t_calc".to_string(), 40);
        let backend = Arc::new(FakeBackend::new(suite, BTreeMap::new()));
        let sink = MemorySink::new();

        let err = MutationSession::new(
            config_for(tmp.path()).with_mutate_only_covered_lines(true),
            &catalog,
            backend,
            &sink,
        )
        .run()
        .expect_err("covered-only without contexts should fail");
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn parallel_and_serial_sessions_agree() {
        let serial_tmp = tempdir().expect("tempdir should be created");
        let parallel_tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let sink = MemorySink::new();

        let serial_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let serial = MutationSession::new(
            config_for(serial_tmp.path()).with_parallelism(1),
            &catalog,
            serial_backend,
            &sink,
        )
        .run()
        .expect("serial session should succeed");

        let parallel_backend = Arc::new(FakeBackend::new(full_suite(), kill_six_verdicts()));
        let parallel = MutationSession::new(
            config_for(parallel_tmp.path()).with_parallelism(4),
            &catalog,
            parallel_backend,
            &sink,
        )
        .run()
        .expect("parallel session should succeed");

        assert_eq!(parallel.killed, serial.killed);
        assert_eq!(parallel.survived, serial.survived);
        assert_eq!(
            statuses_in(parallel_tmp.path()),
            statuses_in(serial_tmp.path())
        );
    }

    #[test]
    fn cancellation_drains_and_preserves_finished_work() {
        let tmp = tempdir().expect("tempdir should be created");
        let catalog = ten_mutant_catalog();
        let cancel = CancelToken::new();
        let mut backend = FakeBackend::new(full_suite(), kill_six_verdicts());
        backend.cancel_on = Some(("m3".to_string(), cancel.clone()));
        let backend = Arc::new(backend);
        let sink = MemorySink::new();

        let mut session =
            MutationSession::new(config_for(tmp.path()), &catalog, backend.clone(), &sink)
                .with_cancel_token(cancel);
        let summary = session.run().expect("interrupted session should finish");

        assert!(summary.interrupted);
        assert_eq!(summary.killed, 2);
        assert_eq!(summary.incomplete, 7);
        assert_eq!(session.phase(), SessionPhase::Done);

        // Only finished mutants may reach the cache.
        let statuses = statuses_in(tmp.path());
        assert_eq!(statuses.get("m1"), Some(&MutantStatus::Killed));
        assert_eq!(statuses.get("m2"), Some(&MutantStatus::Killed));
        assert!(!statuses.contains_key("m3"));
        assert!(!statuses.contains_key("m4"));

        let events = sink.events();
        let started: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::MutantStarted { mutant_id, .. } => Some(mutant_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["m1", "m2", "m3"]);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::SessionFinished { summary, .. }) if summary.interrupted
        ));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("session-"));
    }
}
