//! # faultline
//!
//! `faultline` is a resumable mutation-testing session engine organized around:
//! - `catalog`: mutant description sources
//! - `coverage`: suite timings and per-line coverage lookup
//! - `backend`: subprocess test execution with env-based mutant activation
//! - `session`: the phase-driven orchestrator
//! - `persist`: crash-safe incremental result caching
//! - `report`: summaries, estimates, and rendering
//!
//! Mutants run against an unmodified working tree: activation happens inside
//! the target process through environment variables, never by rewriting
//! source files on disk.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod backend;
pub mod catalog;
pub mod config;
pub mod coverage;
pub mod events;
pub mod mutant;
pub mod persist;
/// Human-readable and machine-friendly report generation.
pub mod report;
pub mod session;
pub mod worker;

pub use backend::{
    ActiveMutant, BackendError, CommandBackend, FORCED_FAIL_SENTINEL, MUTANT_ENV, RunVerdict,
    STATS_FILE_ENV, STATS_SENTINEL, StatsCollection, TESTS_DIRS_ENV, TestBackend, TestRun,
    TestRunOutput,
};
pub use catalog::{CatalogError, ManifestCatalog, MutationCatalog};
pub use config::SessionConfig;
pub use coverage::{CoverageIndex, SuiteStats};
pub use events::{EventSink, MemorySink, NullSink, SessionEvent, now_timestamp_ms};
pub use mutant::{MutantEntry, MutantSpec, MutantStatus, MutantStore, Outcome, StoreError};
pub use persist::{CacheStore, FileRecord, MutantRecord, PersistError, SCHEMA_VERSION, StatsRecord};
pub use report::{
    MutantEstimate, ReportFormat, SessionSummary, estimate_mutants, render_estimates,
    render_results,
};
pub use session::{MutationSession, SessionError, SessionPhase, TestSelector};
pub use worker::{
    CancelToken, WorkerError, WorkerJob, WorkerPool, WorkerResult, install_interrupt_handler,
};
