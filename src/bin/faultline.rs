use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use faultline::{
    CacheStore, CancelToken, CommandBackend, CoverageIndex, EventSink, ManifestCatalog,
    MutationCatalog, MutationSession, ReportFormat, SessionConfig, SessionError, SessionEvent,
    estimate_mutants, install_interrupt_handler, render_estimates, render_results,
};

#[derive(Debug, Parser)]
#[command(name = "faultline")]
#[command(about = "Coverage-guided mutation testing sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a mutation testing session. Cached results resume automatically.
    Run(RunArgs),
    /// Render the results recorded in the cache.
    Results {
        /// Result cache directory.
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// Show candidate tests and timeouts per mutant without running anything.
    Estimates {
        /// Mutant manifest path.
        #[arg(long, default_value = "mutants.json")]
        manifest: PathBuf,
        /// Result cache directory.
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Ignore candidate tests recorded deeper than this stack depth.
        #[arg(long)]
        max_stack_depth: Option<u32>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// Print the candidate tests for one mutant.
    TestsForMutant {
        /// Mutant id from the manifest.
        mutant_id: String,
        /// Mutant manifest path.
        #[arg(long, default_value = "mutants.json")]
        manifest: PathBuf,
        /// Result cache directory.
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Ignore candidate tests recorded deeper than this stack depth.
        #[arg(long)]
        max_stack_depth: Option<u32>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Mutant manifest path.
    #[arg(long, default_value = "mutants.json")]
    manifest: PathBuf,
    /// Project directory the test command runs in.
    #[arg(long)]
    project: Option<PathBuf>,
    /// Result cache directory.
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Test command, split on whitespace.
    #[arg(long)]
    test_command: Option<String>,
    /// Restrict mutation to these path prefixes. Repeatable.
    #[arg(long = "path")]
    paths: Vec<PathBuf>,
    /// Test directories exported to the harness. Repeatable.
    #[arg(long = "tests-dir")]
    tests_dirs: Vec<PathBuf>,
    /// Concurrent mutant runs.
    #[arg(long)]
    parallelism: Option<usize>,
    /// Fixed component of the per-mutant timeout, in seconds.
    #[arg(long)]
    timeout_base: Option<f64>,
    /// Multiplier over the estimated suite duration.
    #[arg(long)]
    timeout_multiplier: Option<f64>,
    /// Ignore candidate tests recorded deeper than this stack depth.
    #[arg(long)]
    max_stack_depth: Option<u32>,
    /// Skip mutants on lines no test covers.
    #[arg(long)]
    covered_only: bool,
    /// Disable a mutation operator by name. Repeatable.
    #[arg(long = "disable-operator")]
    disabled_operators: Vec<String>,
    /// Discard cached results and rerun everything.
    #[arg(long)]
    rerun_all: bool,
    /// Rerun a mutant id even when cached. Repeatable.
    #[arg(long = "rerun")]
    rerun_mutants: Vec<String>,
    /// Substring filter on mutant id, description, or file.
    #[arg(long)]
    filter: Option<String>,
    /// Exit code meaning "no tests collected". Repeatable.
    #[arg(long = "no-tests-exit-code")]
    no_tests_exit_codes: Vec<i32>,
    /// Emit line-delimited JSON events instead of progress lines.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn into_config(self) -> (SessionConfig, PathBuf, bool) {
        let mut config = SessionConfig::default()
            .with_mutate_only_covered_lines(self.covered_only)
            .with_rerun_all(self.rerun_all)
            .with_disabled_operators(self.disabled_operators)
            .with_rerun_mutants(self.rerun_mutants);
        if let Some(project) = self.project {
            config = config.with_project_dir(project);
        }
        if let Some(cache) = self.cache {
            config = config.with_cache_dir(cache);
        }
        if let Some(test_command) = self.test_command {
            config = config.with_test_command(test_command);
        }
        if !self.paths.is_empty() {
            config = config.with_paths_to_mutate(self.paths);
        }
        if !self.tests_dirs.is_empty() {
            config = config.with_tests_dirs(self.tests_dirs);
        }
        if let Some(parallelism) = self.parallelism {
            config = config.with_parallelism(parallelism);
        }
        if let Some(timeout_base) = self.timeout_base {
            config = config.with_timeout_base(timeout_base);
        }
        if let Some(timeout_multiplier) = self.timeout_multiplier {
            config = config.with_timeout_multiplier(timeout_multiplier);
        }
        if let Some(max_stack_depth) = self.max_stack_depth {
            config = config.with_max_stack_depth(max_stack_depth);
        }
        if let Some(filter) = self.filter {
            config = config.with_filter(filter);
        }
        if !self.no_tests_exit_codes.is_empty() {
            config = config.with_no_tests_exit_codes(self.no_tests_exit_codes);
        }
        (config, self.manifest, self.json)
    }
}

struct PrintSink {
    json: bool,
}

impl EventSink for PrintSink {
    fn emit(&self, event: &SessionEvent) {
        if self.json {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
            return;
        }
        match event {
            SessionEvent::SessionStarted {
                session_id,
                mutants,
                tests,
                ..
            } => {
                println!("{session_id}: {mutants} mutants, {tests} known tests");
            }
            SessionEvent::MutantStarted { mutant_id, .. } => {
                println!("running {mutant_id}");
            }
            SessionEvent::MutantFinished {
                mutant_id,
                outcome,
                cached,
                ..
            } => {
                let origin = if *cached { " (cached)" } else { "" };
                println!("{mutant_id}: {}{origin}", outcome.status.as_str());
            }
            SessionEvent::SessionFinished { summary, .. } => {
                println!("{}", summary.one_line());
            }
            SessionEvent::Error { kind, message, .. } => {
                eprintln!("error [{kind}]: {message}");
            }
        }
    }
}

fn cache_dir_or_default(cache: Option<PathBuf>) -> PathBuf {
    cache.unwrap_or_else(|| SessionConfig::default().cache_dir)
}

fn load_coverage(store: &CacheStore, max_stack_depth: Option<u32>) -> Result<CoverageIndex> {
    let record = store
        .load_stats()?
        .context("no suite stats recorded; run a session first")?;
    Ok(CoverageIndex::new(&record.suite, max_stack_depth))
}

fn run_session(args: RunArgs) -> Result<i32> {
    let (config, manifest, json) = args.into_config();
    let catalog = ManifestCatalog::new(manifest);
    let backend = Arc::new(CommandBackend::from_config(&config)?);
    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel)?;
    let sink = PrintSink { json };

    let mut session =
        MutationSession::new(config, &catalog, backend, &sink).with_cancel_token(cancel);
    match session.run() {
        Ok(summary) => {
            if summary.interrupted {
                Ok(130)
            } else if summary.is_clean() {
                Ok(0)
            } else {
                Ok(2)
            }
        }
        Err(err) => {
            eprintln!("faultline: {err}");
            match err {
                SessionError::Configuration(_)
                | SessionError::Baseline { .. }
                | SessionError::Wiring => Ok(3),
                _ => Ok(1),
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let code = run_session(args)?;
            std::process::exit(code);
        }
        Command::Results { cache, json } => {
            let store = CacheStore::new(cache_dir_or_default(cache));
            let records = store.load_all_file_records()?;
            if records.is_empty() {
                anyhow::bail!(
                    "no recorded results under {}; run a session first",
                    store.root().display()
                );
            }
            let format = if json {
                ReportFormat::Json
            } else {
                ReportFormat::Text
            };
            println!("{}", render_results(&records, format));
        }
        Command::Estimates {
            manifest,
            cache,
            max_stack_depth,
            json,
        } => {
            let store = CacheStore::new(cache_dir_or_default(cache));
            let index = load_coverage(&store, max_stack_depth)?;
            let specs = ManifestCatalog::new(manifest).generate()?;
            let estimates = estimate_mutants(&specs, &index, &SessionConfig::default());
            let format = if json {
                ReportFormat::Json
            } else {
                ReportFormat::Text
            };
            println!("{}", render_estimates(&estimates, format));
        }
        Command::TestsForMutant {
            mutant_id,
            manifest,
            cache,
            max_stack_depth,
        } => {
            let specs = ManifestCatalog::new(manifest).generate()?;
            let Some(spec) = specs.iter().find(|spec| spec.id == mutant_id) else {
                println!("mutant not found: {mutant_id}");
                std::process::exit(1);
            };
            let store = CacheStore::new(cache_dir_or_default(cache));
            let index = load_coverage(&store, max_stack_depth)?;
            for test in index.candidate_tests(&spec.file, spec.line) {
                println!("{test}");
            }
        }
    }

    Ok(())
}
