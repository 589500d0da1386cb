//! Worker supervision: bounded slots, cancellation, no orphaned processes.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{BackendError, RunVerdict, TestBackend, TestRun, TestRunOutput};

/// Supervision errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The pool's channels closed while work was outstanding.
    #[error("worker pool disconnected with work outstanding")]
    Disconnected,
    /// Interrupt handler installation failed.
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

/// Shared cancellation flag observed by the session and every worker.
///
/// One token reaches all live workers; a running harness process is killed
/// within one backend poll interval of `cancel`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

static ACTIVE_TOKEN: Mutex<Option<CancelToken>> = Mutex::new(None);

/// Route interrupt signals to `token`.
///
/// The process-wide handler is installed once; later calls only swap which
/// token it cancels, so each session can bring its own.
pub fn install_interrupt_handler(token: &CancelToken) -> Result<(), WorkerError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    if let Ok(mut active) = ACTIVE_TOKEN.lock() {
        *active = Some(token.clone());
    }

    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            if let Ok(active) = ACTIVE_TOKEN.lock() {
                if let Some(token) = active.as_ref() {
                    token.cancel();
                }
            }
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(WorkerError::Signal(msg.clone())),
    }
}

/// One unit of work: run `request` and report back under `mutant_id`.
#[derive(Debug)]
pub struct WorkerJob {
    /// Mutant this job tests.
    pub mutant_id: String,
    /// Harness run to execute.
    pub request: TestRun,
}

/// Completion report for one job.
#[derive(Debug)]
pub struct WorkerResult {
    /// Mutant the job tested.
    pub mutant_id: String,
    /// Harness output, or the backend error that prevented the run.
    pub output: Result<TestRunOutput, BackendError>,
}

/// Bounded pool of supervision threads, each hosting one harness child
/// process at a time.
///
/// Test execution always happens in a spawned child process; the threads only
/// supervise. `shutdown` (also run on drop) closes the queue and joins every
/// thread, which cannot hang: workers observe cancellation between jobs and
/// the backend kills a running child once the shared token fires.
pub struct WorkerPool {
    job_tx: Option<Sender<WorkerJob>>,
    result_rx: Receiver<WorkerResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool with `slots` workers (clamped to at least one) over `backend`.
    pub fn new(
        backend: Arc<dyn TestBackend + Send + Sync>,
        slots: usize,
        cancel: CancelToken,
    ) -> Self {
        let slots = slots.max(1);
        let (job_tx, job_rx) = mpsc::channel::<WorkerJob>();
        let (result_tx, result_rx) = mpsc::channel::<WorkerResult>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let backend = Arc::clone(&backend);
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            handles.push(std::thread::spawn(move || {
                worker_loop(slot, backend, job_rx, result_tx, cancel);
            }));
        }

        Self {
            job_tx: Some(job_tx),
            result_rx,
            handles,
        }
    }

    /// Enqueue one job.
    pub fn submit(&self, job: WorkerJob) -> Result<(), WorkerError> {
        match &self.job_tx {
            Some(tx) => tx.send(job).map_err(|_| WorkerError::Disconnected),
            None => Err(WorkerError::Disconnected),
        }
    }

    /// Block until the next job completes.
    pub fn collect(&self) -> Result<WorkerResult, WorkerError> {
        self.result_rx.recv().map_err(|_| WorkerError::Disconnected)
    }

    /// Close the queue and join every worker.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn worker_loop(
    slot: usize,
    backend: Arc<dyn TestBackend + Send + Sync>,
    job_rx: Arc<Mutex<Receiver<WorkerJob>>>,
    result_tx: Sender<WorkerResult>,
    cancel: CancelToken,
) {
    loop {
        // Hold the queue lock only for the receive, never across a run.
        let job = {
            let guard = match job_rx.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            guard.recv()
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => return,
        };

        if cancel.is_cancelled() {
            let _ = result_tx.send(WorkerResult {
                mutant_id: job.mutant_id,
                output: Ok(TestRunOutput {
                    verdict: RunVerdict::Cancelled,
                    exit_code: None,
                    duration: Duration::ZERO,
                    output_excerpt: String::new(),
                }),
            });
            continue;
        }

        debug!(slot, mutant_id = %job.mutant_id, "worker picked up job");
        // A panicking backend must still yield a result, or collect() would
        // wait forever for this job.
        let output = std::panic::catch_unwind(AssertUnwindSafe(|| {
            backend.run(&job.request, &cancel)
        }))
        .unwrap_or_else(|payload| {
            warn!(slot, mutant_id = %job.mutant_id, "backend panicked during run");
            Err(BackendError::Panicked {
                message: panic_message(payload),
            })
        });
        if result_tx
            .send(WorkerResult {
                mutant_id: job.mutant_id,
                output,
            })
            .is_err()
        {
            return;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
