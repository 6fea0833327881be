//! Per-notebook serialized execution queue.
//!
//! Each notebook gets one worker task that evaluates submissions strictly one
//! after another on the blocking thread pool. Interrupting discards the worker
//! together with everything it had not started; the next submission spawns a
//! fresh one.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use cellsync_core::{
    BufferedSink, CellId, InterpreterSession, NotebookId, SessionHandle,
    progress::{ExecutionStatus, ProgressEvent, ProgressSender},
    traits::InterpreterError,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::eval::Evaluator;

/// Message returned by [`ExecutionQueue::interrupt`].
pub const INTERRUPT_MESSAGE: &str = "Code execution stopped successfully";

/// Why a submission did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Execution was interrupted")]
    Interrupted,
    #[error("Interpreter session is corrupted: {0}")]
    SessionCorrupted(String),
    #[error("Interpreter session is closed")]
    SessionClosed,
    #[error("Execution worker stopped unexpectedly")]
    WorkerStopped,
}

/// Outcome of one submission: `Ok(true)` once it ran to completion, whether or
/// not the user code itself failed.
pub type ExecutionResult = Result<bool, ExecutionError>;

struct Job {
    id: u64,
    cell_id: CellId,
    code: String,
    session: SessionHandle,
}

struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    task: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<ExecutionResult>>,
    executing: Option<CellId>,
    worker: Option<Worker>,
    closed: bool,
}

struct Inner {
    notebook_id: NotebookId,
    events: ProgressSender,
    stdout: BufferedSink,
    stderr: BufferedSink,
    state: Mutex<QueueState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, cell_id: CellId, status: ExecutionStatus) {
        if self.events.send(ProgressEvent::status(cell_id, status)).is_err() {
            tracing::debug!(notebook_id = %self.notebook_id, ?status, "Progress receiver gone");
        }
    }

    fn flush(&self) {
        for sink in [&self.stdout, &self.stderr] {
            if let Err(e) = sink.flush() {
                tracing::warn!(notebook_id = %self.notebook_id, stream = ?sink.stream(), "Failed to flush output: {e}");
            }
        }
    }

    /// Evaluate one job on the current (blocking) thread.
    fn run_job(&self, job: Job, cancelled: &AtomicBool) {
        {
            let mut state = self.lock();
            if cancelled.load(Ordering::Acquire) || !state.pending.contains_key(&job.id) {
                return;
            }
            state.executing = Some(job.cell_id.clone());
            self.report(job.cell_id.clone(), ExecutionStatus::Executing);
        }

        tracing::debug!(notebook_id = %self.notebook_id, cell_id = %job.cell_id, "Executing cell");
        let evaluator = Evaluator::new(job.session.as_ref(), &self.events, &self.stdout, &self.stderr);
        let outcome = evaluator.run(&job.code);
        self.flush();

        let mut state = self.lock();
        if cancelled.load(Ordering::Acquire) {
            // Interrupt already reported and resolved this job.
            return;
        }
        state.executing = None;
        let (status, result) = match outcome {
            Ok(report) if report.had_errors => (ExecutionStatus::Failure, Ok(true)),
            Ok(_) => (ExecutionStatus::Success, Ok(true)),
            Err(InterpreterError::IllegalState(message)) => {
                tracing::error!(notebook_id = %self.notebook_id, cell_id = %job.cell_id, "Interpreter state corrupted: {message}");
                (ExecutionStatus::Failure, Err(ExecutionError::SessionCorrupted(message)))
            }
            Err(InterpreterError::Shutdown) => {
                tracing::warn!(notebook_id = %self.notebook_id, cell_id = %job.cell_id, "Interpreter shut down during execution");
                (ExecutionStatus::Failure, Err(ExecutionError::SessionClosed))
            }
        };
        self.report(job.cell_id, status);
        if let Some(tx) = state.pending.remove(&job.id) {
            let _ = tx.send(result);
        }
    }

    /// Stop the worker and fail everything pending with `error`.
    ///
    /// Returns the aborted worker task, if there was one.
    fn cancel(&self, error: &ExecutionError) -> Option<JoinHandle<()>> {
        let mut state = self.lock();
        self.flush();
        if let Some(cell_id) = state.executing.take() {
            self.report(cell_id, ExecutionStatus::Interrupted);
        }
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(error.clone()));
        }
        state.worker.take().map(|worker| {
            worker.cancelled.store(true, Ordering::Release);
            worker.task
        })
    }
}

impl Inner {
    /// Hand a reserved submission to the worker, unless it was already
    /// resolved by an interrupt or shutdown.
    fn enqueue(self: &Arc<Self>, id: u64, cell_id: CellId, code: String, session: SessionHandle) {
        let mut state = self.lock();
        if !state.pending.contains_key(&id) {
            tracing::debug!(notebook_id = %self.notebook_id, cell_id = %cell_id, "Submission resolved before it was queued");
            return;
        }
        self.report(cell_id.clone(), ExecutionStatus::Queued);

        let worker = state.worker.get_or_insert_with(|| spawn_worker(self));
        let job = Job {
            id,
            cell_id,
            code,
            session,
        };
        if worker.tx.send(job).is_err() {
            tracing::error!(notebook_id = %self.notebook_id, "Execution worker is gone");
            state.worker = None;
            if let Some(tx) = state.pending.remove(&id) {
                let _ = tx.send(Err(ExecutionError::WorkerStopped));
            }
        }
    }
}

fn spawn_worker(inner: &Arc<Inner>) -> Worker {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let cancelled = Arc::new(AtomicBool::new(false));
    let task = {
        let inner = Arc::clone(inner);
        let cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                let inner = Arc::clone(&inner);
                let flag = Arc::clone(&cancelled);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || inner.run_job(job, &flag)).await
                {
                    tracing::error!("Execution job panicked: {e}");
                }
            }
        })
    };
    Worker {
        tx,
        task,
        cancelled,
    }
}

/// Pending slot returned by [`ExecutionQueue::reserve`].
///
/// Dropping it without submitting releases the slot.
pub struct Reservation {
    inner: Arc<Inner>,
    id: u64,
    cell_id: CellId,
    rx: Option<oneshot::Receiver<ExecutionResult>>,
}

impl Reservation {
    /// Queue `code` against `session` in this slot.
    ///
    /// If the slot was interrupted or shut down in the meantime nothing runs
    /// and the returned future yields that outcome. Must be called inside a
    /// Tokio runtime.
    pub fn submit(
        mut self,
        session: SessionHandle,
        code: String,
    ) -> impl Future<Output = ExecutionResult> + Send + 'static {
        let rx = self.rx.take();
        self.inner.enqueue(self.id, self.cell_id.clone(), code, session);
        async move {
            match rx {
                Some(rx) => rx.await.unwrap_or(Err(ExecutionError::WorkerStopped)),
                None => Err(ExecutionError::WorkerStopped),
            }
        }
    }

    /// Outcome already delivered to this slot by an interrupt or shutdown.
    pub fn resolved(&mut self) -> Option<ExecutionResult> {
        self.rx.as_mut()?.try_recv().ok()
    }

    #[must_use]
    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.inner.lock().pending.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("cell_id", &self.cell_id)
            .finish_non_exhaustive()
    }
}

/// Serialized execution queue for one notebook.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    #[must_use]
    pub fn new(
        notebook_id: NotebookId,
        events: ProgressSender,
        stdout: BufferedSink,
        stderr: BufferedSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                notebook_id,
                events,
                stdout,
                stderr,
                state: Mutex::default(),
            }),
        }
    }

    #[must_use]
    pub fn notebook_id(&self) -> &str {
        &self.inner.notebook_id
    }

    /// Cell currently being evaluated.
    #[must_use]
    pub fn executing_cell(&self) -> Option<CellId> {
        self.inner.lock().executing.clone()
    }

    /// Submissions not yet resolved, including the executing one.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Take a pending slot for `cell_id` before its session is available.
    ///
    /// The slot counts as pending from now on, so [`interrupt`](Self::interrupt)
    /// and [`shutdown`](Self::shutdown) resolve it like any queued submission.
    #[must_use]
    pub fn reserve(&self, cell_id: CellId) -> Reservation {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        if state.closed {
            let _ = tx.send(Err(ExecutionError::SessionClosed));
        } else {
            state.pending.insert(id, tx);
        }
        Reservation {
            inner: Arc::clone(&self.inner),
            id,
            cell_id,
            rx: Some(rx),
        }
    }

    /// Queue `code` from `cell_id` for evaluation against `session`.
    ///
    /// The submission is registered and reported `Queued` before this returns;
    /// the returned future only waits for its result. Must be called inside a
    /// Tokio runtime.
    pub fn submit(
        &self,
        session: SessionHandle,
        cell_id: CellId,
        code: String,
    ) -> impl Future<Output = ExecutionResult> + Send + 'static {
        self.reserve(cell_id).submit(session, code)
    }

    /// Stop the running evaluation and drop everything queued behind it.
    ///
    /// Output is flushed, the executing cell is reported `Interrupted` and
    /// every pending submission resolves to [`ExecutionError::Interrupted`].
    /// Safe to call when idle.
    ///
    /// Aborting the interpreter is best effort: an evaluation that ignores the
    /// abort keeps running on its blocking thread, possibly alongside the next
    /// submission on the same session. Its result is discarded.
    pub fn interrupt(&self, session: Option<&dyn InterpreterSession>) -> &'static str {
        let task = self.inner.cancel(&ExecutionError::Interrupted);
        if let Some(session) = session {
            session.abort();
        }
        if let Some(task) = task {
            task.abort();
        }
        tracing::info!(notebook_id = %self.inner.notebook_id, "Execution interrupted");
        INTERRUPT_MESSAGE
    }

    /// Fail everything pending with [`ExecutionError::SessionClosed`] and
    /// refuse further submissions. Idempotent.
    pub fn shutdown(&self) {
        let task = self.inner.cancel(&ExecutionError::SessionClosed);
        self.inner.lock().closed = true;
        if let Some(task) = task {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ExecutionQueue")
            .field("notebook_id", &self.inner.notebook_id)
            .field("pending", &state.pending.len())
            .field("executing", &state.executing)
            .field("closed", &state.closed)
            .finish()
    }
}
