/// Parallel step execution: fork one worker process per unit of work, capture
/// each worker's output privately, and multiplex everything into one merged
/// stream without duplication or loss.
///
/// The supervisor is a plain poll loop. Every `poll_interval` it reaps
/// finished workers and forwards newly written sink bytes to the output
/// stream. A step may itself run a nested set of parallel steps: the nested
/// supervisor drains into its own stdout, which is the outer worker's capture
/// sink, so the same algorithm composes without special cases.
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::thread;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::capture::OutputCapture;
use crate::config::RunnerConfig;
use crate::queue::WorkQueue;

/// Outcome of one unit of work.
pub type StepResult = Result<(), Box<dyn std::error::Error>>;

/// A unit of work the runner executes in a forked worker process.
///
/// The runner never mutates a step in the supervising process; the step's
/// state is value-copied into the child at fork time and `run` executes
/// there.
pub trait Step: Send {
    fn run(&mut self) -> StepResult;
}

impl<F> Step for F
where
    F: FnMut() -> StepResult + Send,
{
    fn run(&mut self) -> StepResult {
        self()
    }
}

/// One worker that raised or exited non-zero.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    /// Label of the step the worker was running.
    pub label: String,
    /// Worker PID, for correlating with the merged output.
    pub pid: i32,
    /// Process exit code (None if killed by a signal).
    pub exit_code: Option<i32>,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (pid {}) exited with code {}", self.label, self.pid, code),
            None => write!(f, "{} (pid {}) was killed by a signal", self.label, self.pid),
        }
    }
}

/// One or more workers failed. Carries every failure; siblings are never
/// aborted early, so the list is complete by the time this is raised.
#[derive(Debug)]
pub struct AggregateFailure {
    pub failures: Vec<WorkerFailure>,
    /// How many steps ran in total.
    pub total: usize,
}

impl std::fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} parallel steps failed: ",
            self.failures.len(),
            self.total
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

/// Errors raised by the parallel runners.
#[derive(Debug)]
pub enum RunnerError {
    /// A worker could not be forked or its capture sink set up.
    Spawn { step: String, source: io::Error },
    /// Draining worker output to the merged stream failed.
    Drain { source: io::Error },
    /// One or more steps failed; everything ran to completion first.
    Failed { source: AggregateFailure },
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Spawn { step, source } => {
                write!(f, "failed to spawn worker for {}: {}", step, source)
            }
            RunnerError::Drain { source } => {
                write!(f, "failed to drain worker output: {}", source)
            }
            RunnerError::Failed { source } => write!(f, "{}", source),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Spawn { source, .. } => Some(source),
            RunnerError::Drain { source } => Some(source),
            RunnerError::Failed { source } => Some(source),
        }
    }
}

/// Supervisor-side record of one forked worker.
#[derive(Debug)]
struct Worker {
    label: String,
    pid: Pid,
    capture: OutputCapture,
    done: bool,
}

/// Runs steps in forked worker processes and multiplexes their output.
pub struct ParallelTaskRunner {
    poll_interval: Duration,
    workers: Vec<Worker>,
    failures: Vec<WorkerFailure>,
    output: Box<dyn Write + Send>,
}

impl ParallelTaskRunner {
    /// A runner that merges worker output into the real stdout.
    pub fn new(config: &RunnerConfig) -> Self {
        Self::with_output(config, Box::new(io::stdout()))
    }

    /// A runner that merges worker output into `output` instead of stdout.
    pub fn with_output(config: &RunnerConfig, output: Box<dyn Write + Send>) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            workers: Vec::new(),
            failures: Vec::new(),
            output,
        }
    }

    /// Fork one worker to run `step`.
    ///
    /// The child redirects its stdout/stderr into a fresh capture sink,
    /// invokes the step, and exits 0 on `Ok` or 1 on `Err`/panic (writing the
    /// error text to the sink first, so it shows up in the merged stream).
    pub fn spawn<S: Step + 'static>(
        &mut self,
        label: impl Into<String>,
        step: S,
    ) -> Result<(), RunnerError> {
        self.spawn_boxed(label.into(), Box::new(step))
    }

    /// [`ParallelTaskRunner::spawn`] for steps already behind a box.
    pub fn spawn_boxed(
        &mut self,
        label: String,
        mut step: Box<dyn Step>,
    ) -> Result<(), RunnerError> {
        let capture = OutputCapture::new().map_err(|e| RunnerError::Spawn {
            step: label.clone(),
            source: e,
        })?;

        // Don't let our own buffered bytes cross the fork and get written
        // once per process.
        io::stdout().flush().ok();
        io::stderr().flush().ok();

        match unsafe { fork() }.map_err(|e| RunnerError::Spawn {
            step: label.clone(),
            source: io::Error::from(e),
        })? {
            ForkResult::Child => {
                let code = worker_main(step.as_mut(), &capture);
                process::exit(code);
            }
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), step = %label, "spawned step worker");
                self.workers.push(Worker {
                    label,
                    pid: child,
                    capture,
                    done: false,
                });
                Ok(())
            }
        }
    }

    /// One supervisor pass: reap workers that have exited and forward newly
    /// available sink bytes to the output stream.
    pub fn drain(&mut self) -> io::Result<()> {
        for worker in &mut self.workers {
            if worker.done {
                continue;
            }

            // Check for exit before reading the sink, so a worker that just
            // finished gets its final bytes in this same pass.
            match waitpid(worker.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, 0)) => {
                    debug!(pid = worker.pid.as_raw(), step = %worker.label, "step worker finished");
                    worker.done = true;
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    warn!(
                        pid = worker.pid.as_raw(),
                        step = %worker.label,
                        code,
                        "step worker failed"
                    );
                    worker.done = true;
                    self.failures.push(WorkerFailure {
                        label: worker.label.clone(),
                        pid: worker.pid.as_raw(),
                        exit_code: Some(code),
                    });
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    warn!(
                        pid = worker.pid.as_raw(),
                        step = %worker.label,
                        signal = %sig,
                        "step worker killed by signal"
                    );
                    worker.done = true;
                    self.failures.push(WorkerFailure {
                        label: worker.label.clone(),
                        pid: worker.pid.as_raw(),
                        exit_code: None,
                    });
                }
                Ok(_) => {
                    // Stopped/continued under a debugger; still alive.
                }
                Err(err) => {
                    warn!(
                        pid = worker.pid.as_raw(),
                        step = %worker.label,
                        %err,
                        "lost track of step worker"
                    );
                    worker.done = true;
                }
            }

            worker.capture.drain_into(self.output.as_mut())?;
        }
        Ok(())
    }

    /// Whether any worker is still running (as of the last drain pass).
    pub fn has_live_workers(&self) -> bool {
        self.workers.iter().any(|w| !w.done)
    }

    /// Block until every worker has exited, draining output on the poll
    /// interval, then surface the collected failures.
    ///
    /// Never aborts siblings early: a failed worker's peers keep running and
    /// their output keeps flowing. Calling `join` again after completion is a
    /// no-op. A worker that never exits blocks here forever; wall-clock
    /// budgets belong to the caller.
    pub fn join(&mut self) -> Result<(), RunnerError> {
        loop {
            self.drain().map_err(|e| RunnerError::Drain { source: e })?;
            if !self.has_live_workers() {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        // Final sweep over every sink; cursors of long-finished workers are
        // already at end-of-content, so nothing is echoed twice.
        for worker in &mut self.workers {
            worker
                .capture
                .drain_into(self.output.as_mut())
                .map_err(|e| RunnerError::Drain { source: e })?;
        }
        self.output
            .flush()
            .map_err(|e| RunnerError::Drain { source: e })?;

        let failures = std::mem::take(&mut self.failures);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Failed {
                source: AggregateFailure {
                    failures,
                    total: self.workers.len(),
                },
            })
        }
    }
}

impl Drop for ParallelTaskRunner {
    fn drop(&mut self) {
        if self.has_live_workers() {
            warn!("parallel runner dropped with live workers, joining");
            if let Err(err) = self.join() {
                warn!(%err, "steps failed while joining on drop");
            }
        }
    }
}

/// Body of a forked step worker. Runs in the child; the return value becomes
/// the process exit code.
fn worker_main(step: &mut dyn Step, capture: &OutputCapture) -> i32 {
    // Writes below go through the stdio handles, not the print macros; the
    // macros detour through libtest's in-memory capture when the parent is a
    // test binary, and that capture dies with the child instead of reaching
    // the sink.
    if let Err(err) = capture.redirect_child() {
        let _ = writeln!(io::stderr(), "failed to redirect worker output: {err}");
        return 1;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| step.run()));
    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            let _ = writeln!(io::stderr(), "step failed: {err}");
            1
        }
        Err(_) => {
            let _ = writeln!(io::stderr(), "step panicked");
            1
        }
    };

    io::stdout().flush().ok();
    io::stderr().flush().ok();
    code
}

/// Run every step concurrently, one forked worker each, and block until all
/// of them have finished.
///
/// The merged output obeys the capture guarantees: each worker's bytes appear
/// in their own order, intact, exactly once. If any step failed, the error
/// aggregates every failure after everything has run to completion. May be
/// called from inside a step; the nested merged stream lands in the outer
/// worker's sink.
pub fn run_parallel_steps(steps: Vec<Box<dyn Step>>) -> Result<(), RunnerError> {
    run_parallel_steps_with(steps, &RunnerConfig::default())
}

/// [`run_parallel_steps`] with explicit tunables.
pub fn run_parallel_steps_with(
    steps: Vec<Box<dyn Step>>,
    config: &RunnerConfig,
) -> Result<(), RunnerError> {
    let mut runner = ParallelTaskRunner::new(config);
    for (index, step) in steps.into_iter().enumerate() {
        runner.spawn_boxed(format!("step-{index}"), step)?;
    }
    runner.join()
}

/// A pool of persistent background workers fed from a [`WorkQueue`].
///
/// Each worker loops pulling items and invoking the task function until the
/// queue closes. A failed item is logged to the worker's sink and counted;
/// the worker finishes the rest of the queue and exits non-zero, so `close`
/// reports it in the aggregate without ever stranding queued work.
pub struct BackgroundTaskRunner<T> {
    queue: WorkQueue<T>,
    runner: ParallelTaskRunner,
    closed: bool,
}

impl<T> BackgroundTaskRunner<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Fork `config.processes` workers over `queue`, merging their output
    /// into the real stdout.
    pub fn start<F>(queue: WorkQueue<T>, task_fn: F, config: &RunnerConfig) -> Result<Self, RunnerError>
    where
        F: FnMut(T) -> StepResult + Send + Clone + 'static,
    {
        Self::start_with_output(queue, task_fn, config, Box::new(io::stdout()))
    }

    /// [`BackgroundTaskRunner::start`] with an explicit merged-output sink.
    pub fn start_with_output<F>(
        mut queue: WorkQueue<T>,
        task_fn: F,
        config: &RunnerConfig,
        output: Box<dyn Write + Send>,
    ) -> Result<Self, RunnerError>
    where
        F: FnMut(T) -> StepResult + Send + Clone + 'static,
    {
        let mut runner = ParallelTaskRunner::with_output(config, output);
        for index in 0..config.processes.max(1) {
            let label = format!("worker-{index}");
            let spawned = queue
                .consumer()
                .map_err(|e| RunnerError::Spawn {
                    step: label.clone(),
                    source: io::Error::other(e),
                })
                .and_then(|mut consumer| {
                    let mut task = task_fn.clone();
                    runner.spawn(label, move || -> StepResult {
                        consumer.worker_init();
                        let mut failed = 0u32;
                        loop {
                            match consumer.get() {
                                Ok(Some(item)) => {
                                    if let Err(err) = task(item) {
                                        let _ = writeln!(
                                            io::stderr(),
                                            "background task failed: {err}"
                                        );
                                        failed += 1;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => return Err(Box::new(err)),
                            }
                        }
                        if failed > 0 {
                            Err(format!("{failed} background task(s) failed").into())
                        } else {
                            Ok(())
                        }
                    })
                });
            if let Err(err) = spawned {
                // Close the queue before the runner's drop joins the workers
                // already forked; without EOF they would never exit.
                queue.close();
                return Err(err);
            }
        }

        Ok(Self {
            queue,
            runner,
            closed: false,
        })
    }

    /// Enqueue one item for the worker pool.
    pub fn put(&self, item: &T) -> Result<(), crate::queue::QueueError> {
        self.queue.put(item)
    }
}

impl<T> BackgroundTaskRunner<T> {
    /// Close the queue, drain remaining output, and join the workers.
    pub fn close(mut self) -> Result<(), RunnerError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), RunnerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.queue.close();
        self.runner.join()
    }
}

impl<T> Drop for BackgroundTaskRunner<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close_inner() {
                warn!(%err, "background workers failed during drop close");
            }
        }
    }
}
