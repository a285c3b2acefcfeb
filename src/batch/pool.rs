use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{
        Mutex, OnceLock, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    batch::cancel::{CancelReason, CancelToken},
    codec::Codec,
    convert::task::{Task, convert},
    foundation::error::{BatchError, BatchFailure, ConvertError, ConvertResult},
};

/// Scheduling configuration for [`run_batch`].
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Maximum number of tasks in flight. `None` uses the available parallelism.
    pub concurrency: Option<usize>,
    /// Cancel all not-yet-started tasks as soon as one task fails.
    pub fail_fast: bool,
    /// Cancel all not-yet-started tasks once this much time has passed since the batch began.
    pub deadline: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            fail_fast: true,
            deadline: None,
        }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<(), BatchError> {
        if let Some(n) = self.concurrency
            && n == 0
        {
            return Err(BatchError::validation(
                "batch 'concurrency' must be >= 1 when set",
            ));
        }
        Ok(())
    }

    /// Worker count for a batch of `tasks` files; never more workers than tasks.
    pub fn workers_for(&self, tasks: usize) -> usize {
        let limit = self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        limit.min(tasks).max(1)
    }
}

/// Terminal state of one task.
#[derive(Debug)]
pub enum TaskState {
    Succeeded,
    Failed(ConvertError),
    /// Never started because the batch had already been cancelled.
    Cancelled(CancelReason),
}

impl TaskState {
    fn from_outcome(outcome: ConvertResult<()>) -> Self {
        match outcome {
            Ok(()) => Self::Succeeded,
            Err(ConvertError::Cancelled { reason }) => Self::Cancelled(reason),
            Err(err) => Self::Failed(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn error(&self) -> Option<&ConvertError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct TaskReport {
    pub task: Task,
    pub state: TaskState,
}

/// Outcome of every task of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub tasks: Vec<TaskReport>,
    first_failure: Option<usize>,
    cancel_reason: Option<CancelReason>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, TaskState::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TaskState::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, TaskState::Cancelled(_)))
    }

    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_success())
    }

    /// Failed tasks (cancellations excluded) in input order.
    pub fn failures(&self) -> impl Iterator<Item = (&Task, &ConvertError)> {
        self.tasks
            .iter()
            .filter_map(|t| t.state.error().map(|e| (&t.task, e)))
    }

    /// The task whose failure was observed first in time.
    pub fn first_failure(&self) -> Option<(&Task, &ConvertError)> {
        let report = self.tasks.get(self.first_failure?)?;
        report.state.error().map(|e| (&report.task, e))
    }

    /// Why the batch was cancelled, if it was.
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        self.cancel_reason.as_ref()
    }

    pub fn into_result(self) -> Result<Self, BatchFailure> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BatchFailure { report: self })
        }
    }

    fn count(&self, pred: impl Fn(&TaskState) -> bool) -> usize {
        self.tasks.iter().filter(|t| pred(&t.state)).count()
    }
}

/// Convert every file in `inputs` through `codec` on a bounded worker pool.
///
/// Exactly one task is created per input and every task reaches a terminal [`TaskState`] before
/// this returns. At most `opts.concurrency` tasks run at once: a fixed set of workers pulls
/// tasks off a shared queue. A panic inside a task is caught at the worker and recorded as
/// [`ConvertError::Panicked`] for that input only.
///
/// The batch succeeds iff every task succeeded. Otherwise [`BatchError::Failed`] carries the
/// full [`BatchReport`]: every failure is kept, and the one observed first is singled out.
/// With `fail_fast`, the first failure cancels every task that has not started yet; tasks
/// already running finish, including their own cleanup.
///
/// Inputs that derive the same output path are not written twice: the earliest owns the output
/// and the rest fail with [`ConvertError::DuplicateOutput`].
pub fn run_batch(
    inputs: &[PathBuf],
    codec: &dyn Codec,
    opts: &BatchOptions,
) -> Result<BatchReport, BatchError> {
    opts.validate()?;

    let tasks: Vec<Task> = inputs
        .iter()
        .enumerate()
        .map(|(i, p)| Task::new(i, p.clone(), codec.target_extension()))
        .collect();

    let workers = opts.workers_for(tasks.len());
    let span = tracing::info_span!("convert_all", files = tasks.len(), concurrency = workers);
    let _enter = span.enter();

    if tasks.is_empty() {
        tracing::info!(succeeded = 0, failed = 0, cancelled = 0, "batch finished");
        return Ok(BatchReport::default());
    }

    let duplicates = duplicate_outputs(&tasks);
    let cancel = match opts.deadline {
        Some(d) => CancelToken::with_deadline(Instant::now() + d),
        None => CancelToken::new(),
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("rasterbatch-{i}"))
        .build()?;

    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    let next = AtomicUsize::new(0);
    let first_failure = OnceLock::new();
    let states: Mutex<Vec<Option<TaskState>>> =
        Mutex::new(std::iter::repeat_with(|| None).take(tasks.len()).collect());

    let shared = Shared {
        tasks: &tasks,
        duplicates: &duplicates,
        codec,
        cancel: &cancel,
        fail_fast: opts.fail_fast,
        next: &next,
        first_failure: &first_failure,
        states: &states,
    };

    pool.scope(|s| {
        for _ in 0..workers {
            let shared = &shared;
            let span = &span;
            let dispatch = &dispatch;
            s.spawn(move |_| {
                tracing::dispatcher::with_default(dispatch, || span.in_scope(|| shared.work()));
            });
        }
    });

    let states = states.into_inner().unwrap_or_else(PoisonError::into_inner);
    let report = BatchReport {
        tasks: tasks
            .into_iter()
            .zip(states)
            .map(|(task, state)| {
                // Every queue slot is claimed by exactly one worker, which always records a state.
                let state = state.unwrap_or_else(|| {
                    TaskState::Failed(ConvertError::panicked(&task.input, "task was never run"))
                });
                TaskReport { task, state }
            })
            .collect(),
        first_failure: first_failure.get().copied(),
        cancel_reason: cancel.reason().cloned(),
    };

    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        cancelled = report.cancelled(),
        "batch finished"
    );

    report.into_result().map_err(BatchError::from)
}

/// State shared by the workers of one batch.
struct Shared<'a> {
    tasks: &'a [Task],
    /// For each task, the earlier task writing the same output, if any.
    duplicates: &'a [Option<usize>],
    codec: &'a dyn Codec,
    cancel: &'a CancelToken,
    fail_fast: bool,
    next: &'a AtomicUsize,
    first_failure: &'a OnceLock<usize>,
    states: &'a Mutex<Vec<Option<TaskState>>>,
}

impl Shared<'_> {
    fn work(&self) {
        loop {
            let i = self.next.fetch_add(1, Ordering::Relaxed);
            let Some(task) = self.tasks.get(i) else {
                break;
            };
            let outcome = match (self.duplicates[i], self.cancel.check()) {
                (Some(_), Some(reason)) => Err(ConvertError::Cancelled { reason }),
                (Some(first), None) => Err(ConvertError::DuplicateOutput {
                    path: task.output.clone(),
                    first: self.tasks[first].input.clone(),
                }),
                (None, _) => self.run_contained(task),
            };
            let state = TaskState::from_outcome(outcome);
            self.record(task, state);
        }
    }

    /// Run one task, turning a panic into an ordinary failure for that task.
    fn run_contained(&self, task: &Task) -> ConvertResult<()> {
        std::panic::catch_unwind(AssertUnwindSafe(|| convert(task, self.codec, self.cancel)))
            .unwrap_or_else(|payload| {
                Err(ConvertError::panicked(&task.input, panic_message(&*payload)))
            })
    }

    fn record(&self, task: &Task, state: TaskState) {
        if let TaskState::Failed(err) = &state {
            tracing::warn!(path = %task.input.display(), error = %err, "conversion failed");
            let _ = self.first_failure.set(task.index);
            if self.fail_fast {
                self.cancel.cancel(CancelReason::TaskFailed {
                    input: task.input.clone(),
                });
            }
        }

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states[task.index] = Some(state);
    }
}

/// Output paths are compared as given; only the first task claiming a path gets to write it.
fn duplicate_outputs(tasks: &[Task]) -> Vec<Option<usize>> {
    let mut owners = HashMap::<&std::path::Path, usize>::with_capacity(tasks.len());
    tasks
        .iter()
        .map(|t| {
            let owner = *owners.entry(t.output.as_path()).or_insert(t.index);
            (owner != t.index).then_some(owner)
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
