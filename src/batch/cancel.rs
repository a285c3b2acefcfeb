use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::Instant,
};

/// Why a batch was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// A sibling task failed while running in fail-fast mode.
    TaskFailed { input: PathBuf },
    /// The batch deadline passed.
    DeadlineElapsed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskFailed { input } => write!(f, "'{}' failed", input.display()),
            Self::DeadlineElapsed => f.write_str("batch deadline elapsed"),
        }
    }
}

/// One-shot, cooperative cancellation shared by every task of a batch.
///
/// The token starts out live and is tripped at most once; the reason recorded by the first
/// caller of [`CancelToken::cancel`] wins and the token never resets. Cloning is cheap and all
/// clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    reason: OnceLock<CancelReason>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that trips itself the first time it is checked at or after `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                deadline: Some(deadline),
            }),
        }
    }

    /// Trip the token. Returns `true` only for the call that actually transitioned it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.inner.reason.set(reason).is_ok()
    }

    /// Entry check for a task: the reason if the batch is cancelled, `None` otherwise.
    pub fn check(&self) -> Option<CancelReason> {
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            self.cancel(CancelReason::DeadlineElapsed);
        }
        self.inner.reason.get().cloned()
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_some()
    }

    /// The recorded reason, without evaluating the deadline.
    pub fn reason(&self) -> Option<&CancelReason> {
        self.inner.reason.get()
    }
}
