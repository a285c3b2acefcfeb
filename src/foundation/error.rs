use std::{
    fmt,
    path::{Path, PathBuf},
};

use crate::{
    batch::{cancel::CancelReason, pool::BatchReport},
    convert::task::Task,
};

pub type ConvertResult<T> = Result<T, ConvertError>;

/// Failure reported by a [`Codec`](crate::Codec) while decoding or encoding.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CodecError {
    pub fn other(msg: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Other(anyhow::Error::msg(msg))
    }
}

/// Terminal failure of a single conversion task.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("cancelled before start: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("open '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decode '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("output '{}' would overwrite its source", path.display())]
    SameAsSource { path: PathBuf },

    #[error("output '{}' is already produced by '{}'", path.display(), first.display())]
    DuplicateOutput { path: PathBuf, first: PathBuf },

    #[error("create '{}': {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode '{}': {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("flush '{}': {source}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A primary failure after which the partial output could not be removed either.
    #[error("{primary}; additionally failed to remove '{}': {source}", path.display())]
    Cleanup {
        primary: Box<ConvertError>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion of '{}' panicked: {message}", path.display())]
    Panicked { path: PathBuf, message: String },
}

/// Coarse classification of a [`ConvertError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Decode,
    Encode,
    Flush,
    Cleanup,
    Cancelled,
    Crash,
}

impl ConvertError {
    pub fn open(path: &Path, source: std::io::Error) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn read(path: &Path, source: std::io::Error) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn decode(path: &Path, source: CodecError) -> Self {
        Self::Decode {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn create(path: &Path, source: std::io::Error) -> Self {
        Self::Create {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn encode(path: &Path, source: CodecError) -> Self {
        Self::Encode {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn flush(path: &Path, source: std::io::Error) -> Self {
        Self::Flush {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn panicked(path: &Path, message: impl Into<String>) -> Self {
        Self::Panicked {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Attach a failed removal of `path` to `self`, keeping `self` as the primary cause.
    pub fn with_cleanup_failure(self, path: &Path, source: std::io::Error) -> Self {
        Self::Cleanup {
            primary: Box::new(self),
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Open { .. }
            | Self::Read { .. }
            | Self::Create { .. }
            | Self::SameAsSource { .. }
            | Self::DuplicateOutput { .. } => ErrorKind::Io,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Encode { .. } => ErrorKind::Encode,
            Self::Flush { .. } => ErrorKind::Flush,
            Self::Cleanup { .. } => ErrorKind::Cleanup,
            Self::Panicked { .. } => ErrorKind::Crash,
        }
    }

    /// The triggering error; for a combined cleanup failure this is the wrapped cause.
    pub fn primary(&self) -> &ConvertError {
        match self {
            Self::Cleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Failure to run a batch at all, or the aggregated failure of a finished batch.
#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("invalid batch options: {0}")]
    Validation(String),

    #[error("failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Failed(#[from] BatchFailure),
}

impl BatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// The finished batch, if the error came from failed tasks rather than setup.
    pub fn failure(&self) -> Option<&BatchFailure> {
        match self {
            Self::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// A batch that ran to completion with at least one task not succeeding.
///
/// Every task's outcome is retained in [`BatchFailure::report`]; the failure observed first in
/// time is singled out for the summary line.
#[derive(Debug)]
pub struct BatchFailure {
    pub report: BatchReport,
}

impl BatchFailure {
    pub fn first_error(&self) -> Option<(&Task, &ConvertError)> {
        self.report.first_failure()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.report;
        write!(f, "{} of {} files failed", r.failed(), r.len())?;
        if r.cancelled() > 0 {
            write!(f, ", {} cancelled", r.cancelled())?;
        }
        match (self.first_error(), r.cancel_reason()) {
            (Some((_, err)), _) => write!(f, "; first: {err}"),
            (None, Some(reason)) => write!(f, "; {reason}"),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for BatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.first_error()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}
