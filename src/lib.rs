//! Rasterbatch converts a batch of raster image files from one format to another in parallel.
//!
//! # Model
//!
//! - A batch is an ordered list of input paths. Each input becomes one [`Task`] whose output path
//!   is the input with its extension replaced by the codec's target extension.
//! - [`run_batch`] schedules the tasks on a fixed-size worker pool. At most
//!   [`BatchOptions::concurrency`] tasks are in flight at any time.
//! - Every task either leaves a complete, durably written output file or no output file at all.
//! - Cancellation is cooperative and one-shot ([`CancelToken`]): a task checks it once before
//!   touching the filesystem; tasks already past that check run to completion.
//! - Pixel work is delegated to a [`Codec`]. [`ImageCodec`] is the `image`-crate implementation.
//!
//! # Aggregation contract
//!
//! A batch succeeds iff every task succeeded. On failure, [`BatchFailure`] retains the outcome
//! of every task; the failure observed first in time is singled out for reporting, and a
//! primary error whose cleanup also failed is kept together with that cleanup error.
#![forbid(unsafe_code)]

mod batch;
mod codec;
mod convert;
mod diagnostics;
mod foundation;

pub use batch::cancel::{CancelReason, CancelToken};
pub use batch::pool::{BatchOptions, BatchReport, TaskReport, TaskState, run_batch};
pub use codec::{Codec, DEFAULT_JPEG_QUALITY, EncodeSink, ImageCodec, RasterFormat};
pub use convert::output::{PartialOutput, output_path_for};
pub use convert::task::{Task, convert};
pub use diagnostics::{DEFAULT_TRACE_PATH, TraceSink, console_filter};
pub use foundation::error::{
    BatchError, BatchFailure, CodecError, ConvertError, ConvertResult, ErrorKind,
};
