use std::{
    fs::File,
    path::{Path, PathBuf},
};

use tracing::subscriber::DefaultGuard;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::LevelFilter, fmt, fmt::format::FmtSpan, layer::SubscriberExt as _,
};

/// Default trace file name, relative to the working directory.
pub const DEFAULT_TRACE_PATH: &str = "trace.out";

/// Per-run diagnostic sink: JSON span/event records written to a trace file, plus optional
/// human-readable logging on stderr.
///
/// The sink is installed as the `tracing` default for the creating thread; [`run_batch`]
/// forwards it to its workers. The file is flushed and synced exactly once, by
/// [`TraceSink::finish`] or, failing that, on drop.
///
/// [`run_batch`]: crate::run_batch
pub struct TraceSink {
    path: PathBuf,
    file: Option<File>,
    worker: Option<WorkerGuard>,
    default: Option<DefaultGuard>,
}

impl TraceSink {
    /// Create (or truncate) the trace file at `path` and start recording.
    ///
    /// `console` adds a stderr layer with the given filter.
    pub fn create(path: impl AsRef<Path>, console: Option<EnvFilter>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let sync_handle = file.try_clone()?;

        let (writer, worker) = NonBlockingBuilder::default().lossy(false).finish(file);
        let file_layer = fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(LevelFilter::DEBUG);
        let console_layer = console.map(|filter| {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter)
        });

        let subscriber = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer);
        let default = tracing::subscriber::set_default(subscriber);

        Ok(Self {
            path,
            file: Some(sync_handle),
            worker: Some(worker),
            default: Some(default),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop recording, drain buffered records and sync the file.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.close()
    }

    fn close(&mut self) -> std::io::Result<()> {
        drop(self.default.take());
        // Dropping the worker guard drains the non-blocking writer.
        drop(self.worker.take());
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

impl Drop for TraceSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Console filter: `RUST_LOG` when set, otherwise `warn`, raised by each `-v`.
pub fn console_filter(verbosity: u8) -> EnvFilter {
    let fallback = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}
