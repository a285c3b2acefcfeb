use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use rasterbatch::{BatchError, BatchOptions, ImageCodec, RasterFormat, TaskState, TraceSink};

#[derive(Parser, Debug)]
#[command(name = "rasterbatch", version)]
struct Cli {
    /// Input files to convert. An empty list is a successful no-op.
    files: Vec<PathBuf>,

    /// Source format.
    #[arg(long, value_enum, default_value_t = RasterFormat::Png)]
    from: RasterFormat,

    /// Target format.
    #[arg(long, value_enum, default_value_t = RasterFormat::Jpeg)]
    to: RasterFormat,

    /// Maximum number of files converted at once (defaults to available parallelism).
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Keep converting remaining files after a failure.
    #[arg(long, default_value_t = false)]
    keep_going: bool,

    /// Skip files not yet started after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = rasterbatch::DEFAULT_JPEG_QUALITY)]
    quality: u8,

    /// Trace file path.
    #[arg(long, default_value = rasterbatch::DEFAULT_TRACE_PATH)]
    trace: PathBuf,

    /// Do not write a trace file.
    #[arg(long, default_value_t = false)]
    no_trace: bool,

    /// Increase stderr log verbosity (overridden by RUST_LOG).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// `Ok(false)` means the batch ran but some files failed.
fn run(cli: Cli) -> anyhow::Result<bool> {
    let console = rasterbatch::console_filter(cli.verbose);
    let sink = if cli.no_trace {
        // Console logging only; the subscriber is process-wide.
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(console)
            .try_init()
            .ok();
        None
    } else {
        Some(
            TraceSink::create(&cli.trace, Some(console))
                .with_context(|| format!("create trace file '{}'", cli.trace.display()))?,
        )
    };

    let codec = ImageCodec::new(cli.from, cli.to).with_jpeg_quality(cli.quality);
    let opts = BatchOptions {
        concurrency: cli.jobs,
        fail_fast: !cli.keep_going,
        deadline: cli.timeout_secs.map(Duration::from_secs),
    };

    let result = rasterbatch::run_batch(&cli.files, &codec, &opts);

    if let Some(sink) = sink {
        let path = sink.path().to_path_buf();
        // The batch already ran; a lost trace must not hide its outcome.
        if let Err(err) = sink.finish() {
            eprintln!("warning: flush trace file '{}': {err}", path.display());
        }
    }

    match result {
        Ok(_) => Ok(true),
        Err(BatchError::Failed(failure)) => {
            for report in &failure.report.tasks {
                match &report.state {
                    TaskState::Failed(err) => {
                        eprintln!("failed: {}: {err}", report.task.input.display());
                    }
                    TaskState::Cancelled(reason) => {
                        eprintln!("skipped: {} ({reason})", report.task.input.display());
                    }
                    TaskState::Succeeded => {}
                }
            }
            eprintln!("{failure}");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}
