use std::{
    collections::HashSet,
    io::{Cursor, Write as _},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::ThreadId,
    time::Duration,
};

use image::DynamicImage;
use rasterbatch::{
    BatchOptions, CancelReason, Codec, CodecError, EncodeSink, ErrorKind, ImageCodec, TaskState,
    run_batch,
};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "rasterbatch_{name}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_png(path: &Path) {
    let img = image::RgbaImage::from_raw(1, 1, vec![10u8, 20u8, 30u8, 255u8]).unwrap();
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    std::fs::write(path, &buf).unwrap();
}

fn pngs(dir: &Path, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let p = dir.join(format!("in{i}.png"));
            write_png(&p);
            p
        })
        .collect()
}

/// Counts tasks from decode entry to encode exit, while each holds a decoded image and, during
/// encode, its output file. Source files are read and closed before decode on the same thread,
/// so the set of threads seen bounds how many sources are open at once.
#[derive(Default)]
struct CountingCodec {
    inner: ImageCodec,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    threads: Mutex<HashSet<ThreadId>>,
}

impl Codec for CountingCodec {
    fn target_extension(&self) -> &str {
        self.inner.target_extension()
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        self.threads
            .lock()
            .unwrap()
            .insert(std::thread::current().id());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(15));
        let res = self.inner.decode(bytes);
        if res.is_err() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        res
    }

    fn encode(&self, image: &DynamicImage, sink: &mut dyn EncodeSink) -> Result<(), CodecError> {
        let res = self.inner.encode(image, sink);
        self.active.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

/// Panics while decoding inputs whose bytes are `PANIC`, or mid-encode when `panic_in_encode`.
struct CrashingCodec {
    panic_in_encode: bool,
}

impl Codec for CrashingCodec {
    fn target_extension(&self) -> &str {
        "jpg"
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        if bytes == b"PANIC" {
            panic!("decoder blew up");
        }
        ImageCodec::png_to_jpeg().decode(bytes)
    }

    fn encode(&self, image: &DynamicImage, sink: &mut dyn EncodeSink) -> Result<(), CodecError> {
        if self.panic_in_encode {
            sink.write_all(&[0u8; 64])?;
            sink.flush()?;
            panic!("encoder blew up");
        }
        ImageCodec::png_to_jpeg().encode(image, sink)
    }
}

/// Writes a few bytes without flushing them, leaving the failure to the task's own flush.
struct BufferedCodec;

impl Codec for BufferedCodec {
    fn target_extension(&self) -> &str {
        "jpg"
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        ImageCodec::png_to_jpeg().decode(bytes)
    }

    fn encode(&self, _: &DynamicImage, sink: &mut dyn EncodeSink) -> Result<(), CodecError> {
        sink.write_all(&[0xffu8; 16])?;
        Ok(())
    }
}

/// Deletes the output out from under the task, then fails, so cleanup fails too.
struct VanishingCodec {
    output: PathBuf,
}

impl Codec for VanishingCodec {
    fn target_extension(&self) -> &str {
        "jpg"
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        ImageCodec::png_to_jpeg().decode(bytes)
    }

    fn encode(&self, _: &DynamicImage, _: &mut dyn EncodeSink) -> Result<(), CodecError> {
        std::fs::remove_file(&self.output)?;
        Err(CodecError::other("device went away"))
    }
}

#[test]
fn concurrency_never_exceeds_limit() {
    for limit in [1usize, 2, 3] {
        let dir = temp_dir(&format!("pool_limit_{limit}"));
        let inputs = pngs(&dir, 7);
        let codec = CountingCodec::default();

        let opts = BatchOptions {
            concurrency: Some(limit),
            ..BatchOptions::default()
        };
        let report = run_batch(&inputs, &codec, &opts).unwrap();

        assert_eq!(report.succeeded(), 7);
        assert!(codec.peak.load(Ordering::SeqCst) <= limit);
        assert_eq!(codec.active.load(Ordering::SeqCst), 0);
        assert!(codec.threads.lock().unwrap().len() <= limit);

        std::fs::remove_dir_all(&dir).ok();
    }
}

#[test]
fn serial_pool_runs_one_at_a_time() {
    let dir = temp_dir("pool_serial");
    let inputs = pngs(&dir, 5);
    let codec = CountingCodec::default();

    let opts = BatchOptions {
        concurrency: Some(1),
        ..BatchOptions::default()
    };
    run_batch(&inputs, &codec, &opts).unwrap();
    assert_eq!(codec.peak.load(Ordering::SeqCst), 1);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn panicking_task_is_contained() {
    let dir = temp_dir("pool_panic");
    let mut inputs = pngs(&dir, 4);
    let boom = dir.join("boom.png");
    std::fs::write(&boom, b"PANIC").unwrap();
    inputs.insert(2, boom.clone());

    let opts = BatchOptions {
        concurrency: Some(2),
        fail_fast: false,
        ..BatchOptions::default()
    };
    let err = run_batch(
        &inputs,
        &CrashingCodec {
            panic_in_encode: false,
        },
        &opts,
    )
    .unwrap_err();
    let report = &err.failure().unwrap().report;

    assert_eq!(report.len(), 5);
    assert_eq!(report.succeeded(), 4);
    let crashed: Vec<_> = report.failures().collect();
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].0.input, boom);
    assert_eq!(crashed[0].1.kind(), ErrorKind::Crash);
    assert!(crashed[0].1.to_string().contains("decoder blew up"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn panic_mid_encode_leaves_no_output() {
    let dir = temp_dir("pool_panic_encode");
    let inputs = pngs(&dir, 3);

    let opts = BatchOptions {
        concurrency: Some(3),
        fail_fast: false,
        ..BatchOptions::default()
    };
    let err = run_batch(
        &inputs,
        &CrashingCodec {
            panic_in_encode: true,
        },
        &opts,
    )
    .unwrap_err();
    let report = &err.failure().unwrap().report;

    assert_eq!(report.failed(), 3);
    for t in &report.tasks {
        assert_eq!(t.state.error().unwrap().kind(), ErrorKind::Crash);
        assert!(!t.task.output.exists());
    }

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn first_failure_cancels_unstarted_tasks() {
    let dir = temp_dir("pool_fail_fast");
    let bad = dir.join("bad.png");
    std::fs::write(&bad, b"nope").unwrap();
    let mut inputs = vec![bad.clone()];
    inputs.extend(pngs(&dir, 3));

    let opts = BatchOptions {
        concurrency: Some(1),
        ..BatchOptions::default()
    };
    let err = run_batch(&inputs, &ImageCodec::png_to_jpeg(), &opts).unwrap_err();
    let failure = err.failure().unwrap();
    let report = &failure.report;

    assert_eq!(report.failed(), 1);
    assert_eq!(report.cancelled(), 3);
    assert_eq!(
        report.cancel_reason(),
        Some(&CancelReason::TaskFailed { input: bad })
    );
    for t in &report.tasks[1..] {
        assert!(matches!(t.state, TaskState::Cancelled(_)));
        assert!(!t.task.output.exists());
    }
    assert!(failure.to_string().contains("3 cancelled"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn keep_going_reports_every_failure_and_the_first_seen() {
    let dir = temp_dir("pool_keep_going");
    let good = pngs(&dir, 1);
    let bad1 = dir.join("bad1.png");
    let bad2 = dir.join("bad2.png");
    std::fs::write(&bad1, b"x").unwrap();
    std::fs::write(&bad2, b"y").unwrap();
    let inputs = vec![good[0].clone(), bad1.clone(), bad2];

    let opts = BatchOptions {
        concurrency: Some(1),
        fail_fast: false,
        ..BatchOptions::default()
    };
    let err = run_batch(&inputs, &ImageCodec::png_to_jpeg(), &opts).unwrap_err();
    let failure = err.failure().unwrap();

    assert_eq!(failure.report.succeeded(), 1);
    assert_eq!(failure.report.failures().count(), 2);
    assert_eq!(failure.first_error().unwrap().0.input, bad1);
    assert!(failure.report.cancel_reason().is_none());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn elapsed_deadline_skips_everything() {
    let dir = temp_dir("pool_deadline");
    let inputs = pngs(&dir, 4);

    let opts = BatchOptions {
        concurrency: Some(2),
        deadline: Some(Duration::ZERO),
        ..BatchOptions::default()
    };
    let err = run_batch(&inputs, &ImageCodec::png_to_jpeg(), &opts).unwrap_err();
    let failure = err.failure().unwrap();

    assert_eq!(failure.report.cancelled(), 4);
    assert_eq!(
        failure.report.cancel_reason(),
        Some(&CancelReason::DeadlineElapsed)
    );
    assert!(failure.first_error().is_none());
    for p in &inputs {
        assert!(!p.with_extension("jpg").exists());
    }

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn failed_cleanup_is_combined_with_its_cause() {
    let dir = temp_dir("pool_cleanup");
    let inputs = pngs(&dir, 1);
    let codec = VanishingCodec {
        output: inputs[0].with_extension("jpg"),
    };

    let err = run_batch(&inputs, &codec, &BatchOptions::default()).unwrap_err();
    let (_, error) = err.failure().unwrap().first_error().unwrap();

    assert_eq!(error.kind(), ErrorKind::Cleanup);
    assert_eq!(error.primary().kind(), ErrorKind::Encode);
    let msg = error.to_string();
    assert!(msg.contains("device went away"));
    assert!(msg.contains("failed to remove"));
    assert!(!codec.output.exists());

    std::fs::remove_dir_all(&dir).ok();
}

#[cfg(unix)]
#[test]
fn failed_flush_is_reported_and_output_removed() {
    let full = Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let dir = temp_dir("pool_flush");
    let inputs = pngs(&dir, 1);
    let output = inputs[0].with_extension("jpg");
    std::os::unix::fs::symlink(full, &output).unwrap();

    let err = run_batch(&inputs, &BufferedCodec, &BatchOptions::default()).unwrap_err();
    let (_, error) = err.failure().unwrap().first_error().unwrap();

    assert_eq!(error.kind(), ErrorKind::Flush);
    assert!(error.to_string().starts_with("flush '"));
    assert!(std::fs::symlink_metadata(&output).is_err());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn colliding_outputs_are_written_once() {
    let dir = temp_dir("pool_collide");
    let png = pngs(&dir, 1).remove(0);
    let bare = png.with_extension("");
    std::fs::copy(&png, &bare).unwrap();
    let inputs = vec![png.clone(), bare.clone(), png.clone()];

    let opts = BatchOptions {
        concurrency: Some(3),
        fail_fast: false,
        ..BatchOptions::default()
    };
    let err = run_batch(&inputs, &ImageCodec::png_to_jpeg(), &opts).unwrap_err();
    let report = &err.failure().unwrap().report;

    assert_eq!(report.succeeded(), 1);
    assert!(report.tasks[0].state.is_success());
    for t in &report.tasks[1..] {
        let e = t.state.error().unwrap();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(e.to_string().contains("already produced by"));
    }
    assert!(png.with_extension("jpg").exists());

    std::fs::remove_dir_all(&dir).ok();
}
