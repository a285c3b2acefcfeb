use std::{
    fs::File,
    io::{BufWriter, Read as _, Write as _},
    path::{Path, PathBuf},
};

use image::DynamicImage;

use crate::{
    batch::cancel::CancelToken,
    codec::Codec,
    convert::output::{PartialOutput, output_path_for},
    foundation::error::{ConvertError, ConvertResult},
};

/// One input file and the output it converts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    /// Position of the input within its batch.
    pub index: usize,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl Task {
    pub fn new(index: usize, input: impl Into<PathBuf>, target_extension: &str) -> Self {
        let input = input.into();
        let output = output_path_for(&input, target_extension);
        Self {
            index,
            input,
            output,
        }
    }
}

/// Convert a single file, leaving either a complete output or none at all.
///
/// Steps:
/// 1. Bail out with [`ConvertError::Cancelled`] if `cancel` has tripped; nothing is touched.
/// 2. Read and decode the source. No output exists yet, so failures here need no cleanup.
/// 3. Create the output, encode into it, flush and `fsync`.
///
/// Any failure in step 3 closes the output handle and removes the file. If the removal fails too,
/// the returned error is [`ConvertError::Cleanup`] wrapping the primary cause.
#[tracing::instrument(name = "convert", skip_all, fields(path = %task.input.display()))]
pub fn convert(task: &Task, codec: &dyn Codec, cancel: &CancelToken) -> ConvertResult<()> {
    if let Some(reason) = cancel.check() {
        tracing::debug!(%reason, "skipped");
        return Err(ConvertError::Cancelled { reason });
    }

    let image = {
        let bytes = read_source(&task.input)?;
        codec
            .decode(&bytes)
            .map_err(|e| ConvertError::decode(&task.input, e))?
    };

    if task.output == task.input {
        return Err(ConvertError::SameAsSource {
            path: task.output.clone(),
        });
    }

    let (partial, file) =
        PartialOutput::create(&task.output).map_err(|e| ConvertError::create(&task.output, e))?;

    match write_output(codec, &image, file, &task.output) {
        Ok(()) => {
            let out = partial.commit();
            tracing::debug!(output = %out.display(), "converted");
            Ok(())
        }
        Err(err) => match partial.discard() {
            Ok(()) => Err(err),
            Err(rm) => Err(err.with_cleanup_failure(&task.output, rm)),
        },
    }
}

fn read_source(path: &Path) -> ConvertResult<Vec<u8>> {
    let mut src = File::open(path).map_err(|e| ConvertError::open(path, e))?;
    let mut bytes = Vec::new();
    src.read_to_end(&mut bytes)
        .map_err(|e| ConvertError::read(path, e))?;
    Ok(bytes)
}

/// Encode into `file` and make it durable. The handle is closed when this returns.
fn write_output(
    codec: &dyn Codec,
    image: &DynamicImage,
    file: File,
    path: &Path,
) -> ConvertResult<()> {
    let mut writer = BufWriter::new(file);
    codec
        .encode(image, &mut writer)
        .map_err(|e| ConvertError::encode(path, e))?;
    writer.flush().map_err(|e| ConvertError::flush(path, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| ConvertError::flush(path, e))?;
    Ok(())
}
