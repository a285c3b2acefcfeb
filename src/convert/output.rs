use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// Derive the converted file's path by replacing the extension of `input`.
pub fn output_path_for(input: &Path, target_extension: &str) -> PathBuf {
    input.with_extension(target_extension)
}

/// An output file that has been created but not yet committed.
///
/// Until [`PartialOutput::commit`] is called the file is considered partial: [`discard`] removes
/// it and reports the outcome, and dropping the guard (e.g. while unwinding) removes it on a
/// best-effort basis.
///
/// [`discard`]: PartialOutput::discard
#[derive(Debug)]
pub struct PartialOutput {
    path: Option<PathBuf>,
}

impl PartialOutput {
    /// Create or truncate `path`.
    pub fn create(path: &Path) -> std::io::Result<(Self, File)> {
        let file = File::create(path)?;
        Ok((
            Self {
                path: Some(path.to_path_buf()),
            },
            file,
        ))
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Keep the file.
    pub fn commit(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }

    /// Remove the file. The caller must have closed its handle.
    pub fn discard(mut self) -> std::io::Result<()> {
        match self.path.take() {
            Some(path) => std::fs::remove_file(path),
            None => Ok(()),
        }
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
