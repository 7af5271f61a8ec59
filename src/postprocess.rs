//! Output post-processing
//!
//! Applied to what a conversion operation produced, according to the job's
//! context:
//! 1. `zippedOutput` wraps non-archive outputs into `<source stem>.zip`,
//!    AES-encrypted with the context password when `protected` is set
//! 2. otherwise a single output is renamed to the canonical `<source stem>.<ext>`
//!
//! Zipping consumes the uncompressed outputs: the returned paths are the only
//! artifacts left on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::archive::{self, ArchiveError};
use crate::context::{ContextError, ConversionContext};

#[derive(Error, Debug)]
pub enum PostProcessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Could not move or remove {path}: {source}")]
    FileMove { path: PathBuf, source: io::Error },

    #[error("Source {0} has no usable file name")]
    NoBaseName(PathBuf),
}

pub type PostProcessResult<T> = Result<T, PostProcessError>;

#[derive(Debug, Default, Clone, Copy)]
pub struct OutputPostProcessor;

impl OutputPostProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Post-process a single output of a conversion of `source`.
    pub fn finalize(&self, output: &Path, source: &Path, ctx: &ConversionContext) -> PostProcessResult<PathBuf> {
        let mut finalized = self.finalize_all(&[output.to_path_buf()], source, ctx)?;
        finalized
            .pop()
            .ok_or_else(|| PostProcessError::NoBaseName(output.to_path_buf()))
    }

    /// Post-process every output of one conversion of `source`.
    pub fn finalize_all(
        &self,
        outputs: &[PathBuf],
        source: &Path,
        ctx: &ConversionContext,
    ) -> PostProcessResult<Vec<PathBuf>> {
        if outputs.is_empty() {
            return Ok(Vec::new());
        }

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PostProcessError::NoBaseName(source.to_path_buf()))?;

        if ctx.is_zipped_output() {
            return self.zip_outputs(outputs, stem, ctx);
        }

        if let [single] = outputs {
            return Ok(vec![rename_to_stem(single, stem)?]);
        }
        Ok(outputs.to_vec())
    }

    fn zip_outputs(&self, outputs: &[PathBuf], stem: &str, ctx: &ConversionContext) -> PostProcessResult<Vec<PathBuf>> {
        let (mut finalized, loose): (Vec<PathBuf>, Vec<PathBuf>) =
            outputs.iter().cloned().partition(|path| archive::is_archive(path));
        if loose.is_empty() {
            debug!("Outputs already archived, nothing to zip");
            return Ok(finalized);
        }

        let password = if ctx.is_protected() {
            Some(ctx.password().ok_or(ContextError::MissingConfig("password"))?)
        } else {
            None
        };

        let dir = loose[0].parent().unwrap_or_else(|| Path::new("."));
        let archive_path = dir.join(format!("{}.zip", stem));
        archive::zip_files(&loose, &archive_path, password)?;

        for path in &loose {
            fs::remove_file(path).map_err(|source| PostProcessError::FileMove {
                path: path.clone(),
                source,
            })?;
        }

        info!(
            archive = %archive_path.display(),
            entries = loose.len(),
            protected = password.is_some(),
            "Zipped conversion output"
        );
        finalized.push(archive_path);
        Ok(finalized)
    }
}

fn rename_to_stem(output: &Path, stem: &str) -> PostProcessResult<PathBuf> {
    let canonical = match output.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => output.with_file_name(format!("{}.{}", stem, ext)),
        None => output.with_file_name(stem),
    };
    if canonical == output {
        return Ok(canonical);
    }

    fs::rename(output, &canonical).map_err(|source| PostProcessError::FileMove {
        path: output.to_path_buf(),
        source,
    })?;
    debug!(from = %output.display(), to = %canonical.display(), "Renamed output");
    Ok(canonical)
}
