//! Zip archive helpers used to wrap converted output and to unpack archive sources.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::{FileOptions, SimpleFileOptions};
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::conversion::format_of;

/// Extensions treated as already archived; such outputs are never zipped again.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "7z", "rar", "tar", "gz", "tgz", "bz2", "xz"];

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Zip error on {path}: {source}")]
    Zip { path: PathBuf, source: ZipError },

    #[error("Archive {0} is encrypted and no password was supplied")]
    PasswordRequired(PathBuf),

    #[error("Wrong password for {0}")]
    InvalidPassword(PathBuf),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }

    fn zip(path: &Path, source: ZipError) -> Self {
        match source {
            ZipError::InvalidPassword => Self::InvalidPassword(path.to_path_buf()),
            ZipError::Io(source) => Self::io(path, source),
            source => Self::Zip { path: path.to_path_buf(), source },
        }
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

pub fn is_archive(path: &Path) -> bool {
    format_of(path).is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

/// Write `source` as the single entry of a new zip at `archive_path`.
///
/// With a password the entry is AES-256 encrypted, otherwise it is plainly
/// deflated. The source file is left in place.
pub fn zip_file(source: &Path, archive_path: &Path, password: Option<&str>) -> ArchiveResult<()> {
    zip_files(std::slice::from_ref(&source.to_path_buf()), archive_path, password)
}

/// Write every file of `sources` as a top-level entry of a new zip at
/// `archive_path`. Sources are left in place. A file name already used by an
/// earlier entry is stored as `<stem>-<n>.<ext>`.
pub fn zip_files(sources: &[PathBuf], archive_path: &Path, password: Option<&str>) -> ArchiveResult<()> {
    let output = File::create(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;
    let mut writer = ZipWriter::new(BufWriter::new(output));
    let mut used = HashSet::new();

    for source in sources {
        let entry_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                ArchiveError::io(
                    source,
                    io::Error::new(io::ErrorKind::InvalidInput, "source has no UTF-8 file name"),
                )
            })?;
        let entry_name = free_entry_name(entry_name, &mut used);

        let size = fs::metadata(source).map_err(|e| ArchiveError::io(source, e))?.len();
        let plain = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= u32::MAX as u64);
        let options: FileOptions<'_, ()> = match password {
            Some(password) => plain.with_aes_encryption(AesMode::Aes256, password),
            None => plain,
        };

        writer
            .start_file(entry_name.as_str(), options)
            .map_err(|e| ArchiveError::zip(archive_path, e))?;
        let mut input = BufReader::new(File::open(source).map_err(|e| ArchiveError::io(source, e))?);
        io::copy(&mut input, &mut writer).map_err(|e| ArchiveError::io(archive_path, e))?;
    }

    let mut inner = writer.finish().map_err(|e| ArchiveError::zip(archive_path, e))?;
    io::Write::flush(&mut inner).map_err(|e| ArchiveError::io(archive_path, e))?;

    debug!(
        archive = %archive_path.display(),
        entries = sources.len(),
        encrypted = password.is_some(),
        "Wrote archive"
    );
    Ok(())
}

fn free_entry_name(name: &str, used: &mut HashSet<String>) -> String {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());

    let mut candidate = name.to_string();
    let mut n = 0u32;
    while used.contains(&candidate) {
        n += 1;
        candidate = match ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
    }
    used.insert(candidate.clone());
    candidate
}

/// Unpack every file of `archive_path` under `dest`, returning the extracted
/// files in archive order. Entries escaping `dest` are skipped.
pub fn extract_zip(archive_path: &Path, dest: &Path, password: Option<&str>) -> ArchiveResult<Vec<PathBuf>> {
    let file = File::open(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::zip(archive_path, e))?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let encrypted = archive
            .by_index_raw(index)
            .map_err(|e| ArchiveError::zip(archive_path, e))?
            .encrypted();

        let mut entry = match (encrypted, password) {
            (true, Some(password)) => archive
                .by_index_decrypt(index, password.as_bytes())
                .map_err(|e| ArchiveError::zip(archive_path, e))?,
            (true, None) => return Err(ArchiveError::PasswordRequired(archive_path.to_path_buf())),
            (false, _) => archive
                .by_index(index)
                .map_err(|e| ArchiveError::zip(archive_path, e))?,
        };

        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!(entry = entry.name(), archive = %archive_path.display(), "Skipping unsafe archive entry");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| ArchiveError::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }

        let mut out = BufWriter::new(File::create(&target).map_err(|e| ArchiveError::io(&target, e))?);
        io::copy(&mut entry, &mut out).map_err(|e| match e.kind() {
            // AES authentication failures surface while reading
            io::ErrorKind::InvalidData if encrypted => ArchiveError::InvalidPassword(archive_path.to_path_buf()),
            _ => ArchiveError::io(&target, e),
        })?;
        io::Write::flush(&mut out).map_err(|e| ArchiveError::io(&target, e))?;
        extracted.push(target);
    }

    Ok(extracted)
}
