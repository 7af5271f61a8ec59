//! Conversion engine
//!
//! This module provides functionality for:
//! 1. Resolving the conversion operation for a job from the registry
//! 2. Unpacking zip sources and converting every entry, or all of them at once
//!    when `union` is set
//! 3. Post-processing outputs (zip, password protection, canonical names)
//! 4. Moving the final artifacts into the output directory
//!
//! Every job works inside its own scratch directory, which is removed whether
//! the job succeeds or not.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::archive::{self, ArchiveError};
use crate::config::AppConfig;
use crate::context::{self, ContextError, ContextScope, ConversionContext};
use crate::conversion::{format_of, normalize_format, ConversionError, ConverterRegistry};
use crate::dispatch::ConversionJob;
use crate::postprocess::{OutputPostProcessor, PostProcessError};
use crate::scratch::ScratchDir;

/// Error types for a conversion job
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Post-processing error: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Conversion of {0} produced no output")]
    NoOutput(PathBuf),

    #[error("Failed to move {path} into the output directory: {source}")]
    FileMove { path: PathBuf, source: io::Error },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Runs one conversion job on the calling thread. The job's context is
/// already installed when `launch` is called.
pub trait ConversionLauncher: Send + Sync {
    fn launch(&self, job: &ConversionJob) -> EngineResult<Vec<PathBuf>>;
}

/// The default launcher: registry lookup, conversion, post-processing and
/// delivery into `output_dir`.
pub struct ConversionEngine {
    registry: Arc<ConverterRegistry>,
    output_dir: PathBuf,
    temp_dir: PathBuf,
    post_processor: OutputPostProcessor,
}

impl ConversionEngine {
    pub fn new(registry: Arc<ConverterRegistry>, output_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            output_dir: output_dir.into(),
            temp_dir: temp_dir.into(),
            post_processor: OutputPostProcessor::new(),
        }
    }

    pub fn from_config(registry: Arc<ConverterRegistry>, config: &AppConfig) -> Self {
        Self::new(registry, &config.output_dir, &config.temp_dir)
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Convert `source` on the calling thread with an explicit context.
    pub fn convert_file(&self, source: &Path, ctx: ConversionContext) -> EngineResult<Vec<PathBuf>> {
        let job = ConversionJob::new(source, ctx);
        let _scope = ContextScope::enter(job.context.clone());
        self.launch(&job)
    }

    fn convert_archive(
        &self,
        source: &Path,
        target: &str,
        ctx: &ConversionContext,
        scratch: &ScratchDir,
    ) -> EngineResult<Vec<PathBuf>> {
        let unpacked = scratch.subdir("unpacked")?;
        let out_dir = scratch.subdir("out")?;
        let entries = archive::extract_zip(source, &unpacked, ctx.password())?;
        debug!(archive = %source.display(), entries = entries.len(), "Unpacked archive source");

        // Entries grouped by their own format, in a stable order
        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in entries {
            match format_of(&entry) {
                Some(format) => groups.entry(format).or_default().push(entry),
                None => warn!(entry = %entry.display(), "Skipping archive entry without extension"),
            }
        }

        let mut outputs = Vec::new();
        for (format, files) in groups {
            let operation = match self.registry.lookup(&format, target) {
                Ok(operation) => operation,
                Err(e) => {
                    warn!(format = %format, target = %target, files = files.len(), error = %e, "Skipping archive entries");
                    continue;
                }
            };
            if ctx.is_union() {
                outputs.extend(operation.convert_union(&files, &out_dir)?);
            } else {
                for file in &files {
                    // Mirror the entry's folder so same-named entries stay apart
                    let entry_dir = match file.strip_prefix(&unpacked).ok().and_then(Path::parent) {
                        Some(relative) if !relative.as_os_str().is_empty() => {
                            let dir = out_dir.join(relative);
                            fs::create_dir_all(&dir)?;
                            dir
                        }
                        _ => out_dir.clone(),
                    };
                    outputs.extend(operation.convert(file, &entry_dir)?);
                }
            }
        }
        Ok(outputs)
    }

    fn deliver(&self, outputs: Vec<PathBuf>) -> EngineResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir)?;
        let mut delivered = Vec::with_capacity(outputs.len());
        for output in outputs {
            let Some(name) = output.file_name() else {
                return Err(EngineError::NoOutput(output));
            };
            let target = claim_target(&self.output_dir.join(name)).map_err(|source| EngineError::FileMove {
                path: output.clone(),
                source,
            })?;
            if let Err(source) = move_file(&output, &target) {
                let _ = fs::remove_file(&target);
                return Err(EngineError::FileMove { path: output, source });
            }
            delivered.push(target);
        }
        Ok(delivered)
    }
}

impl ConversionLauncher for ConversionEngine {
    #[instrument(skip(self, job), fields(source = %job.source.display()))]
    fn launch(&self, job: &ConversionJob) -> EngineResult<Vec<PathBuf>> {
        let ctx = context::current()?;
        let source = job.source.as_path();
        if !source.is_file() {
            return Err(EngineError::SourceMissing(source.to_path_buf()));
        }

        let target = normalize_format(ctx.destination_format()?);
        let from = format_of(source).ok_or_else(|| ConversionError::Unsupported {
            from: "(none)".to_string(),
            to: target.clone(),
        })?;

        let scratch = ScratchDir::new(&self.temp_dir, "job")?;
        let outputs = if from == "zip" && target != "zip" {
            self.convert_archive(source, &target, &ctx, &scratch)?
        } else {
            let operation = self.registry.lookup(&from, &target)?;
            operation.convert(source, &scratch.subdir("out")?)?
        };

        if outputs.is_empty() {
            return Err(EngineError::NoOutput(source.to_path_buf()));
        }

        let finalized = self.post_processor.finalize_all(&outputs, source, &ctx)?;
        let delivered = self.deliver(finalized)?;
        info!(
            from = %from,
            to = %target,
            outputs = delivered.len(),
            "Converted {}", source.display()
        );
        Ok(delivered)
    }
}

/// Reserve `path`, or `<stem>-<n>.<ext>` for the first `n` that is free, by
/// creating it exclusively. The returned file is an empty placeholder that
/// the caller moves the real output over.
fn claim_target(path: &Path) -> io::Result<PathBuf> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 0u32;
    loop {
        let candidate = match (n, &ext) {
            (0, _) => path.to_path_buf(),
            (n, Some(ext)) => path.with_file_name(format!("{}-{}.{}", stem, n, ext)),
            (n, None) => path.with_file_name(format!("{}-{}", stem, n)),
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Rename over `to`, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{ConversionOperation, ConversionResult};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _root: TempDir,
        input: PathBuf,
        output: PathBuf,
        temp: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempdir().unwrap();
        let input = root.path().join("in");
        fs::create_dir_all(&input).unwrap();
        Fixture {
            input,
            output: root.path().join("out"),
            temp: root.path().join("tmp"),
            _root: root,
        }
    }

    fn engine(fx: &Fixture, registry: ConverterRegistry) -> ConversionEngine {
        ConversionEngine::new(Arc::new(registry), &fx.output, &fx.temp)
    }

    fn ctx(format: &str) -> ConversionContext {
        ConversionContext {
            destination_format: Some(format.to_string()),
            ..ConversionContext::default()
        }
    }

    fn scratch_is_clean(fx: &Fixture) -> bool {
        fs::read_dir(&fx.temp).map(|mut dir| dir.next().is_none()).unwrap_or(true)
    }

    /// Writes the uppercased contents of every source into one `merged.txt`
    struct Merge;

    impl ConversionOperation for Merge {
        fn convert(&self, source: &Path, out_dir: &Path) -> ConversionResult<Vec<PathBuf>> {
            self.convert_union(&[source.to_path_buf()], out_dir)
        }

        fn convert_union(&self, sources: &[PathBuf], out_dir: &Path) -> ConversionResult<Vec<PathBuf>> {
            let mut merged = String::new();
            for source in sources {
                merged.push_str(&fs::read_to_string(source)?.to_uppercase());
            }
            let output = out_dir.join("merged.txt");
            fs::write(&output, merged)?;
            Ok(vec![output])
        }
    }

    #[test]
    fn test_direct_conversion_lands_in_output_dir() {
        let fx = fixture();
        let source = fx.input.join("photo.jpeg");
        fs::write(&source, b"jpeg bytes").unwrap();

        let outputs = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, ctx("jpg"))
            .unwrap();

        assert_eq!(outputs, vec![fx.output.join("photo.jpg")]);
        assert_eq!(fs::read(&outputs[0]).unwrap(), b"jpeg bytes");
        assert!(source.exists());
        assert!(scratch_is_clean(&fx));
    }

    #[test]
    fn test_existing_output_is_not_overwritten() {
        let fx = fixture();
        fs::create_dir_all(&fx.output).unwrap();
        fs::write(fx.output.join("notes.txt"), b"older").unwrap();
        let source = fx.input.join("notes.text");
        fs::write(&source, b"newer").unwrap();

        let outputs = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, ctx("txt"))
            .unwrap();

        assert_eq!(outputs, vec![fx.output.join("notes-1.txt")]);
        assert_eq!(fs::read(fx.output.join("notes.txt")).unwrap(), b"older");
    }

    #[test]
    fn test_zip_source_entries_converted() {
        let fx = fixture();
        let a = fx.input.join("a.txt");
        let b = fx.input.join("b.txt");
        fs::write(&a, b"first").unwrap();
        fs::write(&b, b"second").unwrap();
        let source = fx.input.join("batch.zip");
        archive::zip_files(&[a, b], &source, None).unwrap();

        let mut outputs = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, ctx("txt"))
            .unwrap();
        outputs.sort();

        assert_eq!(outputs, vec![fx.output.join("a.txt"), fx.output.join("b.txt")]);
        assert_eq!(fs::read(&outputs[1]).unwrap(), b"second");
        assert!(scratch_is_clean(&fx));
    }

    #[test]
    fn test_same_named_entries_in_different_folders_both_delivered() {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let fx = fixture();
        let source = fx.input.join("reports.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&source).unwrap());
        for (name, body) in [("jan/report.txt", "january"), ("feb/report.txt", "february")] {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();

        let outputs = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, ctx("txt"))
            .unwrap();

        assert_eq!(outputs.len(), 2);
        let mut names: Vec<_> = outputs.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        names.sort();
        assert_eq!(names, vec!["report-1.txt", "report.txt"]);
        let mut bodies: Vec<_> = outputs.iter().map(|p| fs::read_to_string(p).unwrap()).collect();
        bodies.sort();
        assert_eq!(bodies, vec!["february", "january"]);
        assert!(scratch_is_clean(&fx));
    }

    #[test]
    fn test_zipped_output_keeps_same_named_entries() {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let fx = fixture();
        let source = fx.input.join("reports.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&source).unwrap());
        for (name, body) in [("jan/report.txt", "january"), ("feb/report.txt", "february")] {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        let zipped = ConversionContext {
            zipped_output: true,
            ..ctx("txt")
        };

        let outputs = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, zipped)
            .unwrap();
        assert_eq!(outputs.len(), 1);

        let check = fx.input.join("check");
        let files = archive::extract_zip(&outputs[0], &check, None).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_concurrent_deliveries_never_share_a_name() {
        const JOBS: usize = 8;
        let fx = fixture();
        let engine = Arc::new(engine(&fx, ConverterRegistry::with_defaults()));
        let barrier = Arc::new(std::sync::Barrier::new(JOBS));

        let handles: Vec<_> = (0..JOBS)
            .map(|i| {
                let dir = fx.input.join(i.to_string());
                fs::create_dir_all(&dir).unwrap();
                let source = dir.join("notes.text");
                fs::write(&source, i.to_string()).unwrap();
                let engine = engine.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.convert_file(&source, ctx("txt")).unwrap()
                })
            })
            .collect();

        let mut delivered: Vec<PathBuf> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), JOBS);
        assert_eq!(fs::read_dir(&fx.output).unwrap().count(), JOBS);

        let mut bodies: Vec<_> = delivered.iter().map(|p| fs::read_to_string(p).unwrap()).collect();
        bodies.sort();
        let mut expected: Vec<_> = (0..JOBS).map(|i| i.to_string()).collect();
        expected.sort();
        assert_eq!(bodies, expected);
    }

    #[test]
    fn test_union_merges_archive_entries() {
        let fx = fixture();
        let a = fx.input.join("1.txt");
        let b = fx.input.join("2.txt");
        fs::write(&a, "ab").unwrap();
        fs::write(&b, "cd").unwrap();
        let source = fx.input.join("bundle.zip");
        archive::zip_files(&[a, b], &source, Some("pw")).unwrap();

        let mut registry = ConverterRegistry::new();
        registry.register("txt", "md", Merge);
        let union_ctx = ConversionContext {
            union: true,
            password: Some("pw".to_string()),
            ..ctx("md")
        };

        let outputs = engine(&fx, registry).convert_file(&source, union_ctx).unwrap();
        assert_eq!(outputs, vec![fx.output.join("bundle.txt")]);
        assert_eq!(fs::read_to_string(&outputs[0]).unwrap(), "ABCD");
    }

    #[test]
    fn test_zipped_output() {
        let fx = fixture();
        let source = fx.input.join("data.yml");
        fs::write(&source, b"key: value").unwrap();
        let zipped = ConversionContext {
            zipped_output: true,
            ..ctx("yaml")
        };

        let outputs = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, zipped)
            .unwrap();
        assert_eq!(outputs, vec![fx.output.join("data.zip")]);

        let check = fx.input.join("check");
        let files = archive::extract_zip(&outputs[0], &check, None).unwrap();
        assert_eq!(files, vec![check.join("data.yaml")]);
    }

    #[test]
    fn test_unsupported_conversion_fails_and_cleans_up() {
        let fx = fixture();
        let source = fx.input.join("sheet.csv");
        fs::write(&source, b"a,b").unwrap();

        let err = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, ctx("pdf"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Conversion(ConversionError::Unsupported { .. })));
        assert!(scratch_is_clean(&fx));
        assert!(!fx.output.exists());
    }

    #[test]
    fn test_missing_destination_format_fails() {
        let fx = fixture();
        let source = fx.input.join("sheet.csv");
        fs::write(&source, b"a,b").unwrap();

        let err = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&source, ConversionContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Context(ContextError::MissingConfig("destinationFormat"))));
    }

    #[test]
    fn test_missing_source() {
        let fx = fixture();
        let err = engine(&fx, ConverterRegistry::with_defaults())
            .convert_file(&fx.input.join("gone.txt"), ctx("txt"))
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceMissing(_)));
    }

    #[test]
    fn test_failing_operation_leaves_no_scratch() {
        let fx = fixture();
        let source = fx.input.join("broken.txt");
        fs::write(&source, b"??").unwrap();

        fn corrupt(source: &Path, _out: &Path) -> ConversionResult<Vec<PathBuf>> {
            Err(ConversionError::Corrupt {
                path: source.to_path_buf(),
                reason: "bad header".to_string(),
            })
        }
        let mut registry = ConverterRegistry::new();
        registry.register("txt", "pdf", corrupt);

        let err = engine(&fx, registry).convert_file(&source, ctx("pdf")).unwrap_err();
        assert!(matches!(err, EngineError::Conversion(ConversionError::Corrupt { .. })));
        assert!(scratch_is_clean(&fx));
    }
}
