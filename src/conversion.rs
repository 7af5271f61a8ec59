//! Conversion operations and the registry that dispatches to them
//!
//! A conversion operation turns one source file into one or more output files.
//! Operations are stateless: everything job specific (target format, password,
//! flags) is read from the calling thread's [`crate::context`]. The registry
//! maps `(source format, target format)` pairs to operations.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::context::{self, ContextError};

/// Error types raised by conversion operations
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("No conversion from {from} to {to}")]
    Unsupported { from: String, to: String },

    #[error("Password required to read {0}")]
    PasswordRequired(PathBuf),

    #[error("Corrupt or unreadable source {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Conversion failed: {0}")]
    Failed(String),
}

/// Result type for conversion operations
pub type ConversionResult<T> = Result<T, ConversionError>;

/// A single source-format-to-target-format transformation.
pub trait ConversionOperation: Send + Sync {
    /// Convert `source`, writing every produced file into `out_dir`.
    fn convert(&self, source: &Path, out_dir: &Path) -> ConversionResult<Vec<PathBuf>>;

    /// Convert several sources into a merged result. Operations that cannot
    /// merge fall back to converting each source on its own.
    fn convert_union(&self, sources: &[PathBuf], out_dir: &Path) -> ConversionResult<Vec<PathBuf>> {
        let mut outputs = Vec::new();
        for source in sources {
            outputs.extend(self.convert(source, out_dir)?);
        }
        Ok(outputs)
    }
}

impl<F> ConversionOperation for F
where
    F: Fn(&Path, &Path) -> ConversionResult<Vec<PathBuf>> + Send + Sync,
{
    fn convert(&self, source: &Path, out_dir: &Path) -> ConversionResult<Vec<PathBuf>> {
        self(source, out_dir)
    }
}

/// Format aliases folded onto one canonical name
const ALIASES: &[(&str, &str)] = &[
    ("jpeg", "jpg"),
    ("htm", "html"),
    ("tif", "tiff"),
    ("yml", "yaml"),
    ("text", "txt"),
];

/// Normalize a format or extension: lowercase, no leading dot, aliases folded.
pub fn normalize_format(format: &str) -> String {
    let lowered = format.trim().trim_start_matches('.').to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lowered)
}

/// The normalized extension of `path`, if it has one.
pub fn format_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(normalize_format)
        .filter(|ext| !ext.is_empty())
}

/// Copies the source under the target extension. Only meaningful between
/// spellings of the same format.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyConversion;

impl ConversionOperation for CopyConversion {
    fn convert(&self, source: &Path, out_dir: &Path) -> ConversionResult<Vec<PathBuf>> {
        let target = context::destination_format()?;
        let stem = source
            .file_stem()
            .ok_or_else(|| ConversionError::Corrupt {
                path: source.to_path_buf(),
                reason: "file has no name".to_string(),
            })?;

        let output = out_dir.join(format!("{}.{}", stem.to_string_lossy(), normalize_format(&target)));
        fs::copy(source, &output)?;
        debug!(source = %source.display(), output = %output.display(), "Copied source");
        Ok(vec![output])
    }
}

/// Tagged-dispatch table of conversion operations
#[derive(Default, Clone)]
pub struct ConverterRegistry {
    operations: HashMap<(String, String), Arc<dyn ConversionOperation>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the format-agnostic operations: same-format copies
    /// for every extension that has an alias spelling.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let copy: Arc<dyn ConversionOperation> = Arc::new(CopyConversion);
        for (_, canonical) in ALIASES {
            registry.register_shared(canonical, canonical, copy.clone());
        }
        registry
    }

    pub fn register<O>(&mut self, source: &str, target: &str, operation: O) -> &mut Self
    where
        O: ConversionOperation + 'static,
    {
        self.register_shared(source, target, Arc::new(operation))
    }

    pub fn register_shared(
        &mut self,
        source: &str,
        target: &str,
        operation: Arc<dyn ConversionOperation>,
    ) -> &mut Self {
        let key = (normalize_format(source), normalize_format(target));
        debug!(source = %key.0, target = %key.1, "Registered conversion");
        self.operations.insert(key, operation);
        self
    }

    pub fn lookup(&self, source: &str, target: &str) -> ConversionResult<Arc<dyn ConversionOperation>> {
        let key = (normalize_format(source), normalize_format(target));
        self.operations
            .get(&key)
            .cloned()
            .ok_or(ConversionError::Unsupported {
                from: key.0,
                to: key.1,
            })
    }

    pub fn supports(&self, source: &str, target: &str) -> bool {
        self.lookup(source, target).is_ok()
    }

    /// Every target format reachable from `source`, sorted.
    pub fn possible_conversions(&self, source: &str) -> Vec<String> {
        let source = normalize_format(source);
        self.operations
            .keys()
            .filter(|(from, _)| *from == source)
            .map(|(_, to)| to.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
