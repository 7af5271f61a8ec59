//! File converter
//! Watches a folder tree and converts every new file on a pool of workers,
//! each job carrying its own conversion context

pub mod archive;
pub mod cli;
pub mod config;
pub mod context;
pub mod conversion;
pub mod dispatch;
pub mod engine;
pub mod logger;
pub mod postprocess;
pub mod scratch;
pub mod watcher;

// Re-export commonly used types for convenience
pub use config::{AppConfig, ConfigError, ConfigResult, Logging, SubmitPolicy, DEFAULT_CONFIG_FILE};

pub use context::{
    ContextError, ContextKey, ContextResult, ContextScope, ContextTemplate, ConversionContext,
};

pub use conversion::{
    ConversionError, ConversionOperation, ConversionResult, ConverterRegistry, CopyConversion,
};

pub use dispatch::{
    ConversionJob, DispatchError, DispatchPool, DispatchResult, JobReport, JobStatus, PoolSettings,
    PoolShutdown, PoolStatus,
};

pub use engine::{ConversionEngine, ConversionLauncher, EngineError, EngineResult};

pub use postprocess::{OutputPostProcessor, PostProcessError};

pub use watcher::{
    DirectoryWatcher, WatchError, WatchKey, WatchOutcome, WatchRegistration, WatchResult,
    WatchSummary, WatcherHandle,
};
