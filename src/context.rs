//! Conversion context propagation
//!
//! A conversion context carries the per-job parameters (target format,
//! password, union/zip/protected flags, watermark) to every converter in a
//! chain without threading them through each call. Every thread holds its own
//! copy: it is materialized from the template bound to the thread on first
//! access, or installed explicitly for the duration of one job with
//! [`ContextScope`]. Nothing is shared between threads.

use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error types for context access
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Missing configuration value: {0}")]
    MissingConfig(&'static str),

    #[error("Unknown context key: {0}")]
    UnknownKey(String),

    #[error("Context key `{key}` expects a {expected} value")]
    TypeMismatch { key: ContextKey, expected: &'static str },

    #[error("No context template bound to thread {0}")]
    Unbound(String),

    #[error("Context of thread {0} is already borrowed by an enclosing access")]
    Reentrant(String),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;

/// Keys recognized by the context, named as in the configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    DestinationFormat,
    Password,
    Union,
    ZippedOutput,
    Protected,
    Watermark,
}

impl ContextKey {
    pub const ALL: [ContextKey; 6] = [
        ContextKey::DestinationFormat,
        ContextKey::Password,
        ContextKey::Union,
        ContextKey::ZippedOutput,
        ContextKey::Protected,
        ContextKey::Watermark,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKey::DestinationFormat => "destinationFormat",
            ContextKey::Password => "password",
            ContextKey::Union => "union",
            ContextKey::ZippedOutput => "zippedOutput",
            ContextKey::Protected => "protected",
            ContextKey::Watermark => "watermark",
        }
    }

    fn is_flag(&self) -> bool {
        matches!(
            self,
            ContextKey::Union | ContextKey::ZippedOutput | ContextKey::Protected
        )
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKey {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ContextError::UnknownKey(s.to_string()))
    }
}

/// Per-job conversion parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub union: bool,
    pub zipped_output: bool,
    #[serde(rename = "protected")]
    pub protected_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
}

impl ConversionContext {
    /// Read a value by key. Unset optional values read as `None`.
    pub fn get(&self, key: ContextKey) -> Option<Value> {
        match key {
            ContextKey::DestinationFormat => self.destination_format.clone().map(Value::String),
            ContextKey::Password => self.password.clone().map(Value::String),
            ContextKey::Union => Some(Value::Bool(self.union)),
            ContextKey::ZippedOutput => Some(Value::Bool(self.zipped_output)),
            ContextKey::Protected => Some(Value::Bool(self.protected_output)),
            ContextKey::Watermark => self.watermark.clone().map(Value::String),
        }
    }

    /// Write a value by key. `null` clears optional values.
    pub fn set(&mut self, key: ContextKey, value: Value) -> ContextResult<()> {
        if key.is_flag() {
            let flag = value.as_bool().ok_or(ContextError::TypeMismatch {
                key,
                expected: "boolean",
            })?;
            match key {
                ContextKey::Union => self.union = flag,
                ContextKey::ZippedOutput => self.zipped_output = flag,
                _ => self.protected_output = flag,
            }
            return Ok(());
        }

        let text = match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            _ => {
                return Err(ContextError::TypeMismatch {
                    key,
                    expected: "string",
                })
            }
        };
        match key {
            ContextKey::DestinationFormat => self.destination_format = text,
            ContextKey::Password => self.password = text,
            _ => self.watermark = text,
        }
        Ok(())
    }

    /// The target format. There is no fallback: a context without one is a
    /// configuration error.
    pub fn destination_format(&self) -> ContextResult<&str> {
        self.destination_format
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .ok_or(ContextError::MissingConfig("destinationFormat"))
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn is_union(&self) -> bool {
        self.union
    }

    pub fn is_zipped_output(&self) -> bool {
        self.zipped_output
    }

    pub fn is_protected(&self) -> bool {
        self.protected_output
    }

    pub fn watermark(&self) -> Option<&str> {
        self.watermark.as_deref().filter(|w| !w.is_empty())
    }
}

/// Immutable base context shared by every worker thread.
#[derive(Debug, Clone, Default)]
pub struct ContextTemplate {
    base: ConversionContext,
}

impl ContextTemplate {
    pub fn new(base: ConversionContext) -> Self {
        Self { base }
    }

    /// A fresh copy for one thread or one job.
    pub fn materialize(&self) -> ConversionContext {
        self.base.clone()
    }

    pub fn base(&self) -> &ConversionContext {
        &self.base
    }
}

#[derive(Default)]
struct ThreadSlot {
    template: Option<Arc<ContextTemplate>>,
    current: Option<ConversionContext>,
}

thread_local! {
    static SLOT: RefCell<ThreadSlot> = RefCell::new(ThreadSlot::default());
}

fn thread_label() -> String {
    let thread = std::thread::current();
    thread
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", thread.id()))
}

/// Bind the template the current thread materializes its context from.
pub fn bind_template(template: Arc<ContextTemplate>) {
    SLOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.template = Some(template);
        slot.current = None;
    });
}

/// Run `f` against the calling thread's context, materializing it first if needed.
///
/// The context stays borrowed while `f` runs: any context access from inside
/// `f` (including the free accessors of this module) fails with
/// [`ContextError::Reentrant`]. Read what you need through the `&mut` argument.
pub fn with<R>(f: impl FnOnce(&mut ConversionContext) -> R) -> ContextResult<R> {
    SLOT.with(|slot| {
        let mut slot = slot
            .try_borrow_mut()
            .map_err(|_| ContextError::Reentrant(thread_label()))?;
        let slot = &mut *slot;
        if slot.current.is_none() {
            let template = slot
                .template
                .as_ref()
                .ok_or_else(|| ContextError::Unbound(thread_label()))?;
            slot.current = Some(template.materialize());
        }
        match slot.current.as_mut() {
            Some(ctx) => Ok(f(ctx)),
            None => Err(ContextError::Unbound(thread_label())),
        }
    })
}

/// Snapshot of the calling thread's context.
pub fn current() -> ContextResult<ConversionContext> {
    with(|ctx| ctx.clone())
}

pub fn get(key: ContextKey) -> ContextResult<Option<Value>> {
    with(|ctx| ctx.get(key))
}

pub fn set(key: ContextKey, value: Value) -> ContextResult<()> {
    with(|ctx| ctx.set(key, value))?
}

pub fn destination_format() -> ContextResult<String> {
    with(|ctx| ctx.destination_format().map(str::to_string))?
}

pub fn password() -> ContextResult<Option<String>> {
    with(|ctx| ctx.password().map(str::to_string))
}

pub fn is_union() -> ContextResult<bool> {
    with(|ctx| ctx.is_union())
}

pub fn is_zipped_output() -> ContextResult<bool> {
    with(|ctx| ctx.is_zipped_output())
}

pub fn is_protected() -> ContextResult<bool> {
    with(|ctx| ctx.is_protected())
}

pub fn watermark() -> ContextResult<Option<String>> {
    with(|ctx| ctx.watermark().map(str::to_string))
}

/// Drop the calling thread's context. The next access starts again from the
/// bound template.
pub fn clear() {
    SLOT.with(|slot| slot.borrow_mut().current = None);
}

/// Installs a job's context on the current thread and clears it on drop,
/// including when the job panics.
#[must_use = "the context is cleared as soon as the scope is dropped"]
pub struct ContextScope {
    _private: (),
}

impl ContextScope {
    pub fn enter(ctx: ConversionContext) -> Self {
        SLOT.with(|slot| slot.borrow_mut().current = Some(ctx));
        Self { _private: () }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        clear();
    }
}
