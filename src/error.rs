//! Error types for the thread and event layers.
//!
//! Error handling in this crate follows a few rules:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Timer-wheel operations on stale handles are not errors; they are
//!   defined no-ops observable through `Option` returns
//! - Transient syscall interruptions are retried at the call site and never
//!   surface here

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Thread identity ===
    /// Thread id is outside the `[0, 255]` range.
    ThreadIdOutOfRange,
    /// Thread id is already registered in the thread table.
    ThreadIdInUse,
    /// No thread is registered under the given id.
    ThreadNotFound,

    // === Lifecycle ===
    /// The thread was already started.
    AlreadyStarted,
    /// The thread has not been started yet.
    NotStarted,
    /// A suspend request is already pending or active.
    SuspendPending,

    // === OS ===
    /// Spawning the OS thread failed.
    Spawn,
    /// An I/O operation on a kernel handle failed.
    Io,

    // === Internal ===
    /// Internal invariant violation (bug).
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::ThreadIdOutOfRange => "thread id out of range",
            Self::ThreadIdInUse => "thread id already in use",
            Self::ThreadNotFound => "thread not found",
            Self::AlreadyStarted => "thread already started",
            Self::NotStarted => "thread not started",
            Self::SuspendPending => "suspend request already pending",
            Self::Spawn => "failed to spawn os thread",
            Self::Io => "i/o error",
            Self::Internal => "internal error",
        }
    }
}

/// The main error type for thread and event-loop operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Attaches human-readable context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Shorthand for an [`ErrorKind::Io`] error wrapping a `std::io::Error`.
    #[must_use]
    pub fn io(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
