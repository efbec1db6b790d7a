use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the underlying storage backend implementation.
///
/// This enum helps callers understand what went wrong and how to respond,
/// without needing to inspect error messages or know backend-specific details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The requested path was not found.
    ///
    /// **Retryable:** No - the object doesn't exist.
    /// **Caller action:** Handle as a missing object. This is an expected outcome.
    NotFound,

    /// A read was requested at an offset beyond the end of the object.
    ///
    /// **Retryable:** No.
    /// **Caller action:** Request a smaller offset.
    InvalidOffset,

    /// A connection to the backend could not be established (transport or auth setup).
    ///
    /// **Retryable:** Yes - with backoff.
    /// **Caller action:** Check the endpoint, credentials and host key policy.
    Connect,

    /// A session could not be negotiated on an otherwise live connection.
    ///
    /// **Retryable:** Yes - a fresh connection is used once the broken one is evicted.
    Session,

    /// The operation was requested in a state where it cannot run
    /// (a closed stream, a shut down pool, an unimplemented operation).
    ///
    /// **Retryable:** No.
    Precondition,

    /// The path is not a valid logical path.
    ///
    /// **Retryable:** No - fix the path.
    InvalidPath,

    /// The caller lacks permission to perform the requested operation.
    ///
    /// **Retryable:** No - unless credentials are updated.
    PermissionDenied,

    /// The operation failed due to I/O errors (network, remote disk, etc.).
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    Io,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// Note: This is advisory only.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::Connect | StorageErrorKind::Session | StorageErrorKind::Io
        )
    }

    /// Returns whether this error indicates a client-side fault (bad request, invalid params).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidOffset
                | StorageErrorKind::InvalidPath
                | StorageErrorKind::PermissionDenied
                | StorageErrorKind::Precondition
        )
    }

    /// Returns whether this error indicates a backend-side fault.
    pub fn is_server_fault(&self) -> bool {
        matches!(self, StorageErrorKind::Connect | StorageErrorKind::Session)
    }
}

impl From<io::ErrorKind> for StorageErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::InvalidOffset => write!(f, "invalid offset"),
            StorageErrorKind::Connect => write!(f, "connect error"),
            StorageErrorKind::Session => write!(f, "session error"),
            StorageErrorKind::Precondition => write!(f, "precondition failed"),
            StorageErrorKind::InvalidPath => write!(f, "invalid path"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace for debugging.
    ///
    /// Note: Backtrace capture is controlled by RUST_BACKTRACE environment variable.
    backtrace: Backtrace,

    /// Captured span trace from tracing for async context.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with semantic kind, operation context and diagnostics.
///
/// This error type provides:
/// - **Semantic categorization** via `StorageErrorKind`
/// - **Operation context** (logical path, operation, engine)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Backtrace capture** for debugging
/// - **Spantrace support** via `tracing_error::SpanTrace`
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// fn read_missing() -> Result<(), StorageError> {
///     match std::fs::File::open("missing.txt") {
///         Err(err) => Err(StorageError::builder("local", StorageErrorKind::NotFound, err)
///             .path("/missing.txt")
///             .context("open")
///             .build()),
///         Ok(_) => Ok(()),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,

    /// The name of the storage engine that produced this error.
    engine: &'static str,

    /// The logical path, if applicable.
    path: Option<String>,

    /// The operation or other context.
    context: Option<String>,

    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use `StorageError::builder()`.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a storage error with full context.
    ///
    /// # Example
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// let error = StorageError::builder("sftp", StorageErrorKind::NotFound,
    ///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
    ///     .path("/docker/registry/v2/blobs")
    ///     .context("stat")
    ///     .build();
    /// assert!(error.is_not_found());
    /// ```
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// Wrap an I/O error from operation `context` on logical `path`,
    /// deriving the kind from the I/O error kind.
    pub fn io(engine: &'static str, context: &str, path: &str, error: io::Error) -> Self {
        Self::builder(engine, error.kind().into(), error)
            .path(path)
            .context(context)
            .build()
    }

    /// A precondition error with a plain message.
    pub fn precondition(engine: &'static str, message: &'static str) -> Self {
        Self::new(engine, StorageErrorKind::Precondition, message)
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// This is useful with `.map_err()` for simple error conversion.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("file.txt")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns whether the path was not found.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the logical path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns whether this error indicates a client-side fault.
    pub fn is_client_fault(&self) -> bool {
        self.kind.is_client_fault()
    }

    /// Returns whether this error indicates a server-side fault.
    pub fn is_server_fault(&self) -> bool {
        self.kind.is_server_fault()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing `StorageError` with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the logical path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context, usually the operation name.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
