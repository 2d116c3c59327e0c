//! Error types for device discovery and allocation.

use std::path::PathBuf;

use thiserror::Error;

/// Return codes of the hardware capability API.
///
/// Only [`LibError::NotSupported`], [`LibError::NotFound`] and
/// [`LibError::InvalidArgument`] are ever tolerated by callers; everything
/// else aborts the operation in progress.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LibError {
    #[error("not supported")]
    NotSupported,

    #[error("not found")]
    NotFound,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("timeout")]
    Timeout,

    #[error("library not initialized")]
    Uninitialized,

    #[error("library not found")]
    LibraryNotFound,

    #[error("unknown error (code {code}): {message}")]
    Unknown { code: u32, message: String },
}

impl LibError {
    /// Returns true for the codes that mean "nothing there" rather than failure.
    pub fn is_tolerated(&self) -> bool {
        matches!(
            self,
            Self::NotSupported | Self::NotFound | Self::InvalidArgument
        )
    }
}

/// Result alias for capability API calls.
pub type LibResult<T> = Result<T, LibError>;

/// Errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum GpuError {
    /// A capability API call failed outside the tolerated set.
    #[error("{context}: {source}")]
    Library {
        context: String,
        #[source]
        source: LibError,
    },

    /// The fallback policy cannot satisfy the requested size.
    #[error("not enough available devices to satisfy allocation: requested {requested}, available {available}")]
    InsufficientDevices { requested: usize, available: usize },

    /// The topology-aware policy found no valid combination.
    #[error("placement failed: {0}")]
    Placement(String),

    /// An id passed to the allocator is not part of the fleet.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Event subscription could not resolve a device id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Reading a present NUMA topology file failed.
    #[error("error reading NUMA node from {path}: {source}")]
    Numa {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A present NUMA topology file held an unparsable value.
    #[error("error parsing NUMA node value {value:?} from {path}")]
    NumaParse { path: PathBuf, value: String },

    /// Reading a partition capability file failed.
    #[error("error resolving device nodes from {path}: {detail}")]
    DeviceNodes { path: PathBuf, detail: String },

    /// The fleet does not fit the configured resource strategy.
    #[error("invalid MIG configuration: {0}")]
    InvalidStrategy(String),

    /// An event wait elapsed without an event. Retryable.
    #[error("timed out waiting for hardware event")]
    Timeout,
}

impl GpuError {
    /// Wrap a capability API error with call-site context.
    pub fn library(context: impl Into<String>, source: LibError) -> Self {
        Self::Library {
            context: context.into(),
            source,
        }
    }

    /// Returns true if this error is a retryable event-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Extension for attaching context to capability API results.
pub trait LibResultExt<T> {
    fn context_lib<F, S>(self, f: F) -> Result<T, GpuError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> LibResultExt<T> for LibResult<T> {
    fn context_lib<F, S>(self, f: F) -> Result<T, GpuError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| GpuError::library(f(), e))
    }
}
