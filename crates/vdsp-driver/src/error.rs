// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for vdsp driver operations

use thiserror::Error;
use vdsp_chip::FormatError;

/// Result type alias for vdsp operations
pub type Result<T> = std::result::Result<T, VdspError>;

/// Errors that can occur during vdsp operations
#[derive(Debug, Error)]
pub enum VdspError {
    /// IOVA space, buffer ids, record slots or namespaces ran out
    #[error("Out of {resource}")]
    ResourceExhausted {
        /// Resource that ran out
        resource: String,
    },

    /// Accelerator answered the handshake or a request in an unexpected way
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for failure
        reason: String,
    },

    /// Firmware image missing, malformed or not loadable
    #[error("Firmware error: {reason}")]
    Firmware {
        /// Reason for failure
        reason: String,
    },

    /// Binary format rejected by a parser
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Accelerator did not answer in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Accelerator is off after a failed boot or recovery
    #[error("Device unavailable")]
    DeviceUnavailable,

    /// Unmap of a buffer that has no device mapping
    #[error("Buffer {buffer} is not device mapped")]
    NotMapped {
        /// Buffer id
        buffer: u32,
    },

    /// Free of a buffer that is still device mapped
    #[error("Buffer {buffer} is still device mapped")]
    StillMapped {
        /// Buffer id
        buffer: u32,
    },

    /// Buffer id not present in the namespace
    #[error("Unknown buffer {buffer}")]
    UnknownBuffer {
        /// Buffer id
        buffer: u32,
    },

    /// Heap id not registered
    #[error("Unknown heap {heap}")]
    UnknownHeap {
        /// Heap id
        heap: u32,
    },

    /// Accelerator could not route a request to its namespace
    #[error("Namespace \"{nsid}\" not known to the accelerator")]
    UnknownNamespace {
        /// Namespace id as text
        nsid: String,
    },

    /// Library operation not allowed in the library's current state
    #[error("Library \"{name}\": {reason}")]
    LibraryState {
        /// Library name
        name: String,
        /// Reason for failure
        reason: String,
    },

    /// Caller passed a bad argument
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// System call failed
    #[error("System error: {0}")]
    Os(#[from] rustix::io::Errno),
}

impl VdspError {
    /// Create a resource exhausted error
    pub fn exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a firmware error
    pub fn firmware(reason: impl Into<String>) -> Self {
        Self::Firmware {
            reason: reason.into(),
        }
    }

    /// Create a library state error
    pub fn library_state(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LibraryState {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }
}
