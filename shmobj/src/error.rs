//! Error type shared by the whole subsystem.

/// Error type for shared-memory object operations.
///
/// `AlreadyExists` is deliberately absent: losing the named-object creation
/// race is a success-shaped outcome reported through
/// [`RegisterOutcome`](crate::manager::RegisterOutcome), never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    /// A shared-memory allocation failed.
    OutOfMemory,
    /// A relocatable pointer that must resolve did not; the segment is
    /// considered corrupted.
    Internal(&'static str),
    /// Malformed object name (empty, or longer than `MAX_OBJECT_NAME`).
    InvalidName,
    /// Name lookup miss.
    NotFound,
    /// Object exists but its type is not in the allowed set.
    TypeMismatch,
    /// Stale, never-issued, or insufficient-rights handle.
    InvalidHandle,
    /// Wait/signal operation on a type without synchronization support.
    NotWaitable,
    /// Declared but unimplemented operation (foreign-handle referencing).
    NotImplemented,
}

impl core::fmt::Display for ShmError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ShmError::OutOfMemory => write!(f, "Out of shared memory"),
            ShmError::Internal(what) => write!(f, "Shared memory corrupted: {}", what),
            ShmError::InvalidName => write!(f, "Invalid object name"),
            ShmError::NotFound => write!(f, "Object not found"),
            ShmError::TypeMismatch => write!(f, "Object type not allowed"),
            ShmError::InvalidHandle => write!(f, "Invalid handle"),
            ShmError::NotWaitable => write!(f, "Object is not waitable"),
            ShmError::NotImplemented => write!(f, "Not implemented"),
        }
    }
}

pub type ShmResult<T> = Result<T, ShmError>;
