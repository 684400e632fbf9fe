use crate::device::DeviceKind;
use crate::task::Id;
use std::fmt;
use std::sync::Arc;

/// Result alias used across the public API.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A centralized error type for every runtime operation.
///
/// Errors are cheap to clone: a task failure is observed by every waiter of
/// the task and by every group it belongs to.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The API was called from a place where it cannot work.
    #[error("misuse: {0}")]
    Misuse(#[from] Misuse),

    /// The object is not in a state that allows the operation, e.g. adding a
    /// predecessor to a task that was already launched.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The task (or one of the tasks it depends on) was canceled.
    #[error("task was canceled")]
    Canceled,

    /// The device collaborator reported a failure.
    #[error("device failure: {0}")]
    DeviceFailure(#[from] DeviceError),

    /// An arena or slab allocation could not be satisfied.
    #[error("failed to allocate {bytes} bytes")]
    AllocFail { bytes: usize },

    /// The task body returned an error.
    #[error("task {task} failed: {cause}")]
    Failed {
        task: Id,
        cause: Arc<anyhow::Error>,
    },

    /// The task body panicked.
    #[error("task {task} panicked: {message}")]
    Panicked { task: Id, message: String },

    /// Several members of a group failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::Misuse(_))
    }

    /// The id of the task that produced this error, if it came from a body.
    pub fn task_id(&self) -> Option<Id> {
        match self {
            Error::Failed { task, .. } | Error::Panicked { task, .. } => Some(*task),
            _ => None,
        }
    }

    /// Converts a body error into a runtime error. A body that propagated
    /// `Error::Canceled` (e.g. through `abort_on_cancel()?`) is canceled, not
    /// failed.
    pub(crate) fn from_body(task: Id, err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(Error::Canceled) => Error::Canceled,
            Ok(Error::DeviceFailure(e)) => Error::DeviceFailure(e),
            Ok(other) => Error::Failed {
                task,
                cause: Arc::new(other.into()),
            },
            Err(err) => Error::Failed {
                task,
                cause: Arc::new(err),
            },
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    #[error("operation is only valid inside a running task")]
    NotInTask,

    #[error("the runtime is shutting down")]
    RuntimeShutdown,

    #[error("task output was already taken")]
    OutputTaken,

    #[error("task output does not have the requested type")]
    OutputType,

    #[error("bound arguments do not have the type expected by the body")]
    ArgsType,

    #[error("no {0} device is registered on this runtime")]
    NoDevice(DeviceKind),

    #[error("chunk size must be greater than 0")]
    ZeroChunk,

    #[error("input and output lengths differ: {input} != {output}")]
    LengthMismatch { input: usize, output: usize },
}

/// Failure reported by a device collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{device}: out of device memory ({bytes} bytes requested)")]
    OutOfMemory { device: String, bytes: usize },

    #[error("{device}: unknown kernel `{entry}`")]
    UnknownKernel { device: String, entry: String },

    #[error("{device}: invalid memory handle {handle}")]
    InvalidMemory { device: String, handle: u64 },

    #[error("{device}: kernel `{entry}` failed: {reason}")]
    KernelFailed {
        device: String,
        entry: String,
        reason: String,
    },

    #[error("{device}: transfer of {bytes} bytes failed")]
    Transfer { device: String, bytes: usize },
}

/// All the errors collected by a group while its members ran.
#[derive(Debug, Clone, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub(crate) fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }

    pub fn into_inner(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.errors.len())?;
        if let Some(first) = self.errors.first() {
            write!(f, ", first: {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl IntoIterator for AggregateError {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a AggregateError {
    type Item = &'a Error;
    type IntoIter = std::slice::Iter<'a, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, Clone, std::error::Error);

    #[test]
    fn test_body_cancel_is_not_a_failure() {
        let id = Id::next();
        let err = Error::from_body(id, Error::Canceled.into());
        assert!(err.is_canceled());
        assert_eq!(err.task_id(), None);
    }

    #[test]
    fn test_body_error_keeps_task_id() {
        let id = Id::next();
        let err = Error::from_body(id, anyhow!("boom"));
        assert_eq!(err.task_id(), Some(id));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_aggregate_display() {
        let agg = AggregateError::new(vec![Error::Canceled, Error::AllocFail { bytes: 8 }]);
        assert_eq!(agg.len(), 2);
        assert!(agg.to_string().starts_with("2 task(s) failed"));
        assert_eq!(agg.iter().filter(|e| e.is_canceled()).count(), 1);
    }
}
