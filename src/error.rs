//! Error types for the framelatch library.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Numeric status codes reported to collaborators.
///
/// Every [`Error`] maps onto exactly one of these through [`Error::status`].
/// Codes arriving from drivers can be decoded with `Status::try_from(code)`.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Error = 1,
    NotImplemented = 2,
    NotSupported = 3,
    BadParameter = 4,
    OutOfFlow = 5,
    NoDevice = 6,
    TimeOut = 102,
}

/// The main error type for frame pool, holder and wait operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument was rejected.
    ///
    /// Also used for one-sided allocator overrides and for reads routed to a
    /// holder that does not know the stream.
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// The request exceeds what this implementation supports, e.g. waiting on
    /// more than [`crate::MAX_WAITED_STREAMS`] streams or syncing streams that
    /// belong to different drivers.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// No stream became ready within the wait budget.
    #[error("Timed out after {timeout_ms} ms waiting for {streams} stream(s)")]
    TimedOut {
        /// The budget that elapsed, in milliseconds.
        timeout_ms: u64,
        /// Number of non-empty stream entries that were waited on.
        streams: usize,
    },

    /// The operation is invalid in the stream's current running/stopped state.
    #[error("Operation invalid in current state: {0}")]
    OutOfFlow(String),

    /// A frame handle refers to a pool slot that has since been reclaimed.
    #[error("Stale frame handle (slot {index}, generation {generation})")]
    StaleFrame {
        /// Slot index inside the pool arena.
        index: u32,
        /// Generation the handle was issued with.
        generation: u32,
    },

    /// A blocking wait was aborted because its owner is shutting down.
    #[error("Wait aborted: {0} is shutting down")]
    ShutDown(String),

    /// Generic failure, including reads from a disabled holder.
    #[error("Operation failed: {0}")]
    Failed(String),
}

impl Error {
    /// Returns the status code reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::BadParameter(_) | Error::StaleFrame { .. } => Status::BadParameter,
            Error::NotSupported(_) => Status::NotSupported,
            Error::TimedOut { .. } => Status::TimeOut,
            Error::OutOfFlow(_) => Status::OutOfFlow,
            Error::ShutDown(_) | Error::Failed(_) => Status::Error,
        }
    }

    /// True for errors a caller may recover from by simply re-issuing the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
    }
}

impl From<&Error> for Status {
    fn from(error: &Error) -> Self {
        error.status()
    }
}

impl<T> From<&crate::Result<T>> for Status {
    fn from(result: &crate::Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_through_i32() {
        assert_eq!(i32::from(Status::TimeOut), 102);
        assert_eq!(Status::try_from(5), Ok(Status::OutOfFlow));
        assert!(Status::try_from(7).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            Error::StaleFrame {
                index: 0,
                generation: 3
            }
            .status(),
            Status::BadParameter
        );
        assert_eq!(
            Error::TimedOut {
                timeout_ms: 10,
                streams: 1
            }
            .status(),
            Status::TimeOut
        );
        assert_eq!(Error::ShutDown("context".into()).status(), Status::Error);
        assert_eq!(Error::NotSupported("x".into()).status(), Status::NotSupported);
    }

    #[test]
    fn test_result_status() {
        let ok: crate::Result<()> = Ok(());
        let err: crate::Result<()> = Err(Error::OutOfFlow("started".into()));
        assert_eq!(Status::from(&ok), Status::Ok);
        assert_eq!(Status::from(&err), Status::OutOfFlow);
    }

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(Error::TimedOut {
            timeout_ms: 1,
            streams: 1
        }
        .is_retryable());
        assert!(!Error::Failed("x".into()).is_retryable());
    }
}
