//! Error types for permission operations
//!
//! Every variant is a precondition violation or an infrastructure failure.
//! Granted, denied and blocked are reported as values, never as errors.

use crate::store::StoreError;
use thiserror::Error;

/// Errors returned synchronously by [`PermissionsManager`](crate::PermissionsManager)
#[derive(Debug, Error)]
pub enum PermissionError {
    /// Requests and result callbacks must run on the thread that built the manager
    #[error("Permission operations must run on the thread that created the manager")]
    WrongThread,

    /// A request is already in flight; requests are rejected, never queued
    #[error("Already requesting permissions ({in_flight}), cannot start another request")]
    ConcurrentRequest { in_flight: String },

    #[error("{0} is already granted and must not be requested again")]
    AlreadyGranted(String),

    #[error("{0} is not declared by the application")]
    UndeclaredPermission(String),

    #[error("No permission groups given")]
    EmptyRequest,

    #[error("Failed to persist request state: {0}")]
    Store(#[from] StoreError),

    /// The manager went away before the OS delivered a result
    #[error("Permission request was abandoned before a result arrived")]
    RequestAbandoned,
}
