use thiserror::Error;

use crate::platform::PlatformError;

/// Errors surfaced by the reconciliation engine.
///
/// A missing directive is not an error; removal operations report it as `false`.
#[derive(Error, Debug)]
pub enum ReconcileError {
    // The cache is not rolled back when a write fails.
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("platform call failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("scheduler is not running")]
    SchedulerStopped,
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
