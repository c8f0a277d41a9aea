use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the task store (C1).
///
/// `AlreadyExists` is the only variant callers are expected to match on; everything
/// else is an opaque store failure (connection loss, constraint violation, etc.)
/// that the caller propagates.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("task {0} already exists")]
    AlreadyExists(Uuid),

    #[error("task store error: {0}")]
    Db(#[from] sqlx::Error),
}
