//! Error taxonomy for the patch pipeline.
//!
//! Expected malformed input is never an error: the normalizer and
//! validator return structured results with reasons. Only collaborator
//! faults (backend chain exhausted, runtime I/O, store I/O) and the
//! undo/budget preconditions surface through `RiffError`.

use thiserror::Error;

use crate::backend::BackendError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, RiffError>;

#[derive(Debug, Error)]
pub enum RiffError {
    /// Every variant in the backend chain failed or timed out.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("patch {patch_id} is not reversible: {reason}")]
    NotReversible { patch_id: i64, reason: String },

    #[error("troubleshoot budget exhausted ({used}/{limit})")]
    BudgetExhausted { used: u32, limit: u32 },

    /// The repair engine produced commands that still fail validation.
    #[error("repair output still invalid: {reasons}")]
    RepairInvalid { reasons: String },

    #[error("song not found: {path}")]
    SongNotFound { path: String },
}
