//! Error types for the tree manager.

use crate::ids::PathIndex;

/// Errors that can occur while dispatching, recording, or replaying.
///
/// Most variants here are never returned to a caller: address drift and
/// liveness-before mismatches are recoverable and are folded into "record a
/// new child" before `TreeManager::run` ever returns. Only the fatal and
/// backend-passthrough variants escape.
#[derive(Debug, thiserror::Error)]
pub enum TreeError<E: std::error::Error + 'static> {
    /// A `cudagraph_managed` input's address no longer matches the address
    /// recorded at capture time. Recoverable: downgraded to "no match".
    #[error("static input address drift at index {index}")]
    StaticInputDrift { index: usize },

    /// An `expected_dead_before` position is still live. Recoverable:
    /// downgraded to "no match".
    #[error("liveness mismatch before replay at {0}")]
    LivenessMismatchBefore(PathIndex),

    /// An `expected_dead_after` position is still live once cudagraph-managed
    /// inputs have been dropped. Fatal: proceeding would silently overwrite
    /// a buffer the caller still holds a live reference to.
    #[error(
        "liveness violation after drop at {positions:?}: a replay would overwrite live memory; \
         this is a fatal tree-manager inconsistency, please file an issue"
    )]
    LivenessViolationAfterDrop { positions: Vec<PathIndex> },

    /// The model callable panicked or returned an arity mismatch against its
    /// declared static input indices.
    #[error("model invocation error: {0}")]
    ModelError(String),

    /// Passthrough for errors surfaced by the capture/allocator backend.
    #[error("backend error: {0}")]
    Backend(#[from] E),
}
