//! Error type for the CUDA backend.

/// Errors surfaced by the CUDA driver while acting as a `cudagraph_tree::Backend`.
#[derive(Debug, thiserror::Error)]
pub enum CudaBackendError {
    /// A CUDA driver call failed.
    #[error("CUDA driver error: {0}")]
    Driver(String),

    /// An address passed to `construct_storage_from_address` is not one this
    /// backend has ever handed out — the caller is asking us to reconstruct
    /// a view onto memory we never allocated.
    #[error("unknown device address {0:#x}")]
    UnknownAddress(usize),

    /// A pool's memory pool handle could not be resolved for the requested
    /// device.
    #[error("no memory pool registered for device {0}")]
    UnknownPool(usize),
}
