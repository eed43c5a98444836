//! The capture/allocator boundary (§6 of the design).
//!
//! `cudagraph-tree` defines this interface; a separate, optionally-compiled
//! crate (`cudagraph-tree-cuda`) provides the real implementation against a
//! GPU driver. This dependency inversion keeps the tree-manager core free of
//! any GPU dependency, mirroring how this codebase's `ethrex-levm` defines
//! `jit::dispatch::JitBackend` while `tokamak-jit` supplies the only
//! consumer-facing implementation.

use crate::ids::{DeviceIndex, PoolId};
use crate::metadata::TensorMetadata;

/// A block reported by the allocator inside one pool segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Allocated,
    Free,
}

/// One contiguous memory segment inside a private pool, as reported by the
/// allocator for debug-mode consistency checks.
#[derive(Debug, Clone)]
pub struct PoolSegment {
    pub address: usize,
    pub blocks: Vec<(usize, BlockState)>,
}

/// A liveness token produced by downgrading a tensor's storage.
///
/// Once a token has observed its storage as dead it must never report it
/// live again — liveness here is monotonic, matching `StorageHandle`'s own
/// contract in §4.1.
pub trait LivenessToken: Clone + Send + Sync + std::fmt::Debug {
    fn is_live(&self) -> bool;
}

/// A tensor view: shape, stride, dtype, device, and a handle onto the
/// storage it's backed by.
pub trait TensorView: Clone {
    type Storage: Clone;

    fn storage(&self) -> Self::Storage;
    fn address(&self) -> usize;
    fn byte_size(&self) -> usize;
    fn shape(&self) -> Vec<usize>;
    fn stride(&self) -> Vec<isize>;
    fn dtype(&self) -> crate::metadata::DtypeId;
    fn device(&self) -> DeviceIndex;
    fn storage_offset(&self) -> usize;

    fn metadata(&self) -> TensorMetadata {
        TensorMetadata {
            byte_size: self.byte_size(),
            address: self.address(),
            shape: self.shape(),
            stride: self.stride(),
            dtype: self.dtype(),
            device: self.device(),
            storage_offset: self.storage_offset(),
        }
    }
}

/// The GPU driver / caching-allocator boundary.
///
/// Every method here corresponds to one row of the external-interfaces table:
/// pool/graph lifecycle, allocator checkpointing, and storage reconstruction.
/// Implementations are expected to be cheap to clone or already `Clone`
/// themselves (a thin handle around a driver context), since the tree manager
/// holds one for its whole lifetime.
pub trait Backend: Send + Sync + Clone + 'static {
    type Tensor: TensorView<Storage = Self::Storage> + Send;
    type Storage: Clone + Send + Sync;
    type Weak: LivenessToken;
    type Graph: Send;
    type AllocatorState: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Downgrade a storage handle to a liveness token.
    fn downgrade(&self, storage: &Self::Storage) -> Self::Weak;

    /// Raw address backing a storage, independent of liveness.
    fn storage_address(&self, storage: &Self::Storage) -> usize;

    /// Allocate a fresh private pool for a device.
    fn new_pool_id(&self, device: DeviceIndex) -> PoolId;

    /// Begin capturing a new graph with allocations routed into `pool`.
    fn capture_begin(&self, device: DeviceIndex, pool: PoolId) -> Result<Self::Graph, Self::Error>;

    /// Finalize a captured graph; no further allocations are recorded into it.
    fn capture_end(&self, device: DeviceIndex, graph: &mut Self::Graph) -> Result<(), Self::Error>;

    /// Asynchronously execute a captured graph's work.
    fn replay(&self, device: DeviceIndex, graph: &Self::Graph) -> Result<(), Self::Error>;

    /// Block the calling thread until all outstanding device work completes.
    fn device_synchronize(&self, device: DeviceIndex) -> Result<(), Self::Error>;

    /// Take an opaque snapshot of the allocator's view of `pool`.
    fn snapshot_allocator(
        &self,
        device: DeviceIndex,
        pool: PoolId,
    ) -> Result<Self::AllocatorState, Self::Error>;

    /// Restore the allocator's view of a pool so that exactly the `live`
    /// addresses are considered allocated; `stale` addresses are reclaimed.
    fn restore_allocator(
        &self,
        device: DeviceIndex,
        pool: PoolId,
        state: &Self::AllocatorState,
        stale: &[usize],
        live: &[usize],
    ) -> Result<(), Self::Error>;

    /// Force-release a single address in the pool.
    fn raw_free(&self, device: DeviceIndex, address: usize) -> Result<(), Self::Error>;

    /// Report every segment currently backing a pool, for debug-mode
    /// consistency checks.
    fn pool_segments(&self, pool: PoolId) -> Vec<PoolSegment>;

    /// Flush external compute-library workspace caches so their allocations
    /// can't be smuggled in outside the pool during capture/warmup.
    fn clear_compute_library_caches(&self);

    /// Rebuild a storage object referencing an existing allocation.
    fn construct_storage_from_address(
        &self,
        address: usize,
        device: DeviceIndex,
        nbytes: usize,
    ) -> Result<Self::Storage, Self::Error>;

    /// Allocate a fresh, pool-owned tensor with the same shape/dtype/device
    /// as `like`, uninitialized. Used to build recording-time input buffers.
    fn allocate_like(
        &self,
        device: DeviceIndex,
        pool: PoolId,
        like: &Self::Tensor,
    ) -> Result<Self::Tensor, Self::Error>;

    /// Rebuild a tensor view over `storage` using previously-captured
    /// metadata.
    fn reconstruct_tensor(&self, storage: &Self::Storage, metadata: &TensorMetadata)
    -> Self::Tensor;

    /// Copy `src` into `dst`, skipping the dimensions listed in
    /// `expanded_dims` (broadcast axes the destination already holds).
    fn copy_into(
        &self,
        dst: &Self::Tensor,
        src: &Self::Tensor,
        expanded_dims: &[usize],
    ) -> Result<(), Self::Error>;
}
