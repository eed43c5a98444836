//! An in-memory fake [`Backend`] used by this crate's own tests (and
//! available to downstream crates under the `test-utils` feature).
//!
//! Graph capture, replay, and data copies are genuine external collaborators
//! per §1/§6 of the design — this crate's job is the tree manager sitting on
//! top of them, so the fake backend leaves them inert. What it *does* track
//! faithfully is address identity and liveness: a [`FakeStorage`] is a plain
//! `Arc`, `is_live()` reflects real Rust refcounting (via `Weak::upgrade`),
//! so a test can make an output go dead just by dropping it, exactly as a
//! real tensor's weakref would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;

use crate::backend::{Backend, BlockState, LivenessToken, PoolSegment, TensorView};
use crate::ids::{DeviceIndex, PoolId};
use crate::metadata::{DtypeId, TensorMetadata};

#[derive(Debug, thiserror::Error)]
pub enum FakeBackendError {
    #[error("unknown address {0}")]
    UnknownAddress(usize),
}

struct StorageInner {
    address: usize,
    device: DeviceIndex,
    nbytes: usize,
}

#[derive(Clone)]
pub struct FakeStorage(Arc<StorageInner>);

#[derive(Clone, Debug)]
pub struct FakeWeak(Weak<StorageInner>);

impl LivenessToken for FakeWeak {
    fn is_live(&self) -> bool {
        self.0.upgrade().is_some()
    }
}

impl std::fmt::Debug for FakeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeStorage").field("address", &self.0.address).finish()
    }
}

#[derive(Clone, Debug)]
pub struct FakeTensor {
    storage: FakeStorage,
    shape: Vec<usize>,
    stride: Vec<isize>,
    dtype: DtypeId,
    storage_offset: usize,
}

impl TensorView for FakeTensor {
    type Storage = FakeStorage;

    fn storage(&self) -> FakeStorage {
        self.storage.clone()
    }

    fn address(&self) -> usize {
        self.storage.0.address
    }

    fn byte_size(&self) -> usize {
        self.storage.0.nbytes
    }

    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn stride(&self) -> Vec<isize> {
        self.stride.clone()
    }

    fn dtype(&self) -> DtypeId {
        self.dtype
    }

    fn device(&self) -> DeviceIndex {
        self.storage.0.device
    }

    fn storage_offset(&self) -> usize {
        self.storage_offset
    }
}

#[derive(Debug, Clone)]
pub struct FakeGraph {
    pub pool: PoolId,
}

#[derive(Debug, Clone)]
pub struct FakeAllocatorState {
    pub live_at_snapshot: Vec<usize>,
}

/// Plain (non-owning) metadata kept so addresses can be reconstructed
/// without the backend's own bookkeeping artificially keeping every
/// storage alive forever.
#[derive(Default)]
struct FakeState {
    metadata: FxHashMap<usize, (DeviceIndex, usize)>,
}

/// Cheaply cloneable handle (an `Arc` inside), as every `Backend` impl is
/// expected to be (§6 boundary table / backend.rs doc comment).
#[derive(Clone)]
pub struct FakeBackend {
    next_address: Arc<AtomicUsize>,
    next_pool: Arc<AtomicUsize>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            next_address: Arc::new(AtomicUsize::new(0x1000)),
            next_pool: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Allocate a brand-new, always-16-byte-aligned scalar tensor, not tied
    /// to any particular pool — stands in for a user-supplied example input
    /// or plain non-pool tensor (e.g. a model parameter) in tests.
    pub fn fresh_tensor(&self, device: DeviceIndex) -> FakeTensor {
        self.tensor_with_shape(device, vec![1], vec![1])
    }

    pub fn tensor_with_shape(&self, device: DeviceIndex, shape: Vec<usize>, stride: Vec<isize>) -> FakeTensor {
        let address = self.next_address.fetch_add(16, Ordering::Relaxed);
        let nbytes = shape.iter().product::<usize>().max(1) * 8;
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        self.state.lock().unwrap().metadata.insert(address, (device, nbytes));
        FakeTensor {
            storage: FakeStorage(Arc::new(StorageInner { address, device, nbytes })),
            shape,
            stride,
            dtype: 0,
            storage_offset: 0,
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for FakeBackend {
    type Tensor = FakeTensor;
    type Storage = FakeStorage;
    type Weak = FakeWeak;
    type Graph = FakeGraph;
    type AllocatorState = FakeAllocatorState;
    type Error = FakeBackendError;

    fn downgrade(&self, storage: &FakeStorage) -> FakeWeak {
        FakeWeak(Arc::downgrade(&storage.0))
    }

    fn storage_address(&self, storage: &FakeStorage) -> usize {
        storage.0.address
    }

    fn new_pool_id(&self, _device: DeviceIndex) -> PoolId {
        PoolId(self.next_pool.fetch_add(1, Ordering::Relaxed) as u64)
    }

    fn capture_begin(&self, _device: DeviceIndex, pool: PoolId) -> Result<FakeGraph, FakeBackendError> {
        Ok(FakeGraph { pool })
    }

    fn capture_end(&self, _device: DeviceIndex, _graph: &mut FakeGraph) -> Result<(), FakeBackendError> {
        Ok(())
    }

    fn replay(&self, _device: DeviceIndex, _graph: &FakeGraph) -> Result<(), FakeBackendError> {
        Ok(())
    }

    fn device_synchronize(&self, _device: DeviceIndex) -> Result<(), FakeBackendError> {
        Ok(())
    }

    fn snapshot_allocator(&self, _device: DeviceIndex, _pool: PoolId) -> Result<FakeAllocatorState, FakeBackendError> {
        // Our fake allocator state carries nothing address-specific to
        // restore from (liveness is real Rust refcounting); kept as an
        // opaque marker purely so the node has something to hold.
        Ok(FakeAllocatorState { live_at_snapshot: Vec::new() })
    }

    fn restore_allocator(
        &self,
        _device: DeviceIndex,
        _pool: PoolId,
        _state: &FakeAllocatorState,
        _stale: &[usize],
        _live: &[usize],
    ) -> Result<(), FakeBackendError> {
        Ok(())
    }

    fn raw_free(&self, _device: DeviceIndex, address: usize) -> Result<(), FakeBackendError> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        self.state.lock().unwrap().metadata.remove(&address);
        Ok(())
    }

    fn pool_segments(&self, _pool: PoolId) -> Vec<PoolSegment> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let state = self.state.lock().unwrap();
        state
            .metadata
            .iter()
            .map(|(&address, &(_device, nbytes))| PoolSegment {
                address,
                blocks: vec![(nbytes, BlockState::Allocated)],
            })
            .collect()
    }

    fn clear_compute_library_caches(&self) {}

    fn construct_storage_from_address(&self, address: usize, device: DeviceIndex, nbytes: usize) -> Result<FakeStorage, FakeBackendError> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        self.state.lock().unwrap().metadata.entry(address).or_insert((device, nbytes));
        Ok(FakeStorage(Arc::new(StorageInner { address, device, nbytes })))
    }

    fn allocate_like(&self, device: DeviceIndex, _pool: PoolId, like: &FakeTensor) -> Result<FakeTensor, FakeBackendError> {
        Ok(self.tensor_with_shape(device, like.shape(), like.stride()))
    }

    fn reconstruct_tensor(&self, storage: &FakeStorage, metadata: &TensorMetadata) -> FakeTensor {
        FakeTensor {
            storage: storage.clone(),
            shape: metadata.shape.clone(),
            stride: metadata.stride.clone(),
            dtype: metadata.dtype,
            storage_offset: metadata.storage_offset,
        }
    }

    fn copy_into(&self, _dst: &FakeTensor, _src: &FakeTensor, _expanded_dims: &[usize]) -> Result<(), FakeBackendError> {
        Ok(())
    }
}
