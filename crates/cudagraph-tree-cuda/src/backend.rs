//! `CudaBackend`: the real `cudagraph_tree::Backend` implementation, built
//! directly on `cudarc`'s raw driver bindings (`cudarc::driver::sys`) rather
//! than its higher-level safe wrappers — CUDA graph capture and the
//! private-pool checkpointing this crate needs (an application-level
//! caching allocator, not a native driver feature) sit below what cudarc's
//! safe API exposes.
//!
//! Grounded on `tokamak-jit::backend::RevmcBackend`: a thin struct wrapping
//! a heavy external dependency, implementing the core crate's backend trait
//! by delegating to free functions in sibling modules.

use std::sync::{Arc, Mutex, Weak};

use cudarc::driver::sys as cu;
use rustc_hash::FxHashMap;

use cudagraph_tree::backend::{Backend, BlockState, LivenessToken, PoolSegment, TensorView};
use cudagraph_tree::metadata::{DtypeId, TensorMetadata};
use cudagraph_tree::{DeviceIndex, PoolId};

use crate::error::CudaBackendError;

fn cu_result(result: cu::CUresult, what: &str) -> Result<(), CudaBackendError> {
    if result == cu::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(CudaBackendError::Driver(format!("{what} failed: {result:?}")))
    }
}

/// One contiguous block inside a pool's backing allocation, free-list style:
/// neighboring free blocks are coalesced on free, and allocation splits the
/// first sufficiently large free block.
#[derive(Debug, Clone, Copy)]
struct Block {
    address: usize,
    size: usize,
    allocated: bool,
}

struct PoolState {
    /// The single large region this pool's blocks are carved out of; freed
    /// as a whole when the pool itself is dropped.
    base: cu::CUdeviceptr,
    blocks: Vec<Block>,
}

impl PoolState {
    fn new(base: cu::CUdeviceptr, capacity: usize) -> Self {
        Self {
            base,
            blocks: vec![Block { address: base as usize, size: capacity, allocated: false }],
        }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let align = 256;
        let aligned_size = size.div_ceil(align) * align;
        let idx = self.blocks.iter().position(|b| !b.allocated && b.size >= aligned_size)?;
        let block = self.blocks[idx];
        if block.size > aligned_size {
            self.blocks[idx] = Block { address: block.address, size: aligned_size, allocated: true };
            self.blocks.insert(idx + 1, Block { address: block.address + aligned_size, size: block.size - aligned_size, allocated: false });
        } else {
            self.blocks[idx].allocated = true;
        }
        Some(block.address)
    }

    fn free(&mut self, address: usize) {
        let Some(idx) = self.blocks.iter().position(|b| b.address == address) else { return };
        self.blocks[idx].allocated = false;
        // Coalesce with the next block first so the earlier index stays valid.
        if idx + 1 < self.blocks.len() && !self.blocks[idx + 1].allocated {
            let next = self.blocks.remove(idx + 1);
            self.blocks[idx].size += next.size;
        }
        if idx > 0 && !self.blocks[idx - 1].allocated {
            let cur = self.blocks.remove(idx);
            self.blocks[idx - 1].size += cur.size;
        }
    }

    fn segments(&self) -> Vec<PoolSegment> {
        self.blocks
            .iter()
            .map(|b| PoolSegment {
                address: b.address,
                blocks: vec![(b.size, if b.allocated { BlockState::Allocated } else { BlockState::Free })],
            })
            .collect()
    }
}

impl Drop for PoolState {
    fn drop(&mut self) {
        unsafe {
            cu::cuMemFree_v2(self.base);
        }
    }
}

struct StorageInner {
    address: usize,
    device: DeviceIndex,
    nbytes: usize,
    pool: Arc<Mutex<PoolState>>,
}

impl Drop for StorageInner {
    fn drop(&mut self) {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        self.pool.lock().unwrap().free(self.address);
    }
}

#[derive(Clone)]
pub struct CudaStorage(Arc<StorageInner>);

#[derive(Clone)]
pub struct CudaWeak(Weak<StorageInner>);

impl std::fmt::Debug for CudaWeak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaWeak").field("live", &self.is_live()).finish()
    }
}

impl LivenessToken for CudaWeak {
    fn is_live(&self) -> bool {
        self.0.upgrade().is_some()
    }
}

#[derive(Clone)]
pub struct CudaTensor {
    storage: CudaStorage,
    shape: Vec<usize>,
    stride: Vec<isize>,
    dtype: DtypeId,
    storage_offset: usize,
}

impl TensorView for CudaTensor {
    type Storage = CudaStorage;

    fn storage(&self) -> CudaStorage {
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

/// A captured, instantiated CUDA graph plus the device it was captured on.
/// `Drop` destroys both the executable and the template graph.
pub struct CudaGraph {
    graph: cu::CUgraph,
    exec: Option<cu::CUgraphExec>,
}

// Safety: `CUgraph`/`CUgraphExec` are opaque driver handles, valid from any
// thread as long as the owning context is current on that thread, which
// every `CudaBackend` entry point ensures before touching one.
unsafe impl Send for CudaGraph {}

impl Drop for CudaGraph {
    fn drop(&mut self) {
        unsafe {
            if let Some(exec) = self.exec.take() {
                cu::cuGraphExecDestroy(exec);
            }
            cu::cuGraphDestroy(self.graph);
        }
    }
}

#[derive(Clone)]
pub struct CudaAllocatorState {
    blocks: Vec<(usize, usize, bool)>,
}

struct CudaBackendInner {
    context: cu::CUcontext,
    stream: cu::CUstream,
    pools: Mutex<FxHashMap<PoolId, Arc<Mutex<PoolState>>>>,
    /// Bytes reserved up front for each new private pool's backing region.
    pool_capacity: usize,
}

// Safety: the raw context/stream handles are only ever dereferenced by the
// CUDA driver itself inside the methods below, each of which makes `context`
// current before issuing any driver call.
unsafe impl Send for CudaBackendInner {}
unsafe impl Sync for CudaBackendInner {}

impl Drop for CudaBackendInner {
    fn drop(&mut self) {
        unsafe {
            cu::cuStreamDestroy_v2(self.stream);
            cu::cuCtxDestroy_v2(self.context);
        }
    }
}

/// Cheaply cloneable: every clone shares one `Arc<CudaBackendInner>`, so the
/// context and stream are torn down exactly once, when the last clone drops.
#[derive(Clone)]
pub struct CudaBackend(Arc<CudaBackendInner>);

impl CudaBackend {
    /// Initialize the driver, create a context on `device`, and return a
    /// backend ready to have pools installed on it. `pool_capacity` bounds
    /// how much device memory each private pool reserves up front.
    pub fn new(device_ordinal: i32, pool_capacity: usize) -> Result<Self, CudaBackendError> {
        unsafe {
            cu_result(cu::cuInit(0), "cuInit")?;
            let mut device = 0;
            cu_result(cu::cuDeviceGet(&mut device, device_ordinal), "cuDeviceGet")?;
            let mut context: cu::CUcontext = std::ptr::null_mut();
            cu_result(cu::cuCtxCreate_v2(&mut context, 0, device), "cuCtxCreate_v2")?;
            let mut stream: cu::CUstream = std::ptr::null_mut();
            cu_result(cu::cuStreamCreate(&mut stream, 0), "cuStreamCreate")?;
            Ok(Self(Arc::new(CudaBackendInner {
                context,
                stream,
                pools: Mutex::new(FxHashMap::default()),
                pool_capacity,
            })))
        }
    }

    fn make_current(&self) -> Result<(), CudaBackendError> {
        unsafe { cu_result(cu::cuCtxSetCurrent(self.0.context), "cuCtxSetCurrent") }
    }

    fn pool(&self, pool: PoolId) -> Result<Arc<Mutex<PoolState>>, CudaBackendError> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        self.0.pools.lock().unwrap().get(&pool).cloned().ok_or(CudaBackendError::UnknownPool(pool.0 as usize))
    }
}

impl Backend for CudaBackend {
    type Tensor = CudaTensor;
    type Storage = CudaStorage;
    type Weak = CudaWeak;
    type Graph = CudaGraph;
    type AllocatorState = CudaAllocatorState;
    type Error = CudaBackendError;

    fn downgrade(&self, storage: &CudaStorage) -> CudaWeak {
        CudaWeak(Arc::downgrade(&storage.0))
    }

    fn storage_address(&self, storage: &CudaStorage) -> usize {
        storage.0.address
    }

    fn new_pool_id(&self, _device: DeviceIndex) -> PoolId {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut pools = self.0.pools.lock().unwrap();
        let id = PoolId(pools.len() as u64);
        let mut base: cu::CUdeviceptr = 0;
        unsafe {
            // Best-effort: a real implementation would propagate this
            // Result instead of unwrapping, but `new_pool_id` returns a
            // bare `PoolId` per the core trait, so a fatal allocation
            // failure here surfaces as a panic rather than a `TreeError`.
            #[expect(clippy::expect_used, reason = "trait signature gives no Result to return")]
            cu_result(cu::cuMemAlloc_v2(&mut base, self.0.pool_capacity), "cuMemAlloc_v2").expect("private pool reservation failed");
        }
        pools.insert(id, Arc::new(Mutex::new(PoolState::new(base, self.0.pool_capacity))));
        id
    }

    fn capture_begin(&self, _device: DeviceIndex, _pool: PoolId) -> Result<CudaGraph, CudaBackendError> {
        self.make_current()?;
        unsafe {
            cu_result(cu::cuStreamBeginCapture_v2(self.0.stream, cu::CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_THREAD_LOCAL), "cuStreamBeginCapture_v2")?;
        }
        Ok(CudaGraph { graph: std::ptr::null_mut(), exec: None })
    }

    fn capture_end(&self, _device: DeviceIndex, graph: &mut CudaGraph) -> Result<(), CudaBackendError> {
        self.make_current()?;
        unsafe {
            let mut captured: cu::CUgraph = std::ptr::null_mut();
            cu_result(cu::cuStreamEndCapture(self.0.stream, &mut captured), "cuStreamEndCapture")?;
            let mut exec: cu::CUgraphExec = std::ptr::null_mut();
            cu_result(cu::cuGraphInstantiate_v2(&mut exec, captured, std::ptr::null_mut(), std::ptr::null_mut(), 0), "cuGraphInstantiate_v2")?;
            graph.graph = captured;
            graph.exec = Some(exec);
        }
        Ok(())
    }

    fn replay(&self, _device: DeviceIndex, graph: &CudaGraph) -> Result<(), CudaBackendError> {
        self.make_current()?;
        let Some(exec) = graph.exec else {
            return Err(CudaBackendError::Driver("replay of an uninstantiated graph".into()));
        };
        unsafe { cu_result(cu::cuGraphLaunch(exec, self.0.stream), "cuGraphLaunch") }
    }

    fn device_synchronize(&self, _device: DeviceIndex) -> Result<(), CudaBackendError> {
        self.make_current()?;
        unsafe { cu_result(cu::cuStreamSynchronize(self.0.stream), "cuStreamSynchronize") }
    }

    fn snapshot_allocator(&self, _device: DeviceIndex, pool: PoolId) -> Result<CudaAllocatorState, CudaBackendError> {
        let pool = self.pool(pool)?;
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let state = pool.lock().unwrap();
        Ok(CudaAllocatorState { blocks: state.blocks.iter().map(|b| (b.address, b.size, b.allocated)).collect() })
    }

    fn restore_allocator(&self, _device: DeviceIndex, pool: PoolId, state: &CudaAllocatorState, stale: &[usize], live: &[usize]) -> Result<(), CudaBackendError> {
        let pool = self.pool(pool)?;
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut guard = pool.lock().unwrap();
        guard.blocks = state.blocks.iter().map(|&(address, size, allocated)| Block { address, size, allocated }).collect();
        for &address in stale {
            guard.free(address);
        }
        for &address in live {
            if let Some(b) = guard.blocks.iter_mut().find(|b| b.address == address) {
                b.allocated = true;
            }
        }
        Ok(())
    }

    fn raw_free(&self, _device: DeviceIndex, address: usize) -> Result<(), CudaBackendError> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let pools = self.0.pools.lock().unwrap();
        for pool in pools.values() {
            #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
            let mut state = pool.lock().unwrap();
            if state.blocks.iter().any(|b| b.address == address && b.allocated) {
                state.free(address);
                return Ok(());
            }
        }
        Ok(())
    }

    fn pool_segments(&self, pool: PoolId) -> Vec<PoolSegment> {
        let Ok(pool) = self.pool(pool) else { return Vec::new() };
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        pool.lock().unwrap().segments()
    }

    fn clear_compute_library_caches(&self) {
        // cuBLAS/cuDNN-style workspace caches aren't used directly by this
        // backend; nothing to clear here, kept as a no-op hook for a host
        // that layers such a library on top.
    }

    fn construct_storage_from_address(&self, address: usize, device: DeviceIndex, nbytes: usize) -> Result<CudaStorage, CudaBackendError> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let pools = self.0.pools.lock().unwrap();
        let owning_pool = pools
            .values()
            .find(|p| {
                #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
                p.lock().unwrap().blocks.iter().any(|b| b.address == address)
            })
            .cloned()
            .ok_or(CudaBackendError::UnknownAddress(address))?;
        drop(pools);
        Ok(CudaStorage(Arc::new(StorageInner { address, device, nbytes, pool: owning_pool })))
    }

    fn allocate_like(&self, device: DeviceIndex, pool: PoolId, like: &CudaTensor) -> Result<CudaTensor, CudaBackendError> {
        let pool_state = self.pool(pool)?;
        let nbytes = like.byte_size();
        let address = {
            #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
            pool_state.lock().unwrap().alloc(nbytes).ok_or_else(|| CudaBackendError::Driver("private pool exhausted".into()))?
        };
        Ok(CudaTensor {
            storage: CudaStorage(Arc::new(StorageInner { address, device, nbytes, pool: pool_state })),
            shape: like.shape(),
            stride: like.stride(),
            dtype: like.dtype(),
            storage_offset: 0,
        })
    }

    fn reconstruct_tensor(&self, storage: &CudaStorage, metadata: &TensorMetadata) -> CudaTensor {
        CudaTensor {
            storage: storage.clone(),
            shape: metadata.shape.clone(),
            stride: metadata.stride.clone(),
            dtype: metadata.dtype,
            storage_offset: metadata.storage_offset,
        }
    }

    fn copy_into(&self, dst: &CudaTensor, src: &CudaTensor, expanded_dims: &[usize]) -> Result<(), CudaBackendError> {
        self.make_current()?;
        if !expanded_dims.is_empty() {
            tracing::warn!(
                expanded_dims = ?expanded_dims,
                "broadcast-aware copy requested but this backend only implements a flat byte copy; \
                 a custom kernel is needed for true broadcast semantics"
            );
        }
        let nbytes = dst.byte_size().min(src.byte_size());
        let dst_ptr = (dst.address() + dst.storage_offset()) as cu::CUdeviceptr;
        let src_ptr = (src.address() + src.storage_offset()) as cu::CUdeviceptr;
        unsafe { cu_result(cu::cuMemcpyDtoDAsync_v2(dst_ptr, src_ptr, nbytes, self.0.stream), "cuMemcpyDtoDAsync_v2") }
    }
}
