//! A tree-structured cache of recorded GPU execution graphs, backed by a
//! private memory pool shared across every recording in the tree.
//!
//! Records a compiled function's GPU work once as an immutable captured
//! graph bound to specific device addresses, replays it cheaply on matching
//! invocations, and arranges recordings into a tree so that a function
//! recorded after another inherits the memory state left live by its
//! predecessor.
//!
//! The capture/replay/allocator-checkpoint primitives themselves are an
//! external collaborator — see [`backend::Backend`] — deliberately kept out
//! of this crate so it carries no GPU dependency of its own. A real
//! implementation lives in the separate `cudagraph-tree-cuda` crate.
//!
//! # Entry point
//!
//! [`install`] takes a model callable plus example inputs and returns a
//! [`WrappedCallable`] the caller can invoke repeatedly; the first call
//! warms the function up, the second records it, and every call after that
//! replays the captured graph as long as its addresses still match.

pub mod arena;
pub mod backend;
pub mod callable;
mod capture;
pub mod config;
pub mod container;
pub mod error;
pub mod function;
pub mod ids;
pub mod manager;
pub mod metadata;
pub mod node;
pub mod storage;
pub mod warmup;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::sync::Arc;

use rustc_hash::FxHashSet;

pub use backend::Backend;
pub use callable::{OutputGuard, WrappedCallable};
pub use config::TreeConfig;
pub use container::ManagerContainer;
pub use error::TreeError;
pub use function::Model;
pub use ids::{DeviceIndex, FunctionId, GraphId, NodeId, PathIndex, PoolId};
pub use manager::{bump_generation, current_generation, PathState, TreeManager, TreeMetrics};

/// `install(model, example_inputs, static_input_indices) -> callable`
/// (§6 User surface). Builds a fresh per-device [`ManagerContainer`], lazily
/// creating its [`TreeManager`] on first call, and returns a
/// [`WrappedCallable`] bound to a stable [`FunctionId`].
///
/// Most hosts managing several installed functions on one device will want
/// to build one [`ManagerContainer`] up front (e.g. one per device index)
/// and call [`ManagerContainer::install`] on it directly instead — this
/// free function is the single-function convenience path.
pub fn install<B: Backend>(
    backend: B,
    device: DeviceIndex,
    config: TreeConfig,
    model: Model<B>,
    example_inputs: &[Option<B::Tensor>],
    static_input_indices: FxHashSet<usize>,
) -> Result<WrappedCallable<B>, TreeError<B::Error>> {
    let container: Arc<ManagerContainer<B>> = ManagerContainer::new(backend, device, config);
    container.install(model, example_inputs, static_input_indices)
}
