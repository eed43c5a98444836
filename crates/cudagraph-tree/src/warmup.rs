//! `WarmupNode`: a first, uncaptured execution of a function inside the
//! private pool (§4.3). Exercises the function with real allocations before
//! capture so that capture sees the final allocation pattern.
//!
//! Unlike `RecordedNode`, warmup nodes are never inserted into the tree's
//! arena — they are used once and dropped when the path moves on. A warmup's
//! parent may be a `RecordedNode` already in the arena, or another warmup
//! node still in progress; [`WarmupParent`] models both without requiring an
//! arena slot for the latter.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::arena::Arena;
use crate::backend::{Backend, TensorView};
use crate::capture::CaptureGuard;
use crate::error::TreeError;
use crate::function::WrappedFunction;
use crate::ids::{DeviceIndex, FunctionId, NodeId, PoolId};
use crate::storage::StorageHandle;

/// What a `WarmupNode` chains off of.
pub enum WarmupParent<B: Backend> {
    /// An already-recorded node living in the tree's arena.
    Recorded(NodeId),
    /// Another warmup node still in progress (not yet promoted to a
    /// recording, so it has no arena slot of its own).
    Warmup(Box<WarmupNode<B>>),
}

/// A lightweight, single-use node representing an uncaptured warmup pass.
pub struct WarmupNode<B: Backend> {
    pub function_id: FunctionId,
    pub pool_id: PoolId,
    parent: Option<WarmupParent<B>>,
    /// A captured graph with nothing recorded into it, retained purely to
    /// keep the pool alive for the lifetime of this warmup node (§4.3).
    _pool_keepalive: B::Graph,
    outputs_weakrefs: Vec<Option<StorageHandle<B>>>,
    /// Ancestor output handles observed live at warmup time, across the
    /// whole parent chain (recorded ancestors and/or prior warmup nodes).
    live_ancestor_handles: Vec<StorageHandle<B>>,
    has_run: bool,
}

impl<B: Backend> WarmupNode<B> {
    pub fn new(
        backend: &B,
        function_id: FunctionId,
        pool_id: PoolId,
        device: DeviceIndex,
        parent: Option<WarmupParent<B>>,
    ) -> Result<Self, TreeError<B::Error>> {
        let graph = CaptureGuard::begin(backend, device, pool_id)?.finish()?;
        Ok(Self {
            function_id,
            pool_id,
            parent,
            _pool_keepalive: graph,
            outputs_weakrefs: Vec::new(),
            live_ancestor_handles: Vec::new(),
            has_run: false,
        })
    }

    /// Every ancestor output address currently alive, walked across the
    /// whole parent chain (recorded nodes via the arena, warmup nodes via
    /// their own cached handles).
    fn collect_live_ancestor_handles(&self, arena: &Arena<B>) -> Vec<StorageHandle<B>> {
        match &self.parent {
            None => Vec::new(),
            Some(WarmupParent::Recorded(id)) => arena
                .get(*id)
                .path_live_handles(arena)
                .into_iter()
                .map(|(_, handle)| handle.clone())
                .collect(),
            Some(WarmupParent::Warmup(parent)) => parent.live_handles(arena),
        }
    }

    /// This node's own live ancestor handles plus its own live outputs —
    /// what a *child* warmup node should see as "pool-owned" ancestry.
    fn live_handles(&self, arena: &Arena<B>) -> Vec<StorageHandle<B>> {
        let mut handles: Vec<StorageHandle<B>> = self.live_ancestor_handles.iter().filter(|h| h.is_live()).cloned().collect();
        handles.extend(self.outputs_weakrefs.iter().flatten().filter(|h| h.is_live()).cloned());
        handles
    }

    /// Run the model once, uncaptured, inside the pool (§4.3). May only be
    /// called once per node.
    pub fn run(
        &mut self,
        backend: &B,
        arena: &Arena<B>,
        function: &WrappedFunction<B>,
        mut inputs: Vec<Option<B::Tensor>>,
    ) -> Result<Vec<B::Tensor>, TreeError<B::Error>> {
        assert!(!self.has_run, "warmup node for {} already ran once", self.function_id);

        self.live_ancestor_handles = self.collect_live_ancestor_handles(arena);
        let pool_owned_addresses: FxHashSet<usize> = self.live_ancestor_handles.iter().map(StorageHandle::address).collect();
        // Inputs whose storage is NOT already pool-owned (e.g. a declared
        // parameter living outside the pool); an output aliasing one of
        // these is not a new pool allocation and must not be tracked.
        let non_pool_input_addresses: FxHashSet<usize> = inputs
            .iter()
            .flatten()
            .map(TensorView::address)
            .filter(|addr| !pool_owned_addresses.contains(addr))
            .collect();

        let outputs = function.invoke(&mut inputs);
        self.has_run = true;
        self.outputs_weakrefs = outputs
            .iter()
            .map(|o| (!non_pool_input_addresses.contains(&o.address())).then(|| StorageHandle::new(backend, &o.storage())))
            .collect();
        trace!(function = %self.function_id, outputs = outputs.len(), "warmup run complete");
        Ok(outputs)
    }

    /// True once every ancestor output and own output this node observed
    /// live at run time has since gone dead.
    pub fn all_outputs_dead(&self) -> bool {
        self.live_ancestor_handles.iter().all(|h| !h.is_live()) && self.outputs_weakrefs.iter().all(|w| !w.as_ref().is_some_and(StorageHandle::is_live))
    }

    /// Every still-live handle reachable from this warmup node's path,
    /// mirroring `RecordedNode::path_live_handles`.
    pub fn path_live_handles(&self) -> Vec<&StorageHandle<B>> {
        self.live_ancestor_handles
            .iter()
            .filter(|h| h.is_live())
            .chain(self.outputs_weakrefs.iter().flatten().filter(|h| h.is_live()))
            .collect()
    }

    pub fn outputs_weakrefs(&self) -> &[Option<StorageHandle<B>>] {
        &self.outputs_weakrefs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::WrappedFunction;
    use crate::testing::FakeBackend;

    #[test]
    #[should_panic(expected = "already ran once")]
    fn second_run_is_rejected() {
        let backend = FakeBackend::new();
        let pool_id = backend.new_pool_id(0);
        let arena: Arena<FakeBackend> = Arena::new();
        let function = WrappedFunction::new(FunctionId(0), Default::default(), Box::new(|_inputs| Vec::new()));

        let mut node = WarmupNode::new(&backend, FunctionId(0), pool_id, 0, None).unwrap();
        node.run(&backend, &arena, &function, vec![]).unwrap();

        // Second call is a programmer error — asserts rather than returning
        // an `Err` (§7: "Warmup run called twice: programmer error, assert").
        let _ = node.run(&backend, &arena, &function, vec![]);
    }

    #[test]
    fn outputs_go_dead_once_dropped() {
        let backend = FakeBackend::new();
        let pool_id = backend.new_pool_id(0);
        let arena: Arena<FakeBackend> = Arena::new();
        let model_backend = backend.clone();
        let function = WrappedFunction::new(FunctionId(0), Default::default(), Box::new(move |_inputs| vec![model_backend.fresh_tensor(0)]));

        let mut node = WarmupNode::new(&backend, FunctionId(0), pool_id, 0, None).unwrap();
        let outputs = node.run(&backend, &arena, &function, vec![]).unwrap();
        assert!(!node.all_outputs_dead());

        drop(outputs);
        assert!(node.all_outputs_dead());
    }
}
