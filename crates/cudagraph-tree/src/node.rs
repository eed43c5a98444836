//! `RecordedNode`: one captured GPU graph plus all metadata needed to
//! replay it, reconstruct output views, check invariants, and checkpoint the
//! allocator (§4.2). The central entity of the tree.

use std::collections::HashMap;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::arena::Arena;
use crate::backend::{Backend, TensorView};
use crate::capture::CaptureGuard;
use crate::error::TreeError;
use crate::function::WrappedFunction;
use crate::ids::{DeviceIndex, FunctionId, GraphId, NodeId, PathIndex, PoolId};
use crate::metadata::TensorMetadata;
use crate::storage::StorageHandle;

/// One captured recording of a function, plus its place in the tree.
pub struct RecordedNode<B: Backend> {
    pub id: NodeId,
    pub graph_id: GraphId,
    pub function_id: FunctionId,
    pub device: DeviceIndex,
    pub pool_id: PoolId,

    pub parent: Option<NodeId>,
    pub children: FxHashMap<FunctionId, Vec<NodeId>>,

    graph: B::Graph,

    /// Declared-static ∪ cudagraph-managed.
    pub static_input_indices: FxHashSet<usize>,
    pub cudagraph_managed_indices: FxHashSet<usize>,
    /// Aligned with the input vector; `Some` only for indices in
    /// `static_input_indices` (invariant I4).
    static_input_addresses: Vec<Option<usize>>,
    /// Aligned with the input vector; `None` for static indices.
    input_metadata: Vec<Option<TensorMetadata>>,

    pub output_metadata: Vec<TensorMetadata>,
    pub output_aliases_static_input: Vec<bool>,
    /// Aligned with outputs; `None` iff the output aliases a static input
    /// (invariant I5).
    outputs_weakrefs: Vec<Option<StorageHandle<B>>>,

    /// Ancestor chain from root to self (inclusive), as arena ids.
    pub path_weakrefs: Vec<NodeId>,

    liveness_before: Vec<Vec<bool>>,
    liveness_after: Vec<Vec<bool>>,
    expected_dead_before: Vec<PathIndex>,
    expected_dead_after: Vec<PathIndex>,
    live_indices_after: Vec<PathIndex>,

    checkpointed_allocator_state: Option<B::AllocatorState>,

    first_run_done: bool,
    retained_first_outputs: Option<Vec<B::Tensor>>,
}

/// Snapshot liveness of every ancestor's `outputs_weakrefs`, in path order.
fn snapshot_liveness<B: Backend>(arena: &Arena<B>, path: &[NodeId]) -> Vec<Vec<bool>> {
    path.iter()
        .map(|&id| arena.get(id).outputs_weakrefs.iter().map(|w| w.as_ref().is_some_and(StorageHandle::is_live)).collect())
        .collect()
}

/// `PathIndex`es where `before[d][s]` is live but `after[d][s]` is not
/// (i.e. positions that became dead), or that simply don't exist in one of
/// the snapshots (treated as dead).
fn dead_diff(before: &[Vec<bool>], after: &[Vec<bool>]) -> Vec<PathIndex> {
    let mut out = Vec::new();
    for depth in 0..before.len().max(after.len()) {
        let before_row = before.get(depth).map(Vec::as_slice).unwrap_or(&[]);
        let after_row = after.get(depth).map(Vec::as_slice).unwrap_or(&[]);
        for slot in 0..before_row.len().max(after_row.len()) {
            let was_live = before_row.get(slot).copied().unwrap_or(false);
            let now_live = after_row.get(slot).copied().unwrap_or(false);
            if was_live && !now_live {
                out.push(PathIndex::new(depth, slot));
            }
        }
    }
    out
}

fn live_indices<B: Backend>(liveness: &[Vec<bool>]) -> Vec<PathIndex> {
    let mut out = Vec::new();
    for (depth, row) in liveness.iter().enumerate() {
        for (slot, &live) in row.iter().enumerate() {
            if live {
                out.push(PathIndex::new(depth, slot));
            }
        }
    }
    out
}

impl<B: Backend> RecordedNode<B> {
    /// Construct a new node: classify inputs, build the path, capture the
    /// graph, finalize output metadata, and snapshot the allocator (§4.2
    /// Construction, steps 1-11). Inserts the node into `arena` and returns
    /// its id.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        backend: &B,
        arena: &mut Arena<B>,
        function: &WrappedFunction<B>,
        parent: Option<NodeId>,
        mut inputs: Vec<Option<B::Tensor>>,
        pool_id: PoolId,
        device: DeviceIndex,
        graph_id: GraphId,
    ) -> Result<NodeId, TreeError<B::Error>> {
        let self_id = arena.next_id();

        // 4. Path: ancestors from root to parent, plus self.
        let mut path_weakrefs = parent.map(|p| arena.get(p).path_weakrefs.clone()).unwrap_or_default();
        path_weakrefs.push(self_id);

        // Addresses of every still-live output on the path so far, used to
        // classify cudagraph-managed inputs (step 1) — self contributes
        // nothing yet since it has no outputs.
        let mut live_ancestor_addresses: FxHashSet<usize> = FxHashSet::default();
        for &id in &path_weakrefs {
            if id == self_id {
                continue;
            }
            let node = arena.get(id);
            for w in &node.outputs_weakrefs {
                if let Some(h) = w {
                    if h.is_live() {
                        live_ancestor_addresses.insert(h.address());
                    }
                }
            }
        }

        // 1-2. Classify inputs.
        let mut cudagraph_managed_indices = FxHashSet::default();
        let mut static_input_indices = function.declared_static_indices.clone();
        let mut static_input_addresses = vec![None; inputs.len()];
        for (i, slot) in inputs.iter().enumerate() {
            let Some(tensor) = slot else { continue };
            if live_ancestor_addresses.contains(&tensor.address()) {
                cudagraph_managed_indices.insert(i);
                static_input_indices.insert(i);
            }
        }
        for &i in &static_input_indices {
            if let Some(tensor) = inputs.get(i).and_then(Option::as_ref) {
                static_input_addresses[i] = Some(tensor.address());
            }
        }

        // 3. Metadata + expanded dims for non-static inputs only.
        let mut input_metadata = vec![None; inputs.len()];
        for (i, slot) in inputs.iter().enumerate() {
            if static_input_indices.contains(&i) {
                continue;
            }
            if let Some(tensor) = slot {
                input_metadata[i] = Some(tensor.metadata());
            }
        }

        // 5. Liveness-before and expected-dead-before, relative to the
        // parent's own post-execution liveness. Snapshotted over the
        // ancestor chain only — self isn't in the arena yet at this point
        // and has no outputs of its own regardless.
        let (liveness_before, expected_dead_before) = if let Some(parent_id) = parent {
            let parent_node = arena.get(parent_id);
            let before = snapshot_liveness(arena, &parent_node.path_weakrefs);
            let expected = dead_diff(&parent_node.liveness_after, &before);
            (before, expected)
        } else {
            (Vec::new(), Vec::new())
        };

        // 6. Replacement input buffers inside the pool for non-static
        // indices (uninitialized; no data copied yet).
        let mut recording_inputs: Vec<Option<B::Tensor>> = Vec::with_capacity(inputs.len());
        for (i, slot) in inputs.drain(..).enumerate() {
            if static_input_indices.contains(&i) {
                recording_inputs.push(slot);
            } else {
                let fresh = match &slot {
                    Some(tensor) => Some(backend.allocate_like(device, pool_id, tensor)?),
                    None => None,
                };
                recording_inputs.push(fresh);
            }
        }

        // 7. Capture, guarded so a panic mid-invoke still releases the pool
        // binding instead of leaving the backend capturing forever.
        let guard = CaptureGuard::begin(backend, device, pool_id)?;
        let outputs = function.invoke(&mut recording_inputs);
        let graph = guard.finish()?;

        // 8. Output metadata + alias classification.
        let static_storage_addresses: FxHashSet<usize> = static_input_addresses.iter().flatten().copied().collect();
        let output_metadata: Vec<TensorMetadata> = outputs.iter().map(TensorView::metadata).collect();
        let output_aliases_static_input: Vec<bool> = outputs
            .iter()
            .map(|o| static_storage_addresses.contains(&o.address()))
            .collect();

        // 9. Allocator checkpoint.
        let checkpointed_allocator_state = Some(backend.snapshot_allocator(device, pool_id)?);

        // 10. Output weak handles.
        let outputs_weakrefs: Vec<Option<StorageHandle<B>>> = outputs
            .iter()
            .zip(&output_aliases_static_input)
            .map(|(tensor, &is_alias)| (!is_alias).then(|| StorageHandle::new(backend, &tensor.storage())))
            .collect();

        let node = Self {
            id: self_id,
            graph_id,
            function_id: function.function_id,
            device,
            pool_id,
            parent,
            children: FxHashMap::default(),
            graph,
            static_input_indices,
            cudagraph_managed_indices,
            static_input_addresses,
            input_metadata,
            output_metadata,
            output_aliases_static_input,
            outputs_weakrefs,
            path_weakrefs,
            liveness_before,
            liveness_after: Vec::new(),
            expected_dead_before,
            expected_dead_after: Vec::new(),
            live_indices_after: Vec::new(),
            checkpointed_allocator_state,
            first_run_done: false,
            retained_first_outputs: Some(outputs),
        };
        let id = arena.push(node);
        debug_assert_eq!(id, self_id);

        // 11. Liveness-after, now that self's outputs exist in the arena.
        let path = arena.get(id).path_weakrefs.clone();
        let liveness_after = snapshot_liveness(arena, &path);
        let node = arena.get_mut(id);
        node.expected_dead_after = dead_diff(&node.liveness_before, &liveness_after);
        node.live_indices_after = live_indices(&liveness_after);
        node.liveness_after = liveness_after;

        debug!(node = %id, function = %function.function_id, "recorded new node");
        Ok(id)
    }

    /// Invariant check prior to execution (§4.2). `Ok(true)` = matches and
    /// may replay, `Ok(false)` = recoverable mismatch (caller should record
    /// a new child instead), `Err` = fatal.
    pub fn check_invariants(
        &self,
        arena: &Arena<B>,
        inputs: &mut [Option<B::Tensor>],
    ) -> Result<bool, TreeError<B::Error>> {
        // Every static index (declared-static as well as cudagraph-managed)
        // must still match its recorded address (§4.2, §7 "Static-input
        // address drift"); a mismatch is recoverable here, not fatal — it
        // just means this node isn't a match and the caller should fall
        // through to recording a new child instead.
        for &i in &self.static_input_indices {
            let Some(expected) = self.static_input_addresses.get(i).copied().flatten() else {
                continue;
            };
            let actual = inputs.get(i).and_then(Option::as_ref).map(TensorView::address);
            if actual != Some(expected) {
                trace!(node = %self.id, index = i, "static input address drift");
                return Ok(false);
            }
        }

        for &pi in &self.expected_dead_before {
            if self.path_index_is_live(arena, pi) {
                trace!(node = %self.id, position = %pi, "expected-dead-before violated");
                return Ok(false);
            }
        }

        // Force-drop the cudagraph-managed inputs: their memory must be
        // reclaimed before replay writes into the same addresses, and the
        // caller's reference must not outlive this point either way.
        for &i in &self.cudagraph_managed_indices {
            if let Some(slot) = inputs.get_mut(i) {
                *slot = None;
            }
        }

        for &pi in &self.expected_dead_after {
            if self.path_index_is_live(arena, pi) {
                return Err(TreeError::LivenessViolationAfterDrop {
                    positions: self.expected_dead_after.clone(),
                });
            }
        }

        Ok(true)
    }

    fn path_index_is_live(&self, arena: &Arena<B>, pi: PathIndex) -> bool {
        self.path_weakrefs
            .get(pi.depth)
            .map(|&id| arena.get(id))
            .and_then(|node| node.outputs_weakrefs.get(pi.slot))
            .is_some_and(|w| w.as_ref().is_some_and(StorageHandle::is_live))
    }

    /// Replay (§4.2). Returns the outputs.
    pub fn run(&mut self, backend: &B, mut inputs: Vec<Option<B::Tensor>>) -> Result<Vec<B::Tensor>, TreeError<B::Error>> {
        let mut storage_cache: HashMap<usize, B::Storage> = HashMap::new();

        for i in 0..inputs.len() {
            if self.cudagraph_managed_indices.contains(&i) {
                continue;
            }
            if self.static_input_indices.contains(&i) {
                // Already validated by check_invariants for replay callers;
                // a freshly-recorded node trivially matches itself.
                continue;
            }
            let Some(metadata) = self.input_metadata.get(i).cloned().flatten() else {
                continue;
            };
            let Some(new_tensor) = inputs[i].take() else { continue };
            let storage = storage_cache.entry(metadata.address).or_insert_with(|| {
                #[expect(clippy::unwrap_used, reason = "reconstructing a previously-valid address")]
                backend
                    .construct_storage_from_address(metadata.address, metadata.device, metadata.byte_size)
                    .unwrap()
            });
            let target = backend.reconstruct_tensor(storage, &metadata);
            backend.copy_into(&target, &new_tensor, &metadata.expanded_dims())?;
        }

        // 2. Release the caller's references.
        inputs.clear();

        // 3. Replay.
        backend.replay(self.device, &self.graph)?;

        // 4. First execution reuses the retained capture-time outputs;
        // later executions rebuild views over the same addresses.
        if !self.first_run_done {
            self.first_run_done = true;
            #[expect(clippy::unwrap_used, reason = "populated at construction, taken exactly once")]
            let outputs = self.retained_first_outputs.take().unwrap();
            Ok(outputs)
        } else {
            let mut output_storage_cache: HashMap<usize, B::Storage> = HashMap::new();
            let mut outputs = Vec::with_capacity(self.output_metadata.len());
            for (k, metadata) in self.output_metadata.iter().enumerate() {
                let storage = output_storage_cache.entry(metadata.address).or_insert_with(|| {
                    #[expect(clippy::unwrap_used, reason = "reconstructing a previously-valid address")]
                    backend
                        .construct_storage_from_address(metadata.address, metadata.device, metadata.byte_size)
                        .unwrap()
                });
                let tensor = backend.reconstruct_tensor(storage, metadata);
                if !self.output_aliases_static_input[k] {
                    self.outputs_weakrefs[k] = Some(StorageHandle::new(backend, storage));
                }
                outputs.push(tensor);
            }
            Ok(outputs)
        }
    }

    pub fn add_child(&mut self, function_id: FunctionId, child: NodeId) {
        self.children.entry(function_id).or_default().push(child);
    }

    pub fn children_of(&self, function_id: FunctionId) -> &[NodeId] {
        self.children.get(&function_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn checkpointed_allocator_state(&self) -> Option<&B::AllocatorState> {
        self.checkpointed_allocator_state.as_ref()
    }

    /// Every `PathIndex` live immediately after this node's first execution
    /// that is still live now.
    pub fn path_live_handles<'a>(&self, arena: &'a Arena<B>) -> Vec<(PathIndex, &'a StorageHandle<B>)> {
        self.live_indices_after
            .iter()
            .filter_map(|&pi| {
                let node = arena.get(*self.path_weakrefs.get(pi.depth)?);
                let handle = node.outputs_weakrefs.get(pi.slot)?.as_ref()?;
                handle.is_live().then_some((pi, handle))
            })
            .collect()
    }

    pub fn all_outputs_dead(&self, arena: &Arena<B>) -> bool {
        self.live_indices_after.iter().all(|&pi| !self.path_index_is_live(arena, pi))
    }

    /// Addresses of every `live_indices_after` position that has gone dead
    /// since this node's first execution.
    pub fn data_ptrs_freed_since_recording(&self, arena: &Arena<B>) -> Vec<usize> {
        self.live_indices_after
            .iter()
            .filter(|&&pi| !self.path_index_is_live(arena, pi))
            .filter_map(|&pi| {
                let node = arena.get(*self.path_weakrefs.get(pi.depth)?);
                node.output_metadata.get(pi.slot).map(|m| m.address)
            })
            .collect()
    }

    /// Drop this node's own output weakrefs, e.g. once a path is known to be
    /// torn down. Does not touch ancestors — see the free function
    /// [`clear_path_outputs`] for clearing a whole path at once.
    pub fn clear_outputs(&mut self) {
        self.outputs_weakrefs.clear();
    }

    /// Total nodes in this node's subtree, excluding itself. Debug/metrics
    /// only, never consulted for dispatch decisions.
    pub fn num_descendants(&self, arena: &Arena<B>) -> usize {
        let mut total = 0;
        for children in self.children.values() {
            for &child in children {
                total += 1 + arena.get(child).num_descendants(arena);
            }
        }
        total
    }
}

/// Clear every node's output weakrefs along `path` — load-bearing because
/// `path_weakrefs` aliases the ancestors' vectors rather than copying them
/// (§9 Design Notes). A free function (rather than a method) because the
/// caller always holds `path` as a value already copied out of the node
/// whose path is being torn down, to avoid borrowing the arena twice.
pub fn clear_path_outputs<B: Backend>(arena: &mut Arena<B>, path: &[NodeId]) {
    for &id in path {
        arena.get_mut(id).clear_outputs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn dead_diff_finds_only_positions_that_went_from_live_to_dead() {
        let before = vec![vec![true, true], vec![false]];
        let after = vec![vec![true, false], vec![false]];
        assert_eq!(dead_diff(&before, &after), vec![PathIndex::new(0, 1)]);
    }

    #[test]
    fn dead_diff_treats_a_missing_row_as_dead() {
        let before = vec![vec![true], vec![true]];
        let after = vec![vec![true]];
        assert_eq!(dead_diff::<FakeBackend>(&before, &after), vec![PathIndex::new(1, 0)]);
    }

    #[test]
    fn live_indices_lists_every_live_slot_in_depth_then_slot_order() {
        let liveness = vec![vec![true, false, true], vec![false]];
        assert_eq!(live_indices::<FakeBackend>(&liveness), vec![PathIndex::new(0, 0), PathIndex::new(0, 2)]);
    }

    #[test]
    fn recording_a_root_and_replaying_it_reuses_the_same_address() {
        let backend = FakeBackend::new();
        let mut arena = Arena::new();
        let model_backend = backend.clone();
        let function = WrappedFunction::new(
            FunctionId(0),
            Default::default(),
            Box::new(move |_inputs| vec![model_backend.fresh_tensor(0)]),
        );

        let node_id = RecordedNode::record(&backend, &mut arena, &function, None, vec![], backend.new_pool_id(0), 0, GraphId(0)).unwrap();
        assert!(!arena.get(node_id).all_outputs_dead(&arena), "retained first-run output should still be live");

        let first = arena.get_mut(node_id).run(&backend, vec![]).unwrap();
        let first_address = first[0].address();
        drop(first);

        let second = arena.get_mut(node_id).run(&backend, vec![]).unwrap();
        assert_eq!(second[0].address(), first_address);
    }
}
