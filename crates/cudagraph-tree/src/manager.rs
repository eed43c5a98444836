//! `TreeManager`: owns the forest of `RecordedNode`s rooted by function
//! identity, the single "current path" through it, and the private pool
//! (§4.4). The dispatcher that decides, for every call, whether to replay,
//! record, warm up, or reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::arena::Arena;
use crate::backend::{Backend, BlockState, TensorView};
use crate::capture::CaptureGuard;
use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::function::{Model, WrappedFunction};
use crate::ids::{DeviceIndex, FunctionId, GraphId, NodeId, PoolId};
use crate::node::{self, RecordedNode};
use crate::warmup::{WarmupNode, WarmupParent};

/// A monotonic counter exposed by the host: "outputs older than this
/// generation are no longer needed". One counter per process, shared by
/// every `TreeManager` regardless of device — a single process-wide global
/// (§6 Environment), not one per device or per manager.
static GENERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Declare that outputs from prior generations are no longer required.
/// Returns the new generation.
pub fn bump_generation() -> u64 {
    GENERATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Read the current generation without advancing it.
pub fn current_generation() -> u64 {
    GENERATION_COUNTER.load(Ordering::Relaxed)
}

/// I6: which kind of node `current_node` is, or that there is none.
#[derive(Default)]
enum CurrentNode<B: Backend> {
    #[default]
    None,
    Recorded(NodeId),
    Warmup(WarmupNode<B>),
}

/// I6's three-valued path state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    None,
    Warmup,
    Recording,
    Execution,
}

/// Atomic counters for observability, mirroring this codebase's
/// `JitMetrics` (atomic fields, a `snapshot`, a test-only `reset`).
#[derive(Debug, Default)]
pub struct TreeMetrics {
    pub recordings: AtomicU64,
    pub replays: AtomicU64,
    pub warmups: AtomicU64,
    pub checkpoints: AtomicU64,
    /// Maintained for parity with the source system's own counters but
    /// never consulted by any dispatch rule (§9 Open Question (a)).
    pub debug_fail_counter: AtomicU64,
    pub debug_checkpointing_counter: AtomicU64,
}

impl TreeMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.recordings.load(Ordering::Relaxed),
            self.replays.load(Ordering::Relaxed),
            self.warmups.load(Ordering::Relaxed),
            self.checkpoints.load(Ordering::Relaxed),
        )
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&self) {
        self.recordings.store(0, Ordering::Relaxed);
        self.replays.store(0, Ordering::Relaxed);
        self.warmups.store(0, Ordering::Relaxed);
        self.checkpoints.store(0, Ordering::Relaxed);
        self.debug_fail_counter.store(0, Ordering::Relaxed);
        self.debug_checkpointing_counter.store(0, Ordering::Relaxed);
    }
}

/// Owns one device's tree of recordings plus its private pool.
pub struct TreeManager<B: Backend> {
    backend: B,
    device: DeviceIndex,
    pool_id: PoolId,
    config: TreeConfig,

    arena: Arena<B>,
    roots: FxHashMap<FunctionId, Vec<NodeId>>,
    ids_to_funcs: FxHashMap<FunctionId, Arc<WrappedFunction<B>>>,
    warmed_up_functions: FxHashSet<FunctionId>,

    current: CurrentNode<B>,
    path_state: PathState,
    current_generation: u64,

    next_function_id: u64,
    next_graph_id: u64,

    /// Keeps the pool alive independent of any node — released only when
    /// the whole manager is dropped.
    _pool_keepalive: B::Graph,

    pub metrics: TreeMetrics,
}

impl<B: Backend> TreeManager<B> {
    pub fn new(backend: B, device: DeviceIndex, config: TreeConfig) -> Result<Self, TreeError<B::Error>> {
        let pool_id = backend.new_pool_id(device);
        let keepalive = CaptureGuard::begin(&backend, device, pool_id)?.finish()?;
        Ok(Self {
            backend,
            device,
            pool_id,
            config,
            arena: Arena::new(),
            roots: FxHashMap::default(),
            ids_to_funcs: FxHashMap::default(),
            warmed_up_functions: FxHashSet::default(),
            current: CurrentNode::None,
            path_state: PathState::None,
            current_generation: current_generation(),
            next_function_id: 0,
            next_graph_id: 0,
            _pool_keepalive: keepalive,
            metrics: TreeMetrics::default(),
        })
    }

    pub fn path_state(&self) -> PathState {
        self.path_state
    }

    pub fn roots(&self) -> &FxHashMap<FunctionId, Vec<NodeId>> {
        &self.roots
    }

    pub fn arena(&self) -> &Arena<B> {
        &self.arena
    }

    /// Installation (§4.4): discard misaligned declared-static indices,
    /// assign a fresh `FunctionId`, and retain the model.
    pub fn install(&mut self, model: Model<B>, example_inputs: &[Option<B::Tensor>], declared_static_indices: FxHashSet<usize>) -> FunctionId {
        let aligned: FxHashSet<usize> = declared_static_indices
            .into_iter()
            .filter(|&i| {
                let aligned = example_inputs.get(i).and_then(Option::as_ref).is_some_and(|t| t.address() % 16 == 0);
                if !aligned {
                    warn!(index = i, "discarding misaligned static input declaration");
                }
                aligned
            })
            .collect();

        let function_id = FunctionId(self.next_function_id);
        self.next_function_id += 1;
        let function = WrappedFunction::new(function_id, aligned, model);
        self.ids_to_funcs.insert(function_id, Arc::new(function));
        function_id
    }

    /// The dispatcher (§4.4). Decides, for this call, whether to replay an
    /// existing child, record a new child, warm up, or reset the path.
    pub fn run(&mut self, function_id: FunctionId, mut inputs: Vec<Option<B::Tensor>>) -> Result<Vec<B::Tensor>, TreeError<B::Error>> {
        let generation = current_generation();

        // 1. Opportunistically close a path left open by the previous call.
        match self.path_state {
            PathState::Recording | PathState::Execution => {
                self.try_end_recorded_path(generation)?;
            }
            PathState::Warmup => {
                self.try_end_warmup(generation)?;
            }
            PathState::None => {}
        }

        // 2. Warmup gate.
        let already_warm = self.warmed_up_functions.contains(&function_id);
        let in_warmup_path = matches!(self.path_state, PathState::Warmup);
        if (!already_warm && !self.config.skip_warmup) || in_warmup_path {
            if matches!(self.path_state, PathState::Execution) {
                self.apply_checkpoint()?;
            }
            self.warmed_up_functions.insert(function_id);
            return self.run_warmup(function_id, inputs);
        }

        // 3. Match an existing child of the current node (or a root).
        let candidates: Vec<NodeId> = match &self.current {
            CurrentNode::Recorded(id) => self.arena.get(*id).children_of(function_id).to_vec(),
            _ => self.roots.get(&function_id).cloned().unwrap_or_default(),
        };
        for candidate in candidates {
            if self.arena.get(candidate).check_invariants(&self.arena, &mut inputs)? {
                return self.execute_node(candidate, inputs);
            }
        }

        // 4. No match: if this function has roots but we're not currently
        // positioned at one, try resetting the path and retry once — this
        // always converges because closing sets current_node to null,
        // which is exactly the roots case (§7 Propagation).
        if matches!(self.current, CurrentNode::Recorded(_)) && self.roots.contains_key(&function_id) {
            let closed = self.try_end_recorded_path(generation)?;
            if closed {
                return self.run(function_id, inputs);
            }
        }

        // 5. Commit to a new recording.
        if !matches!(self.current, CurrentNode::None) {
            self.apply_checkpoint()?;
        }
        self.record_function(function_id, inputs)
    }

    fn record_function(&mut self, function_id: FunctionId, inputs: Vec<Option<B::Tensor>>) -> Result<Vec<B::Tensor>, TreeError<B::Error>> {
        self.backend.device_synchronize(self.device).map_err(TreeError::Backend)?;

        let parent = match self.current {
            CurrentNode::Recorded(id) => Some(id),
            _ => None,
        };
        #[expect(clippy::unwrap_used, reason = "run() never dispatches for an uninstalled function_id")]
        let function = Arc::clone(self.ids_to_funcs.get(&function_id).unwrap());
        let graph_id = GraphId(self.next_graph_id);
        self.next_graph_id += 1;

        // `record` consumes `inputs` into the scratch capture (per §4.2
        // step 6, original data is *not* copied into the pool buffers
        // there); a clone is kept so the immediately-following `run` below
        // can copy the real data in and produce correct first outputs.
        let inputs_for_replay = inputs.clone();
        let node_id = RecordedNode::record(&self.backend, &mut self.arena, &function, parent, inputs, self.pool_id, self.device, graph_id)?;
        match parent {
            Some(parent_id) => self.arena.get_mut(parent_id).add_child(function_id, node_id),
            None => {
                self.roots.entry(function_id).or_default().push(node_id);
                if self.roots.len() > self.config.max_tracked_roots {
                    warn!(
                        roots = self.roots.len(),
                        cap = self.config.max_tracked_roots,
                        "distinct root function count exceeds max_tracked_roots"
                    );
                }
            }
        }

        self.current = CurrentNode::Recorded(node_id);
        self.path_state = PathState::Recording;
        self.current_generation = current_generation();
        self.backend.device_synchronize(self.device).map_err(TreeError::Backend)?;
        self.metrics.recordings.fetch_add(1, Ordering::Relaxed);

        self.arena.get_mut(node_id).run(&self.backend, inputs_for_replay)
    }

    fn execute_node(&mut self, node_id: NodeId, inputs: Vec<Option<B::Tensor>>) -> Result<Vec<B::Tensor>, TreeError<B::Error>> {
        self.current = CurrentNode::Recorded(node_id);
        self.path_state = PathState::Execution;
        self.current_generation = current_generation();
        self.metrics.replays.fetch_add(1, Ordering::Relaxed);
        self.arena.get_mut(node_id).run(&self.backend, inputs)
    }

    fn run_warmup(&mut self, function_id: FunctionId, inputs: Vec<Option<B::Tensor>>) -> Result<Vec<B::Tensor>, TreeError<B::Error>> {
        let parent = match std::mem::take(&mut self.current) {
            CurrentNode::None => None,
            CurrentNode::Recorded(id) => Some(WarmupParent::Recorded(id)),
            CurrentNode::Warmup(w) => Some(WarmupParent::Warmup(Box::new(w))),
        };
        let mut node = WarmupNode::new(&self.backend, function_id, self.pool_id, self.device, parent)?;
        #[expect(clippy::unwrap_used, reason = "run() never dispatches for an uninstalled function_id")]
        let function = Arc::clone(self.ids_to_funcs.get(&function_id).unwrap());
        let outputs = node.run(&self.backend, &self.arena, &function, inputs)?;

        self.current = CurrentNode::Warmup(node);
        self.path_state = PathState::Warmup;
        self.current_generation = current_generation();
        self.metrics.warmups.fetch_add(1, Ordering::Relaxed);
        debug!(function = %function_id, "warmup complete");
        Ok(outputs)
    }

    /// Shared by recording and execution: a just-recorded node and a
    /// matched-and-replayed node close the same way.
    fn try_end_recorded_path(&mut self, generation: u64) -> Result<bool, TreeError<B::Error>> {
        let CurrentNode::Recorded(node_id) = self.current else {
            return Ok(true);
        };

        let generation_advanced = generation != self.current_generation;
        let node = self.arena.get(node_id);
        let should_close = generation_advanced || node.all_outputs_dead(&self.arena);
        if !should_close {
            return Ok(false);
        }

        if generation_advanced {
            let addresses: Vec<usize> = node.path_live_handles(&self.arena).into_iter().map(|(_, h)| h.address()).collect();
            for address in addresses {
                self.backend.raw_free(self.device, address).map_err(TreeError::Backend)?;
            }
        }
        let path = node.path_weakrefs.clone();
        node::clear_path_outputs(&mut self.arena, &path);

        self.current = CurrentNode::None;
        self.path_state = PathState::None;
        Ok(true)
    }

    fn try_end_warmup(&mut self, generation: u64) -> Result<bool, TreeError<B::Error>> {
        let CurrentNode::Warmup(node) = &self.current else {
            return Ok(true);
        };

        let generation_advanced = generation != self.current_generation;
        let should_close = generation_advanced || node.all_outputs_dead();
        if !should_close {
            return Ok(false);
        }

        if generation_advanced {
            let addresses: Vec<usize> = node.path_live_handles().into_iter().map(|h| h.address()).collect();
            for address in addresses {
                self.backend.raw_free(self.device, address).map_err(TreeError::Backend)?;
            }
        }

        self.current = CurrentNode::None;
        self.path_state = PathState::None;
        Ok(true)
    }

    /// Restore the allocator to the current node's post-recording
    /// checkpoint (§4.4 Allocator checkpoint application). A no-op if there
    /// is no current recorded node (nothing to checkpoint from).
    fn apply_checkpoint(&mut self) -> Result<(), TreeError<B::Error>> {
        let CurrentNode::Recorded(node_id) = self.current else {
            return Ok(());
        };
        let node = self.arena.get(node_id);
        let Some(state) = node.checkpointed_allocator_state() else {
            return Ok(());
        };

        let live: Vec<usize> = node.path_live_handles(&self.arena).into_iter().map(|(_, h)| h.address()).collect();
        let freed: Vec<usize> = node.data_ptrs_freed_since_recording(&self.arena);

        // "make the allocator believe the pool currently holds exactly
        // these live blocks" — stale is empty; freed addresses are released
        // explicitly afterwards, never folded into the restore call itself
        // (doing so would let the restore reincarnate them as live).
        self.backend.restore_allocator(self.device, self.pool_id, state, &[], &live).map_err(TreeError::Backend)?;
        for address in &freed {
            self.backend.raw_free(self.device, *address).map_err(TreeError::Backend)?;
        }

        self.metrics.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.metrics.debug_checkpointing_counter.fetch_add(1, Ordering::Relaxed);

        if self.config.debug_trees {
            self.verify_pool_consistency(&live);
        }
        Ok(())
    }

    /// Debug-mode check: the allocator's own view of the pool must now
    /// agree with the live set we just asked it to restore. A disagreement
    /// is a consistency bug in the tree manager itself, not a recoverable
    /// runtime condition (§7: "Pool consistency failure under debug mode:
    /// assert with the set of unaccounted addresses"), so this asserts
    /// rather than returning a `Result`.
    fn verify_pool_consistency(&self, expected_live: &[usize]) {
        let segments = self.backend.pool_segments(self.pool_id);
        let allocated: FxHashSet<usize> = segments
            .iter()
            .filter(|s| s.blocks.iter().any(|(_, state)| matches!(state, BlockState::Allocated)))
            .map(|s| s.address)
            .collect();
        let unaccounted: Vec<usize> = expected_live.iter().copied().filter(|addr| !allocated.contains(addr)).collect();
        if !unaccounted.is_empty() {
            self.metrics.debug_fail_counter.fetch_add(1, Ordering::Relaxed);
            panic!("pool consistency check failed: unaccounted addresses {unaccounted:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::FakeBackend;

    /// `bump_generation` touches a process-wide counter by design (§6
    /// Environment) — serialize this module's tests against each other so
    /// one test's bump can't race another's dispatch decision.
    static GENERATION_LOCK: Mutex<()> = Mutex::new(());

    fn model_fresh(backend: FakeBackend) -> Model<FakeBackend> {
        Box::new(move |_inputs| vec![backend.fresh_tensor(0)])
    }

    #[test]
    fn warmup_then_record_then_replay() {
        let _guard = GENERATION_LOCK.lock().unwrap();
        let backend = FakeBackend::new();
        let mut manager = TreeManager::new(backend.clone(), 0, TreeConfig::default()).unwrap();
        let fn_id = manager.install(model_fresh(backend.clone()), &[], FxHashSet::default());

        drop(manager.run(fn_id, vec![]).unwrap());
        assert_eq!(manager.path_state(), PathState::Warmup);

        drop(manager.run(fn_id, vec![]).unwrap());
        assert_eq!(manager.path_state(), PathState::Recording);

        drop(manager.run(fn_id, vec![]).unwrap());
        assert_eq!(manager.path_state(), PathState::Execution);

        let (recordings, replays, warmups, _) = manager.metrics.snapshot();
        assert_eq!((recordings, replays, warmups), (1, 1, 1));
    }

    #[test]
    fn generation_bump_closes_an_open_path_even_with_live_outputs() {
        let _guard = GENERATION_LOCK.lock().unwrap();
        let backend = FakeBackend::new();
        let mut manager = TreeManager::new(backend.clone(), 0, TreeConfig::default()).unwrap();
        let fn_id = manager.install(model_fresh(backend.clone()), &[], FxHashSet::default());

        drop(manager.run(fn_id, vec![]).unwrap()); // warmup
        let recorded_output = manager.run(fn_id, vec![]).unwrap(); // record, path left open
        assert_eq!(manager.path_state(), PathState::Recording);

        bump_generation();
        // `recorded_output` is still held (live) but the generation bump
        // forces the open path closed regardless of liveness.
        drop(manager.run(fn_id, vec![]).unwrap());
        assert_eq!(manager.path_state(), PathState::Execution);
        drop(recorded_output);
    }

    #[test]
    fn rebranching_to_an_unrelated_function_checkpoints_the_allocator() {
        let _guard = GENERATION_LOCK.lock().unwrap();
        let backend = FakeBackend::new();
        let mut manager = TreeManager::new(backend.clone(), 0, TreeConfig::default()).unwrap();
        let fn_a = manager.install(model_fresh(backend.clone()), &[], FxHashSet::default());
        let fn_c = manager.install(model_fresh(backend.clone()), &[], FxHashSet::default());

        // Warm fn_c up front, independent of fn_a's path.
        drop(manager.run(fn_c, vec![]).unwrap());

        // Drive fn_a through warmup -> record -> replay so it ends in
        // Execution with fn_a's node as the current node.
        drop(manager.run(fn_a, vec![]).unwrap());
        drop(manager.run(fn_a, vec![]).unwrap());
        let fn_a_output = manager.run(fn_a, vec![]).unwrap();
        assert_eq!(manager.path_state(), PathState::Execution);

        let checkpoints_before = manager.metrics.checkpoints.load(Ordering::Relaxed);

        // `fn_a_output` is still held, so the top-of-run close check can't
        // auto-close fn_a's path before dispatch even looks at fn_c: fn_c
        // matches no child of fn_a's node and isn't a known root yet, so
        // committing to it checkpoints the allocator before recording it as
        // fn_a's child.
        drop(manager.run(fn_c, vec![]).unwrap());
        assert_eq!(manager.path_state(), PathState::Recording);
        assert_eq!(manager.metrics.checkpoints.load(Ordering::Relaxed), checkpoints_before + 1);
        drop(fn_a_output);
    }

    #[test]
    fn chained_function_classifies_ancestor_output_input_as_cudagraph_managed() {
        let _guard = GENERATION_LOCK.lock().unwrap();
        let backend = FakeBackend::new();
        let mut manager = TreeManager::new(backend.clone(), 0, TreeConfig::default()).unwrap();
        let fn_a = manager.install(model_fresh(backend.clone()), &[], FxHashSet::default());
        let echo: Model<FakeBackend> = Box::new(|inputs| {
            inputs.clear();
            Vec::new()
        });
        let fn_b = manager.install(echo, &[], FxHashSet::default());

        // Warmup iteration: g consumes f's warmup output, chaining the two
        // paths. Dropped at the end so the warmup path can close afterwards.
        let warmup_output = manager.run(fn_a, vec![]).unwrap();
        manager.run(fn_b, vec![Some(warmup_output[0].clone())]).unwrap();
        drop(warmup_output);

        // Recording iteration: f records as a root, g records as f's child,
        // consuming f's still-live output as an input.
        let parent_output = manager.run(fn_a, vec![]).unwrap();
        manager.run(fn_b, vec![Some(parent_output[0].clone())]).unwrap();

        let fn_a_node = manager.roots().get(&fn_a).unwrap()[0];
        let fn_b_node = manager.arena().get(fn_a_node).children_of(fn_b)[0];
        let node = manager.arena().get(fn_b_node);
        assert_eq!(node.cudagraph_managed_indices, [0].into_iter().collect());
        assert!(node.static_input_indices.contains(&0), "ancestor-output inputs are exempt from the declared-static check, \
             but are folded into static_input_indices so the address check still runs");

        drop(parent_output);
    }

    #[test]
    fn manager_outlives_a_dropped_callable_while_an_output_is_still_held() {
        let backend = FakeBackend::new();
        let container = crate::container::ManagerContainer::new(backend.clone(), 0, TreeConfig::default());
        let model: Model<FakeBackend> = Box::new(move |_inputs| vec![backend.fresh_tensor(0)]);
        let callable = container.install(model, &[], FxHashSet::default()).unwrap();

        let output = callable.call(vec![]).unwrap(); // warmup call, no tree node yet
        drop(callable);
        assert!(!container.is_empty(), "an output is still held, so the manager must stay alive");

        drop(output);
        assert!(container.is_empty());
    }
}
