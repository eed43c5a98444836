//! `ManagerContainer`: per-device lifetime owner (§4.5).
//!
//! Keeps a `TreeManager` alive for as long as either any wrapped callable or
//! any output tensor handed out by its tree still exists, and lazily
//! constructs the manager on first use. Grounded on this codebase's
//! `JIT_STATE` global (`lazy_static! { pub static ref JIT_STATE: JitState }`
//! in `vm.rs`), generalized here to be per-device and backend-generic rather
//! than a single process-wide singleton.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

use crate::backend::Backend;
use crate::callable::{OutputGuard, WrappedCallable};
use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::function::Model;
use crate::ids::{DeviceIndex, FunctionId};
use crate::manager::TreeManager;

struct Inner<B: Backend> {
    manager: Option<TreeManager<B>>,
    live_callables: usize,
    live_storages: usize,
    backend: B,
    device: DeviceIndex,
    config: TreeConfig,
}

impl<B: Backend> Inner<B> {
    fn manager(&mut self) -> Result<&mut TreeManager<B>, TreeError<B::Error>> {
        if self.manager.is_none() {
            self.manager = Some(TreeManager::new(self.backend.clone(), self.device, self.config.clone())?);
        }
        #[expect(clippy::unwrap_used, reason = "just ensured Some above")]
        Ok(self.manager.as_mut().unwrap())
    }

    /// Drop the manager once nothing external keeps it alive (§4.5,
    /// §5 Lifetime rule). The manager's own `Drop` releases its retained
    /// pool-keepalive graph, which is what actually frees the pool.
    fn maybe_drop_manager(&mut self) {
        if self.live_callables == 0 && self.live_storages == 0 {
            self.manager = None;
        }
    }
}

/// Owns (at most) one `TreeManager` per device, refcounted by outstanding
/// callables and output tensors.
pub struct ManagerContainer<B: Backend> {
    inner: Mutex<Inner<B>>,
}

impl<B: Backend> ManagerContainer<B> {
    pub fn new(backend: B, device: DeviceIndex, config: TreeConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                manager: None,
                live_callables: 0,
                live_storages: 0,
                backend,
                device,
                config,
            }),
        })
    }

    /// `install(model, example_inputs, static_input_indices) -> callable`
    /// (§4.4 Installation / §6 User surface). Lazily creates the manager.
    pub fn install(
        self: &Arc<Self>,
        model: Model<B>,
        example_inputs: &[Option<B::Tensor>],
        static_input_indices: FxHashSet<usize>,
    ) -> Result<WrappedCallable<B>, TreeError<B::Error>> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut inner = self.inner.lock().unwrap();
        let function_id = inner.manager()?.install(model, example_inputs, static_input_indices);
        inner.live_callables += 1;
        drop(inner);
        Ok(WrappedCallable::new(function_id, Arc::clone(self)))
    }

    /// Dispatch a call into the (lazily-created) manager, wrapping every
    /// output tensor in an `OutputGuard` so the container's storage count
    /// reflects them for as long as the caller holds on to them.
    pub(crate) fn run(self: &Arc<Self>, function_id: FunctionId, inputs: Vec<Option<B::Tensor>>) -> Result<Vec<OutputGuard<B>>, TreeError<B::Error>> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut inner = self.inner.lock().unwrap();
        let outputs = inner.manager()?.run(function_id, inputs)?;
        drop(inner);
        Ok(outputs.into_iter().map(|tensor| OutputGuard::new(tensor, Arc::clone(self))).collect())
    }

    pub(crate) fn on_callable_dropped(&self) {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut inner = self.inner.lock().unwrap();
        inner.live_callables = inner.live_callables.saturating_sub(1);
        inner.maybe_drop_manager();
    }

    pub(crate) fn on_storage_dropped(&self) {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut inner = self.inner.lock().unwrap();
        inner.live_storages = inner.live_storages.saturating_sub(1);
        inner.maybe_drop_manager();
    }

    pub(crate) fn add_storage_ref(&self) {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut inner = self.inner.lock().unwrap();
        inner.live_storages += 1;
    }

    /// Current `(live_callables, live_storages)` counts, for tests and
    /// diagnostics.
    pub fn refcounts(&self) -> (usize, usize) {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let inner = self.inner.lock().unwrap();
        (inner.live_callables, inner.live_storages)
    }

    /// True iff no `TreeManager` is currently alive for this container.
    pub fn is_empty(&self) -> bool {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let inner = self.inner.lock().unwrap();
        inner.manager.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn lazily_creates_and_drops_manager() {
        let container = ManagerContainer::new(FakeBackend::new(), 0, TreeConfig::default());
        assert!(container.is_empty());

        let model: Model<FakeBackend> = Box::new(|inputs| inputs.drain(..).flatten().collect());
        let callable = container.install(model, &[], FxHashSet::default()).unwrap();
        assert!(!container.is_empty());
        assert_eq!(container.refcounts(), (1, 0));

        drop(callable);
        assert!(container.is_empty());
    }
}
