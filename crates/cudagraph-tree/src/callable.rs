//! `WrappedCallable`: the user-facing handle returned by `install` (§4.6),
//! plus `OutputGuard`, the Drop-based refcounting that keeps a tree's
//! `ManagerContainer` alive for as long as an output tensor survives past
//! the callable itself (§4.5's storage-count half of the lifetime rule).
//!
//! The join-on-drop idea is grounded on this codebase's
//! `jit::compiler_thread::CompilerThread`, whose `Drop` closes its channel
//! and joins its background thread; here `Drop` instead decrements a shared
//! refcount and conditionally tears down the manager.

use std::ops::Deref;
use std::sync::Arc;

use crate::backend::Backend;
use crate::container::ManagerContainer;
use crate::error::TreeError;
use crate::ids::FunctionId;

/// An output tensor handed back to the caller, wrapped so that its `Drop`
/// notifies the owning `ManagerContainer` (§4.5/§4.6). Transparently
/// derefs to the underlying tensor.
pub struct OutputGuard<B: Backend> {
    tensor: B::Tensor,
    container: Arc<ManagerContainer<B>>,
}

impl<B: Backend> OutputGuard<B> {
    pub(crate) fn new(tensor: B::Tensor, container: Arc<ManagerContainer<B>>) -> Self {
        container.add_storage_ref();
        Self { tensor, container }
    }
}

impl<B: Backend> Deref for OutputGuard<B> {
    type Target = B::Tensor;

    fn deref(&self) -> &B::Tensor {
        &self.tensor
    }
}

impl<B: Backend> Drop for OutputGuard<B> {
    fn drop(&mut self) {
        self.container.on_storage_dropped();
    }
}

/// The stable closure `install()` returns to the user (§4.6). Calling it
/// dispatches into the owning `TreeManager`'s `run` with this callable's
/// `FunctionId`. Its `Drop` is the signal that decrements
/// `ManagerContainer::live_callables_count`.
pub struct WrappedCallable<B: Backend> {
    function_id: FunctionId,
    container: Arc<ManagerContainer<B>>,
}

impl<B: Backend> WrappedCallable<B> {
    pub(crate) fn new(function_id: FunctionId, container: Arc<ManagerContainer<B>>) -> Self {
        Self { function_id, container }
    }

    pub fn function_id(&self) -> FunctionId {
        self.function_id
    }

    /// `(inputs) -> outputs` (§6 User surface).
    pub fn call(&self, inputs: Vec<Option<B::Tensor>>) -> Result<Vec<OutputGuard<B>>, TreeError<B::Error>> {
        self.container.run(self.function_id, inputs)
    }
}

impl<B: Backend> Drop for WrappedCallable<B> {
    fn drop(&mut self) {
        self.container.on_callable_dropped();
    }
}
