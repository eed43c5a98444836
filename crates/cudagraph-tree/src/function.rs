//! The user's installed callable, plus its static-input declaration (§3).

use std::sync::Mutex;

use rustc_hash::FxHashSet;

use crate::backend::{Backend, TensorView};
use crate::ids::FunctionId;

/// The user-supplied model: takes ownership of its (possibly partially-drained)
/// input vector, returns a list of outputs. Expected to empty the input
/// vector as it consumes each tensor, so that input memory can be reclaimed
/// during capture.
pub type Model<B> = Box<dyn FnMut(&mut Vec<Option<<B as Backend>::Tensor>>) -> Vec<<B as Backend>::Tensor> + Send>;

/// A model callable together with its static-input declaration and stable
/// identity.
///
/// A static input is one whose address must remain constant across calls
/// (e.g. parameters); indices not listed here may still end up treated as
/// static because they turn out to be `cudagraph_managed` (addresses coming
/// from an ancestor's output) — that union is computed per-node, not here.
pub struct WrappedFunction<B: Backend> {
    pub function_id: FunctionId,
    pub declared_static_indices: FxHashSet<usize>,
    model: Mutex<Model<B>>,
}

impl<B: Backend> WrappedFunction<B> {
    pub fn new(function_id: FunctionId, declared_static_indices: FxHashSet<usize>, model: Model<B>) -> Self {
        Self {
            function_id,
            declared_static_indices,
            model: Mutex::new(model),
        }
    }

    /// Invoke the model. Only ever called while the tree manager's own
    /// single-threaded `run` dispatch holds the call, so the mutex here is
    /// uncontended in practice — it exists to give `WrappedFunction` an
    /// interior-mutable `FnMut` without forcing every caller through `&mut`.
    pub fn invoke(&self, inputs: &mut Vec<Option<B::Tensor>>) -> Vec<B::Tensor> {
        #[expect(clippy::unwrap_used, reason = "mutex poisoning is unrecoverable")]
        let mut model = self.model.lock().unwrap();
        (model)(inputs)
    }
}

/// Returns the address of a declared-static input's example tensor, used by
/// `install` to discard misaligned static indices (§4.4 Installation).
pub fn example_address<B: Backend>(tensor: &B::Tensor) -> usize {
    tensor.address()
}
