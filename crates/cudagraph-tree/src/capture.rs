//! `CaptureGuard`: a scope-guard around one capture pass (§9 Design Notes,
//! "Scoped resources"). Recording and warmup both bracket a capture with a
//! compute-library-cache clear and a pool binding; this guard makes that
//! release run on every exit path, including a panic mid-capture, rather
//! than only on the happy path.
//!
//! Grounded on this codebase's `jit::compiler_thread::CompilerThread`, whose
//! `Drop` unconditionally tears down its background thread; here `Drop`
//! unconditionally finishes a capture left open rather than leaving the
//! backend capturing into a pool nobody will ever read from.

use crate::backend::Backend;
use crate::error::TreeError;
use crate::ids::{DeviceIndex, PoolId};

pub(crate) struct CaptureGuard<'a, B: Backend> {
    backend: &'a B,
    device: DeviceIndex,
    graph: Option<B::Graph>,
}

impl<'a, B: Backend> CaptureGuard<'a, B> {
    pub(crate) fn begin(backend: &'a B, device: DeviceIndex, pool: PoolId) -> Result<Self, TreeError<B::Error>> {
        backend.clear_compute_library_caches();
        let graph = backend.capture_begin(device, pool)?;
        Ok(Self { backend, device, graph: Some(graph) })
    }

    /// Finalize the capture on the happy path, returning the finished graph.
    pub(crate) fn finish(mut self) -> Result<B::Graph, TreeError<B::Error>> {
        #[expect(clippy::unwrap_used, reason = "begin() always leaves graph Some until finish/drop runs")]
        let mut graph = self.graph.take().unwrap();
        self.backend.capture_end(self.device, &mut graph)?;
        Ok(graph)
    }
}

impl<'a, B: Backend> Drop for CaptureGuard<'a, B> {
    fn drop(&mut self) {
        self.backend.clear_compute_library_caches();
        if let Some(mut graph) = self.graph.take() {
            // finish() was never reached, e.g. the model panicked mid-capture.
            // Still release the pool binding so the backend isn't left
            // capturing forever.
            if let Err(err) = self.backend.capture_end(self.device, &mut graph) {
                tracing::error!(error = %err, "capture_end failed while releasing an abandoned capture");
            }
        }
    }
}
