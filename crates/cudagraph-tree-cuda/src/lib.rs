//! CUDA driver backend for `cudagraph-tree`.
//!
//! A separate, optionally-compiled crate so the core crate carries no GPU
//! dependency of its own — mirrored on this codebase's split between
//! `ethrex-levm`'s lightweight `jit::dispatch::JitBackend` trait and
//! `tokamak-jit`'s heavy revmc/LLVM implementation of it.
//!
//! Everything here is gated behind the `cuda` feature, which pulls in
//! `cudarc` and requires the CUDA toolkit/driver to be present at build
//! time — same shape as `tokamak-jit`'s `revmc-backend` feature gating its
//! LLVM dependency.

#[cfg(feature = "cuda")]
mod backend;
mod error;

#[cfg(feature = "cuda")]
pub use backend::{CudaBackend, CudaGraph, CudaStorage, CudaTensor, CudaWeak};
pub use error::CudaBackendError;
