//! A weak handle to a tensor's underlying storage (§4.1).

use crate::backend::{Backend, LivenessToken};

/// Weak reference to a storage plus its cached raw address.
///
/// The address is captured once at construction and is returned
/// unconditionally by [`StorageHandle::address`] — it is never recomputed
/// through the weak token, even after the token has gone dead. A handle
/// whose `address()` instead re-derived the value by upgrading its own weak
/// reference would, on a dead storage, have nothing to upgrade and would be
/// unable to answer the question at all; caching the address at construction
/// is what makes post-free identity checks possible.
#[derive(Clone, Debug)]
pub struct StorageHandle<B: Backend> {
    weak: B::Weak,
    address: usize,
}

impl<B: Backend> StorageHandle<B> {
    pub fn new(backend: &B, storage: &B::Storage) -> Self {
        Self {
            weak: backend.downgrade(storage),
            address: backend.storage_address(storage),
        }
    }

    /// True iff the storage this handle was built from is still allocated.
    ///
    /// Monotonic: once this returns `false` it never returns `true` again,
    /// since the underlying weak token's own liveness is monotonic.
    pub fn is_live(&self) -> bool {
        self.weak.is_live()
    }

    /// The address cached at construction time, readable even once the
    /// storage has been freed.
    pub fn address(&self) -> usize {
        self.address
    }
}
