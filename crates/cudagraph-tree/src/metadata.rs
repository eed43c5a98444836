//! Immutable tensor metadata, sufficient to rematerialize a view over a
//! storage once the original tensor object is gone.

use crate::ids::DeviceIndex;

/// Backend-defined element-type tag (e.g. a dtype enum discriminant).
/// Left as an opaque code here so the core crate never depends on a concrete
/// tensor library's dtype enum.
pub type DtypeId = u32;

/// Value type capturing everything needed to reconstruct a tensor view over
/// an existing allocation: byte size, raw address, shape, stride, element
/// type, device, and storage offset.
///
/// Captured once, at recording time, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMetadata {
    pub byte_size: usize,
    pub address: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<isize>,
    pub dtype: DtypeId,
    pub device: DeviceIndex,
    pub storage_offset: usize,
}

impl TensorMetadata {
    /// Dimensions broadcast via a zero stride. Used to skip copying those
    /// axes when replaying into a recording-time buffer — writing the same
    /// value `shape[i]` times instead of once would simply waste cycles.
    pub fn expanded_dims(&self) -> Vec<usize> {
        self.stride
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| (s == 0 && self.shape.get(i).is_some_and(|&d| d > 1)).then_some(i))
            .collect()
    }
}
