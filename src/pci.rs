//! Interfaces of the PCI enumeration and DMA allocation layer.
//!
//! Device discovery, BAR mapping, page pinning and scatter-gather list
//! construction live outside this crate. The driver core only consumes the
//! traits defined here; mapping validity is the implementor's contract.

use alloc::{sync::Arc, vec::Vec};
use core::ptr::NonNull;

/// Stable numeric id a DMA buffer is registered under.
///
/// Buffers created as open-or-create persist under their id beyond the
/// lifetime of the creating process; the allocator is the authority on
/// persistence.
pub type BufferId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// Buffer create collided with a persistent allocation.
    AlreadyExists,
    /// Buffer open found no matching id.
    NotFound,
    /// Allocator refused for reasons other than collision.
    AllocFailed,
    /// Allocator failed to release a buffer.
    DeallocFailed,
}

/// Direction of a DMA mapping, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    FromDevice,
    ToDevice,
    Bidirectional,
}

/// One entry of a device-visible scatter-gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Bus address of the backing pages.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
}

/// A page-pinned host memory region paired with its scatter-gather list.
///
/// `base` must be aligned to at least a cache line so that descriptor slots
/// can be read with aligned full-width loads. `mapping_size` may exceed
/// `physical_size` when the allocator double-maps the region to simplify
/// wrap-around reads.
#[derive(Debug)]
pub struct DmaRegion {
    pub base: NonNull<u8>,
    pub physical_size: usize,
    pub mapping_size: usize,
    pub sg: Vec<SgEntry>,
}

/// One enumerated PCI device with its BAR mapping and buffer allocator.
pub trait PciDevice {
    /// Base of the mapped register window.
    fn bar(&self) -> NonNull<u8>;

    fn allocate(
        &self,
        id: BufferId,
        size: usize,
        sg_list_count: usize,
        dir: DmaDirection,
    ) -> Result<DmaRegion, PciError>;

    fn connect(&self, id: BufferId) -> Result<DmaRegion, PciError>;

    fn deallocate(&self, region: &DmaRegion) -> Result<(), PciError>;
}

/// The process-wide PCI enumeration table.
pub trait DeviceOperator {
    fn device_count(&self) -> u64;

    fn open_device(&self, index: u64) -> Result<Arc<dyn PciDevice>, PciError>;
}
