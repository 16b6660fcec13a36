//! Ownership wrapper over a page-pinned DMA region.

use alloc::sync::Arc;
use core::{fmt, ptr::NonNull};

use log::error;

use crate::flib::constants::MC_DESC_SIZE;
use crate::flib::err::{FlibError, FlibResult};
use crate::pci::{BufferId, DmaDirection, DmaRegion, PciDevice, PciError, SgEntry};

/// A host buffer registered with the allocator under a stable id, together
/// with its device-visible scatter-gather list.
pub struct DmaBuffer {
    device: Arc<dyn PciDevice>,
    region: DmaRegion,
    id: BufferId,
    released: bool,
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("region", &self.region)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

impl DmaBuffer {
    /// Allocates a new buffer of `2^log_size` bytes under `id`.
    ///
    /// Fails with [`FlibError::AlreadyExists`] if the id is taken by a
    /// persistent allocation, [`FlibError::AllocFailed`] otherwise.
    pub fn create(device: Arc<dyn PciDevice>, id: BufferId, log_size: u32) -> FlibResult<Self> {
        let size = 1usize << log_size;
        match device.allocate(id, size, 1, DmaDirection::FromDevice) {
            Ok(region) => Ok(Self {
                device,
                region,
                id,
                released: false,
            }),
            Err(PciError::AlreadyExists) => Err(FlibError::AlreadyExists),
            Err(_) => Err(FlibError::AllocFailed),
        }
    }

    /// Attaches to an existing buffer under `id`.
    pub fn open(device: Arc<dyn PciDevice>, id: BufferId) -> FlibResult<Self> {
        match device.connect(id) {
            Ok(region) => Ok(Self {
                device,
                region,
                id,
                released: false,
            }),
            Err(_) => Err(FlibError::NotFound),
        }
    }

    /// Creates the buffer, attaching instead if the id is already taken.
    pub fn open_or_create(
        device: Arc<dyn PciDevice>,
        id: BufferId,
        log_size: u32,
    ) -> FlibResult<Self> {
        match Self::create(device.clone(), id, log_size) {
            Err(FlibError::AlreadyExists) => Self::open(device, id),
            other => other,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn base(&self) -> NonNull<u8> {
        self.region.base
    }

    pub fn physical_size(&self) -> usize {
        self.region.physical_size
    }

    /// May exceed [`DmaBuffer::physical_size`] when the allocator double-maps
    /// the region for seamless wrap reads.
    pub fn mapping_size(&self) -> usize {
        self.region.mapping_size
    }

    pub fn num_sg_entries(&self) -> usize {
        self.region.sg.len()
    }

    pub fn sg(&self) -> &[SgEntry] {
        &self.region.sg
    }

    /// Number of microslice descriptor slots this buffer can hold.
    pub fn max_desc_entries(&self) -> u64 {
        (self.region.physical_size / MC_DESC_SIZE) as u64
    }

    /// Clears the whole mapping. The consumer distinguishes fresh descriptors
    /// by their `idx` value, so the report buffer must start out zeroed.
    pub(crate) fn zero(&self) {
        unsafe {
            core::ptr::write_bytes(self.region.base.as_ptr(), 0, self.region.mapping_size);
        }
    }

    /// Releases the buffer with the allocator.
    pub fn deallocate(mut self) -> FlibResult {
        self.released = true;
        match self.device.deallocate(&self.region) {
            Ok(()) => Ok(()),
            Err(_) => Err(FlibError::DeallocFailed),
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if !self.released && self.device.deallocate(&self.region).is_err() {
            error!("buffer {}: deallocate failed", self.id);
        }
    }
}

impl fmt::Display for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start address = {:p}, physical size = {} MiB, mapping size = {} MiB, \
             num SG entries = {}, max desc entries = {}",
            self.region.base.as_ptr(),
            self.region.physical_size >> 20,
            self.region.mapping_size >> 20,
            self.num_sg_entries(),
            self.max_desc_entries()
        )
    }
}
