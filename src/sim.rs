//! Simulated register-and-buffer backend for the unit tests.
//!
//! The register window and the DMA buffers are plain zeroed host memory; the
//! tests play the FPGA by writing registers and descriptor slots directly.

use alloc::{alloc as heap, collections::BTreeMap, sync::Arc, vec::Vec};
use core::alloc::Layout;
use core::ptr::NonNull;

use spin::Mutex;

use crate::flib::constants::*;
use crate::flib::MicrosliceDescriptor;
use crate::flib::regs::FlibReg;
use crate::pci::{BufferId, DmaDirection, DmaRegion, PciDevice, PciError, SgEntry};

/// A raw page-aligned allocation handed out by pointer only.
struct RawMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for RawMem {}
unsafe impl Sync for RawMem {}

impl RawMem {
    fn new_zeroed(size: usize) -> Self {
        let layout = match Layout::from_size_align(size, 4096) {
            Ok(l) => l,
            Err(_) => panic!("bad layout"),
        };
        let raw = unsafe { heap::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => heap::handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }
}

impl Drop for RawMem {
    fn drop(&mut self) {
        unsafe { heap::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct SimBuffer {
    mem: RawMem,
    size: usize,
}

/// Fake FLIB board: one BAR-sized register window plus a persistent buffer
/// store keyed by id. Buffers survive `deallocate`, matching an allocator
/// that keeps pinned regions alive until explicitly freed out of band.
pub(crate) struct SimFlib {
    bar: RawMem,
    buffers: Mutex<BTreeMap<BufferId, SimBuffer>>,
    alloc_limit: Mutex<usize>,
}

impl SimFlib {
    pub(crate) fn new(n_links: usize) -> Arc<Self> {
        // size for the maximum link count so capping tests stay in bounds
        let words = (MAX_HW_LINKS + 1) * CHANNEL_OFFSET as usize;
        let sim = Self {
            bar: RawMem::new_zeroed(words * 4),
            buffers: Mutex::new(BTreeMap::new()),
            alloc_limit: Mutex::new(usize::MAX),
        };
        sim.set_global_reg(REG_N_CHANNELS, n_links as u32);
        sim.set_global_reg(REG_HARDWARE_INFO, 26);
        Arc::new(sim)
    }

    /// Makes allocations above `bytes` fail with `AllocFailed`.
    pub(crate) fn set_alloc_limit(&self, bytes: usize) {
        *self.alloc_limit.lock() = bytes;
    }

    fn reg_ptr(&self, word: u32) -> *mut u32 {
        unsafe { (self.bar.ptr.as_ptr() as *mut u32).add(word as usize) }
    }

    pub(crate) fn global_reg(&self, word: u32) -> u32 {
        unsafe { self.reg_ptr(word).read_volatile() }
    }

    pub(crate) fn set_global_reg(&self, word: u32, val: u32) {
        unsafe { self.reg_ptr(word).write_volatile(val) }
    }

    fn pkt_base(link: usize) -> u32 {
        (link as u32 + 1) * CHANNEL_OFFSET
    }

    fn gtx_base(link: usize) -> u32 {
        Self::pkt_base(link) + (1 << GTX_WINDOW_SHIFT)
    }

    pub(crate) fn pkt_reg(&self, link: usize, word: u32) -> u32 {
        self.global_reg(Self::pkt_base(link) + word)
    }

    pub(crate) fn set_pkt_reg(&self, link: usize, word: u32, val: u32) {
        self.set_global_reg(Self::pkt_base(link) + word, val)
    }

    pub(crate) fn gtx_reg(&self, link: usize, word: u32) -> u32 {
        self.global_reg(Self::gtx_base(link) + word)
    }

    pub(crate) fn set_gtx_reg(&self, link: usize, word: u32, val: u32) {
        self.set_global_reg(Self::gtx_base(link) + word, val)
    }

    /// Accessor bound to a link's packetizer window, as the driver sees it.
    pub(crate) fn pkt_window(&self, link: usize) -> FlibReg {
        FlibReg::new(self.bar.ptr).window(Self::pkt_base(link))
    }

    /// Base pointer of the buffer registered under `id`.
    pub(crate) fn buffer_base(&self, id: BufferId) -> NonNull<u8> {
        let buffers = self.buffers.lock();
        match buffers.get(&id) {
            Some(buf) => buf.mem.ptr,
            None => panic!("no buffer {id}"),
        }
    }

    /// Plays the FPGA: stores a descriptor into a report buffer slot,
    /// body first, `idx` last.
    pub(crate) fn publish_descriptor(
        &self,
        db_id: BufferId,
        slot: usize,
        desc: &MicrosliceDescriptor,
    ) {
        let base = self.buffer_base(db_id);
        let bytes = bytemuck::bytes_of(desc);
        unsafe {
            let dst = base.as_ptr().add(slot * MC_DESC_SIZE);
            // body without idx
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, 8);
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(16), dst.add(16), 16);
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
            (dst.add(8) as *mut u64).write_volatile(desc.idx);
        }
    }
}

impl PciDevice for SimFlib {
    fn bar(&self) -> NonNull<u8> {
        self.bar.ptr
    }

    fn allocate(
        &self,
        id: BufferId,
        size: usize,
        sg_list_count: usize,
        _dir: DmaDirection,
    ) -> Result<DmaRegion, PciError> {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(&id) {
            return Err(PciError::AlreadyExists);
        }
        if size > *self.alloc_limit.lock() {
            return Err(PciError::AllocFailed);
        }
        let mem = RawMem::new_zeroed(size);
        let region = Self::region(&mem, size, sg_list_count.max(1));
        buffers.insert(id, SimBuffer { mem, size });
        Ok(region)
    }

    fn connect(&self, id: BufferId) -> Result<DmaRegion, PciError> {
        let buffers = self.buffers.lock();
        match buffers.get(&id) {
            Some(buf) => Ok(Self::region(&buf.mem, buf.size, 1)),
            None => Err(PciError::NotFound),
        }
    }

    fn deallocate(&self, _region: &DmaRegion) -> Result<(), PciError> {
        // pinned regions persist under their id until freed out of band
        Ok(())
    }
}

impl SimFlib {
    fn region(mem: &RawMem, size: usize, sg_count: usize) -> DmaRegion {
        let chunk = size / sg_count;
        let mut sg = Vec::new();
        for i in 0..sg_count {
            sg.push(SgEntry {
                addr: mem.ptr.as_ptr() as u64 + (i * chunk) as u64,
                len: chunk as u64,
            });
        }
        DmaRegion {
            base: mem.ptr,
            physical_size: size,
            mapping_size: size,
            sg,
        }
    }
}
