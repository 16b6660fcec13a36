//! Per-link state and the microslice consume/acknowledge protocol.

use alloc::sync::Arc;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{Ordering, fence};

use log::{debug, error, info, warn};

use crate::flib::buffer::DmaBuffer;
use crate::flib::channel::DmaChannel;
use crate::flib::constants::*;
use crate::flib::desc::{CtrlMsg, HdrConfig, MicrosliceDescriptor};
use crate::flib::err::{FlibError, FlibResult};
use crate::flib::regs::*;
use crate::pci::{BufferId, PciDevice};

/// How a link obtains its DMA buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    CreateOnly,
    OpenOnly,
    OpenOrCreate,
}

/// Data source feeding a link's packetizer, encoded into `DATAPATH_CFG[1:0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Disable,
    Emu,
    Link,
    Pgen,
}

impl DataSource {
    fn encoding(self) -> u32 {
        match self {
            DataSource::Disable => 0b00,
            DataSource::Emu => 0b01,
            DataSource::Link => 0b10,
            DataSource::Pgen => 0b11,
        }
    }

    fn from_encoding(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => DataSource::Disable,
            0b01 => DataSource::Emu,
            0b10 => DataSource::Link,
            _ => DataSource::Pgen,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataSource::Disable => "disable",
            DataSource::Emu => "emu",
            DataSource::Link => "link",
            DataSource::Pgen => "pgen",
        };
        f.write_str(name)
    }
}

/// Handle to one published microslice.
///
/// `payload` points into the event buffer and stays valid until the slice is
/// acknowledged; the descriptor is a copy, not a reference into the ring.
#[derive(Debug, Clone, Copy)]
pub struct Microslice {
    /// Microslice index, counting from 1
    pub nr: u64,
    /// Start of the payload in the event buffer
    pub payload: NonNull<u8>,
    /// Payload size in bytes
    pub size: u32,
    /// Copy of the descriptor slot
    pub desc: MicrosliceDescriptor,
}

/// Snapshot of the GTX link status register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub channel_up: bool,
    pub hard_err: bool,
    pub soft_err: bool,
    pub eoe_fifo_overflow: bool,
    pub d_fifo_overflow: bool,
    pub d_fifo_max_words: u32,
}

/// Per-link performance counters, latched by hardware at the interval
/// boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkPerf {
    pub pkt_cycle_cnt: u64,
    pub dma_stall: u64,
    pub data_buf_stall: u64,
    pub desc_buf_stall: u64,
    pub events: u64,
    pub gtx_cycle_cnt: u64,
    pub din_full_gtx: u64,
}

/// One FLIB link: data path configuration, the DMA ring pair and the CBMnet
/// control interfaces.
pub struct FlibLink {
    link_index: usize,
    device: Arc<dyn PciDevice>,
    ch: DmaChannel,
    pkt: FlibReg,
    gtx: FlibReg,
    ebuf: Option<DmaBuffer>,
    dbuf: Option<DmaBuffer>,

    index: u64,
    last_index: u64,
    last_acked: u64,
    mc_nr: u64,
    wrap: u64,
    slot_count: u64,
    log_ebufsize: u32,
    log_dbufsize: u32,
    dma_initialized: bool,
    unacked: bool,
}

impl FlibLink {
    pub(crate) fn new(link_index: usize, device: Arc<dyn PciDevice>, bus: &FlibReg) -> Self {
        let base = (link_index as u32 + 1) * CHANNEL_OFFSET;
        let pkt = bus.window(base);
        let gtx = bus.window(base + (1 << GTX_WINDOW_SHIFT));
        let ch = DmaChannel::new(pkt.clone());
        Self {
            link_index,
            device,
            ch,
            pkt,
            gtx,
            ebuf: None,
            dbuf: None,
            index: 0,
            last_index: 0,
            last_acked: 0,
            mc_nr: 0,
            wrap: 0,
            slot_count: 0,
            log_ebufsize: 0,
            log_dbufsize: 0,
            dma_initialized: false,
            unacked: false,
        }
    }

    pub fn link_index(&self) -> usize {
        self.link_index
    }

    /// Sets up the ring pair and brings the channel into delivering state.
    ///
    /// Buffer ids are derived from the link index so that open-or-create
    /// reattaches to the same rings across processes.
    pub fn init_dma(
        &mut self,
        mode: BufferMode,
        log_ebufsize: u32,
        log_dbufsize: u32,
    ) -> FlibResult {
        // the report buffer is sliced into 32-byte slots
        if log_dbufsize < MC_DESC_SIZE.trailing_zeros() {
            return Err(FlibError::InvalidArgument);
        }
        self.log_ebufsize = log_ebufsize;
        self.log_dbufsize = log_dbufsize;

        let eb_id = 2 * self.link_index as BufferId;
        let db_id = eb_id + 1;
        let (ebuf, dbuf) = match mode {
            BufferMode::CreateOnly => (
                DmaBuffer::create(self.device.clone(), eb_id, log_ebufsize)?,
                DmaBuffer::create(self.device.clone(), db_id, log_dbufsize)?,
            ),
            BufferMode::OpenOnly => (
                DmaBuffer::open(self.device.clone(), eb_id)?,
                DmaBuffer::open(self.device.clone(), db_id)?,
            ),
            BufferMode::OpenOrCreate => (
                DmaBuffer::open_or_create(self.device.clone(), eb_id, log_ebufsize)?,
                DmaBuffer::open_or_create(self.device.clone(), db_id, log_dbufsize)?,
            ),
        };
        self.ebuf = Some(ebuf);
        self.dbuf = Some(dbuf);

        self.init_hardware()?;

        self.index = 0;
        self.last_index = 0;
        self.last_acked = 0;
        self.mc_nr = 0;
        self.wrap = 0;
        self.unacked = false;
        self.dma_initialized = true;
        info!(
            "link {}: DMA initialized, {} descriptor slots",
            self.link_index, self.slot_count
        );
        Ok(())
    }

    fn init_hardware(&mut self) -> FlibResult {
        let (ebuf, dbuf) = match (&self.ebuf, &self.dbuf) {
            (Some(e), Some(d)) => (e, d),
            _ => return Err(FlibError::InvalidState),
        };

        // disable packer if still enabled
        self.enable_packer(false);
        // reset everything to ensure clean startup
        self.rst_channel();
        self.set_start_index(1);

        self.ch.prepare_eb(ebuf)?;
        self.ch.prepare_rb(dbuf)?;
        self.ch.configure(ebuf, dbuf, MAX_PAYLOAD_WORDS)?;

        // the consumer polls on idx, both rings must start out zeroed
        ebuf.zero();
        dbuf.zero();
        fence(Ordering::Release);

        self.slot_count = dbuf.max_desc_entries();

        self.ch.set_enable_eb(true);
        self.ch.set_enable_rb(true);
        self.ch
            .set_dma_config(self.ch.dma_config() | DmaCtrl::DMA_ENABLE.bits());
        Ok(())
    }

    fn rst_channel(&self) {
        // datapath reset also zeroes the pending microslice counter
        self.gtx.set_reg(DatapathCfg::RESET);
        self.ch.set_dma_config(DmaCtrl::FIFO_RESET.bits());
        self.gtx.clear_reg(DatapathCfg::RESET);
    }

    /// Polls the report buffer for the next published microslice.
    ///
    /// Returns `Ok(None)` when nothing new is available; in that case no
    /// cursor state is touched. A fresh descriptor with an impossible header
    /// is [`FlibError::Fatal`].
    pub fn try_next(&mut self) -> FlibResult<Option<Microslice>> {
        let (eb_base, db_base) = match (&self.ebuf, &self.dbuf) {
            (Some(e), Some(d)) => (e.base(), d.base()),
            _ => return Err(FlibError::InvalidState),
        };

        let slot =
            unsafe { (db_base.as_ptr() as *const MicrosliceDescriptor).add(self.index as usize) };
        // hardware publishes a slot by writing idx; a volatile load of the
        // whole descriptor follows once the edge is seen
        let idx = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).idx)) };
        if idx <= self.mc_nr {
            return Ok(None);
        }
        fence(Ordering::Acquire);
        let desc = unsafe { ptr::read_volatile(slot) };
        if desc.idx != idx {
            // torn publish, retry on the next poll
            return Ok(None);
        }
        if !desc.header_valid() {
            error!(
                "link {}: corrupt descriptor in slot {}: hdr {:#04x} ver {:#04x}",
                self.link_index, self.index, desc.hdr_id, desc.hdr_ver
            );
            return Err(FlibError::Fatal);
        }

        self.mc_nr = desc.idx;
        let offset = (desc.offset & ((1u64 << self.log_ebufsize) - 1)) as usize;
        let payload = unsafe { NonNull::new_unchecked(eb_base.as_ptr().add(offset)) };
        let mc = Microslice {
            nr: self.mc_nr,
            payload,
            size: desc.size,
            desc,
        };

        self.last_index = self.index;
        if self.index < self.slot_count - 1 {
            self.index += 1;
        } else {
            self.wrap += 1;
            self.index = 0;
        }
        self.unacked = true;
        Ok(Some(mc))
    }

    /// Acknowledges everything up to and including the last returned
    /// microslice, allowing the hardware to reclaim those ring slots.
    ///
    /// May be batched. Refused unless a consumption happened since the last
    /// acknowledgement.
    pub fn ack(&mut self) -> FlibResult {
        if !self.unacked {
            return Err(FlibError::InvalidState);
        }
        let db_base = match &self.dbuf {
            Some(d) => d.base(),
            None => return Err(FlibError::InvalidState),
        };

        let slot = unsafe {
            (db_base.as_ptr() as *const MicrosliceDescriptor).add(self.last_index as usize)
        };
        let offset = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).offset)) };
        let eb_offset = offset & ((1u64 << self.log_ebufsize) - 1);
        // the descriptor pointer moves one past the acknowledged slot, each
        // slot is 32 bytes
        let rb_offset =
            ((self.last_index + 1) * MC_DESC_SIZE as u64) & ((1u64 << self.log_dbufsize) - 1);

        self.ch.set_offsets(eb_offset, rb_offset);
        self.last_acked = self.last_index;
        self.unacked = false;
        debug!(
            "link {}: acked slot {} (eb {:#x} rb {:#x}), wrap {}",
            self.link_index, self.last_acked, eb_offset, rb_offset, self.wrap
        );
        Ok(())
    }

    /// Programs the microslice index the packer starts counting from.
    pub fn set_start_index(&self, index: u64) {
        self.gtx
            .write_64(REG_GTX_MC_GEN_CFG_IDX_L, REG_GTX_MC_GEN_CFG_IDX_H, index);
        self.gtx.pulse_reg(McGenCfg::SET_START_INDEX);
    }

    /// Drops microslices the packer has queued but not yet delivered. Also
    /// implied by a datapath reset.
    pub fn rst_pending_mc(&self) {
        self.gtx.pulse_reg(McGenCfg::RST_PENDING_MC);
    }

    pub fn enable_packer(&self, enable: bool) {
        if enable {
            self.gtx.set_reg(McGenCfg::PACKER_ENABLE);
        } else {
            self.gtx.clear_reg(McGenCfg::PACKER_ENABLE);
        }
    }

    /// Microslices queued in hardware but not yet written to the host.
    pub fn pending_mc(&self) -> u64 {
        self.gtx
            .read_64_stable(REG_GTX_PENDING_MC_L, REG_GTX_PENDING_MC_H)
    }

    /// Index of the most recent microslice cut by the packer.
    pub fn mc_index(&self) -> u64 {
        self.gtx
            .read_64_stable(REG_GTX_MC_INDEX_L, REG_GTX_MC_INDEX_H)
    }

    /// Selects the data source. Downstream buffers may contain a partial
    /// microslice at the switch boundary, reset after switching.
    pub fn set_data_source(&self, sel: DataSource) {
        self.gtx.modify_reg(|old: DatapathCfg| {
            DatapathCfg::from_bits_retain((old.bits() & !0b11) | sel.encoding())
        });
    }

    pub fn data_source(&self) -> DataSource {
        DataSource::from_encoding(self.gtx.read_32(REG_GTX_DATAPATH_CFG))
    }

    /// Writes the header template applied to pattern-generated microslices.
    pub fn set_hdr_config(&self, config: &HdrConfig) {
        let word: u32 = bytemuck::cast(*config);
        self.gtx.write_block(REG_GTX_MC_GEN_CFG_HDR, &[word]);
    }

    /// Sends a CBMnet control message. Fails fast with
    /// [`FlibError::HardwareNotReady`] while the send FSM is busy.
    pub fn send_dcm(&self, msg: &CtrlMsg) -> FlibResult {
        if msg.words < DCM_WORDS_MIN || msg.words > DCM_WORDS_MAX {
            return Err(FlibError::InvalidArgument);
        }
        if self.gtx.read_reg::<CtrlTx>().contains(CtrlTx::BUSY) {
            return Err(FlibError::HardwareNotReady);
        }

        let dwords = (msg.words as usize * 2).next_multiple_of(4) / 4;
        let mut mem = [0u32; DCM_WORDS_MAX as usize / 2];
        for (i, word) in mem.iter_mut().take(dwords).enumerate() {
            *word = msg.data[2 * i] as u32 | (msg.data[2 * i + 1] as u32) << 16;
        }
        self.gtx.write_block(MEM_BASE_CTRL_TX, &mem[..dwords]);
        self.gtx.write_reg(CtrlTx::send(msg.words));
        Ok(())
    }

    /// Receives a CBMnet control message into `msg`.
    ///
    /// [`FlibError::NoMessage`] when the mailbox is empty. A word count
    /// outside the wire limits clamps to the maximum and yields
    /// [`FlibError::Truncated`] with the best-effort payload in `msg`.
    pub fn recv_dcm(&self, msg: &mut CtrlMsg) -> FlibResult {
        let ctrl = self.gtx.read_32(REG_GTX_CTRL_RX);
        if ctrl & CtrlRx::VALID.bits() == 0 {
            return Err(FlibError::NoMessage);
        }

        let mut words = CtrlRx::words(ctrl);
        let truncated = !(DCM_WORDS_MIN..=DCM_WORDS_MAX).contains(&words);
        if truncated {
            words = DCM_WORDS_MAX;
        }

        let dwords = (words as usize * 2).next_multiple_of(4) / 4;
        let mut mem = [0u32; DCM_WORDS_MAX as usize / 2];
        self.gtx.read_block(MEM_BASE_CTRL_RX, &mut mem[..dwords]);
        for (i, word) in mem.iter().take(dwords).enumerate() {
            msg.data[2 * i] = *word as u16;
            msg.data[2 * i + 1] = (*word >> 16) as u16;
        }
        msg.words = words;

        // acknowledge
        self.gtx.write_32(REG_GTX_CTRL_RX, 0);

        if truncated {
            Err(FlibError::Truncated)
        } else {
            Ok(())
        }
    }

    /// Arms this link for the next device-wide DLM trigger. No other
    /// register access may happen between preparing and triggering.
    pub fn prepare_dlm(&self, dlm_type: u8, enable: bool) {
        self.gtx.write_reg(GtxDlm::prepare(dlm_type, enable));
    }

    /// Reads the received DLM type and clears the receive field.
    pub fn recv_dlm(&self) -> u8 {
        let dlm_type = GtxDlm::rx_type(self.gtx.read_32(REG_GTX_DLM));
        self.gtx.set_reg(GtxDlm::CLEAR_RX);
        dlm_type
    }

    pub fn link_status(&self) -> LinkStatus {
        let sts = self.gtx.read_reg::<LinkSts>();
        LinkStatus {
            channel_up: sts.contains(LinkSts::CHANNEL_UP),
            hard_err: sts.contains(LinkSts::HARD_ERR),
            soft_err: sts.contains(LinkSts::SOFT_ERR),
            eoe_fifo_overflow: sts.contains(LinkSts::EOE_FIFO_OVERFLOW),
            d_fifo_overflow: sts.contains(LinkSts::D_FIFO_OVERFLOW),
            d_fifo_max_words: LinkSts::d_fifo_max_words(sts.bits()),
        }
    }

    pub fn link_perf(&self) -> LinkPerf {
        LinkPerf {
            pkt_cycle_cnt: self.pkt.read_32(REG_PERF_CYCLE_CNT) as u64,
            dma_stall: self.pkt.read_32(REG_PERF_DMA_STALL) as u64,
            data_buf_stall: self.pkt.read_32(REG_PERF_EBUF_STALL) as u64,
            desc_buf_stall: self.pkt.read_32(REG_PERF_RBUF_STALL) as u64,
            events: self.pkt.read_32(REG_PERF_N_EVENTS) as u64,
            gtx_cycle_cnt: self.gtx.read_32(REG_GTX_PERF_CYCLE_CNT) as u64,
            din_full_gtx: self.gtx.read_32(REG_GTX_PERF_PKT_AFULL) as u64,
        }
    }

    /// Sets the performance measurement interval for this link's counters.
    pub fn set_perf_interval(&self, ms: u32) {
        let cycles = perf_interval_cycles(ms);
        self.pkt.write_32(REG_PERF_INTERVAL, cycles);
        self.gtx.write_32(REG_GTX_PERF_INTERVAL, cycles);
    }

    pub fn channel(&self) -> &DmaChannel {
        &self.ch
    }

    pub fn ebuf(&self) -> Option<&DmaBuffer> {
        self.ebuf.as_ref()
    }

    pub fn dbuf(&self) -> Option<&DmaBuffer> {
        self.dbuf.as_ref()
    }

    /// Next report buffer slot to inspect.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Slot of the most recently returned descriptor.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Slot most recently acknowledged to the hardware.
    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    /// Highest microslice index returned so far.
    pub fn mc_nr(&self) -> u64 {
        self.mc_nr
    }

    /// Number of report buffer wrap-arounds.
    pub fn wrap(&self) -> u64 {
        self.wrap
    }

    pub(crate) fn stop(&mut self) {
        if !self.dma_initialized {
            return;
        }
        self.enable_packer(false);
        self.ch.set_enable_eb(false);
        // wait for pending transfers to complete
        if self.ch.wait_dma_idle().is_err() {
            warn!(
                "link {}: DMA busy past shutdown deadline, forcing reset",
                self.link_index
            );
        }
        self.ch.set_enable_rb(false);
        self.rst_channel();
        self.dma_initialized = false;
    }

    /// Immediate best-effort halt without draining, used on fatal errors.
    pub(crate) fn halt(&mut self) {
        self.enable_packer(false);
        self.ch.set_dma_config(0);
        self.rst_channel();
        self.dma_initialized = false;
    }

    /// Stops the channel and releases both buffers, surfacing deallocation
    /// failures.
    pub fn shutdown(&mut self) -> FlibResult {
        self.stop();
        let mut result = Ok(());
        if let Some(buf) = self.ebuf.take() {
            if buf.deallocate().is_err() {
                result = Err(FlibError::DeallocFailed);
            }
        }
        if let Some(buf) = self.dbuf.take() {
            if buf.deallocate().is_err() {
                result = Err(FlibError::DeallocFailed);
            }
        }
        result
    }
}

impl Drop for FlibLink {
    fn drop(&mut self) {
        self.stop();
    }
}
