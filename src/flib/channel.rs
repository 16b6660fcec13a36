//! Configuration of the per-channel descriptor-manager engines.

use core::time::Duration;

use log::debug;

use crate::flib::buffer::DmaBuffer;
use crate::flib::constants::*;
use crate::flib::err::{FlibError, FlibResult};
use crate::flib::regs::{DmaCtrl, FlibReg};

/// Number of 100 us polls before a shutdown busy-wait gives up (about 1 s).
const DMA_IDLE_RETRIES: usize = 10_000;

/// One link's DMA engine pair: the event-buffer and report-buffer descriptor
/// managers plus the shared DMA control word. Bound to the channel's
/// packetizer window.
pub struct DmaChannel {
    reg: FlibReg,
}

impl DmaChannel {
    pub(crate) fn new(reg: FlibReg) -> Self {
        Self { reg }
    }

    /// Programs the event buffer's scatter-gather list into the EBDM engine.
    pub fn prepare_eb(&self, buf: &DmaBuffer) -> FlibResult {
        self.program_sg(buf, REG_EBDM_N_SG_CONFIG, 0)
    }

    /// Programs the report buffer's scatter-gather list into the RBDM engine.
    pub fn prepare_rb(&self, buf: &DmaBuffer) -> FlibResult {
        self.program_sg(buf, REG_RBDM_N_SG_CONFIG, SGCTRL_TARGET_RBDM)
    }

    fn program_sg(&self, buf: &DmaBuffer, n_sg_reg: u32, target: u32) -> FlibResult {
        let entries = buf.sg();
        if entries.is_empty() || entries.len() > SGDM_MAX_ENTRIES {
            return Err(FlibError::InvalidArgument);
        }
        for (i, entry) in entries.iter().enumerate() {
            self.reg.write_32(REG_SGENTRY_ADDR_LOW, entry.addr as u32);
            self.reg.write_32(REG_SGENTRY_ADDR_HIGH, (entry.addr >> 32) as u32);
            self.reg.write_32(REG_SGENTRY_LEN, entry.len as u32);
            self.reg
                .write_32(REG_SGENTRY_CTRL, SGCTRL_WRITE_ENABLE | target | i as u32);
        }
        self.reg.write_32(n_sg_reg, entries.len() as u32);
        debug!("programmed {} SG entries for buffer {}", entries.len(), buf.id());
        Ok(())
    }

    /// Writes both ring geometries and the payload limit.
    pub fn configure(
        &self,
        event_buf: &DmaBuffer,
        desc_buf: &DmaBuffer,
        max_payload_words: u32,
    ) -> FlibResult {
        if max_payload_words == 0 || max_payload_words > MAX_PAYLOAD_WORDS {
            return Err(FlibError::InvalidArgument);
        }
        self.reg.write_64(
            REG_EBDM_BUFFER_SIZE_L,
            REG_EBDM_BUFFER_SIZE_H,
            event_buf.physical_size() as u64,
        );
        self.reg.write_64(
            REG_RBDM_BUFFER_SIZE_L,
            REG_RBDM_BUFFER_SIZE_H,
            desc_buf.physical_size() as u64,
        );
        self.reg.modify_reg(|old: DmaCtrl| {
            (old & !DmaCtrl::PAYLOAD_MASK) | DmaCtrl::max_payload_set(max_payload_words)
        });
        Ok(())
    }

    pub fn set_enable_eb(&self, enable: bool) {
        if enable {
            self.reg.set_reg(DmaCtrl::EBDM_ENABLE);
        } else {
            self.reg.clear_reg(DmaCtrl::EBDM_ENABLE);
        }
    }

    pub fn set_enable_rb(&self, enable: bool) {
        if enable {
            self.reg.set_reg(DmaCtrl::RBDM_ENABLE);
        } else {
            self.reg.clear_reg(DmaCtrl::RBDM_ENABLE);
        }
    }

    /// Raw write of the DMA control word.
    pub fn set_dma_config(&self, mask: u32) {
        self.reg.write_32(REG_DMA_CTRL, mask);
    }

    pub fn dma_config(&self) -> u32 {
        self.reg.read_32(REG_DMA_CTRL)
    }

    pub fn dma_busy(&self) -> bool {
        self.reg.read_reg::<DmaCtrl>().contains(DmaCtrl::BUSY)
    }

    /// Bounded poll until pending transfers drain.
    pub fn wait_dma_idle(&self) -> FlibResult {
        self.reg.wait_for(
            |reg: DmaCtrl| !reg.contains(DmaCtrl::BUSY),
            Duration::from_micros(100),
            Some(DMA_IDLE_RETRIES),
        )
    }

    /// Publishes both software read pointers, advancing the hardware's
    /// reclaim window. The control-word read back flushes the posted writes
    /// before the caller polls for reclaimed slots.
    pub fn set_offsets(&self, eb_offset: u64, rb_offset: u64) {
        self.reg.write_64(
            REG_EBDM_SW_READ_POINTER_L,
            REG_EBDM_SW_READ_POINTER_H,
            eb_offset,
        );
        self.reg.write_64(
            REG_RBDM_SW_READ_POINTER_L,
            REG_RBDM_SW_READ_POINTER_H,
            rb_offset,
        );
        let _ = self.reg.read_32(REG_DMA_CTRL);
    }

    pub fn eb_offset(&self) -> u64 {
        self.reg
            .read_64(REG_EBDM_SW_READ_POINTER_L, REG_EBDM_SW_READ_POINTER_H)
    }

    pub fn rb_offset(&self) -> u64 {
        self.reg
            .read_64(REG_RBDM_SW_READ_POINTER_L, REG_RBDM_SW_READ_POINTER_H)
    }

    /// FPGA-side event buffer write pointer.
    pub fn eb_fpga_write_pointer(&self) -> u64 {
        self.reg.read_64_stable(
            REG_EBDM_FPGA_WRITE_POINTER_L,
            REG_EBDM_FPGA_WRITE_POINTER_H,
        )
    }

    /// FPGA-side report buffer write pointer.
    pub fn rb_fpga_write_pointer(&self) -> u64 {
        self.reg.read_64_stable(
            REG_RBDM_FPGA_WRITE_POINTER_L,
            REG_RBDM_FPGA_WRITE_POINTER_H,
        )
    }

    /// Total number of descriptors the channel has delivered.
    pub fn desc_count(&self) -> u64 {
        self.reg.read_64_stable(REG_DESC_CNT_L, REG_DESC_CNT_H)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlib;
    use alloc::sync::Arc;
    use crate::pci::PciDevice;

    fn setup() -> (Arc<SimFlib>, DmaChannel, DmaBuffer, DmaBuffer) {
        let sim = SimFlib::new(1);
        let dev: Arc<dyn PciDevice> = sim.clone();
        let ebuf = DmaBuffer::create(dev.clone(), 0, 20).unwrap();
        let dbuf = DmaBuffer::create(dev, 1, 15).unwrap();
        let ch = DmaChannel::new(sim.pkt_window(0));
        (sim, ch, ebuf, dbuf)
    }

    #[test]
    fn configure_writes_ring_geometry() {
        let (sim, ch, ebuf, dbuf) = setup();
        ch.configure(&ebuf, &dbuf, MAX_PAYLOAD_WORDS).unwrap();

        assert_eq!(sim.pkt_reg(0, REG_EBDM_BUFFER_SIZE_L), 1 << 20);
        assert_eq!(sim.pkt_reg(0, REG_EBDM_BUFFER_SIZE_H), 0);
        assert_eq!(sim.pkt_reg(0, REG_RBDM_BUFFER_SIZE_L), 1 << 15);
        assert_eq!(
            DmaCtrl::max_payload_get(sim.pkt_reg(0, REG_DMA_CTRL)),
            MAX_PAYLOAD_WORDS
        );
    }

    #[test]
    fn configure_rejects_oversized_payload() {
        let (_sim, ch, ebuf, dbuf) = setup();
        assert_eq!(
            ch.configure(&ebuf, &dbuf, MAX_PAYLOAD_WORDS + 1),
            Err(FlibError::InvalidArgument)
        );
    }

    #[test]
    fn sg_programming_commits_each_entry() {
        let (sim, ch, ebuf, dbuf) = setup();
        ch.prepare_eb(&ebuf).unwrap();
        assert_eq!(sim.pkt_reg(0, REG_EBDM_N_SG_CONFIG), 1);
        assert_eq!(
            sim.pkt_reg(0, REG_SGENTRY_CTRL) & SGCTRL_WRITE_ENABLE,
            SGCTRL_WRITE_ENABLE
        );
        ch.prepare_rb(&dbuf).unwrap();
        assert_eq!(sim.pkt_reg(0, REG_RBDM_N_SG_CONFIG), 1);
        assert_eq!(
            sim.pkt_reg(0, REG_SGENTRY_CTRL) & SGCTRL_TARGET_RBDM,
            SGCTRL_TARGET_RBDM
        );
    }

    #[test]
    fn offsets_publish_to_both_pointer_pairs() {
        let (sim, ch, _ebuf, _dbuf) = setup();
        ch.set_offsets(0x1_0000_0040, 32);
        assert_eq!(sim.pkt_reg(0, REG_EBDM_SW_READ_POINTER_L), 0x40);
        assert_eq!(sim.pkt_reg(0, REG_EBDM_SW_READ_POINTER_H), 1);
        assert_eq!(sim.pkt_reg(0, REG_RBDM_SW_READ_POINTER_L), 32);
        assert_eq!(ch.eb_offset(), 0x1_0000_0040);
        assert_eq!(ch.rb_offset(), 32);
    }

    #[test]
    fn enable_bits_are_independent() {
        let (sim, ch, _ebuf, _dbuf) = setup();
        ch.set_enable_eb(true);
        ch.set_enable_rb(true);
        let ctrl = DmaCtrl::from_bits_retain(sim.pkt_reg(0, REG_DMA_CTRL));
        assert!(ctrl.contains(DmaCtrl::EBDM_ENABLE | DmaCtrl::RBDM_ENABLE));
        ch.set_enable_eb(false);
        let ctrl = DmaCtrl::from_bits_retain(sim.pkt_reg(0, REG_DMA_CTRL));
        assert!(!ctrl.contains(DmaCtrl::EBDM_ENABLE));
        assert!(ctrl.contains(DmaCtrl::RBDM_ENABLE));
    }
}
