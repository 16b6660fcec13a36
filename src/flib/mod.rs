//! FLIB device core.
//!
//! A [`FlibDevice`] owns one [`FlibLink`] per hardware link. Configuration
//! flows top-down (device, link, channel, register bank); data flows through
//! the DMA ring pair each link polices against the FPGA.

pub mod constants;
pub mod err;
pub mod regs;

mod buffer;
mod channel;
mod desc;
mod link;

pub use buffer::*;
pub use channel::*;
pub use desc::*;
pub use err::*;
pub use link::*;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use log::info;
use spin::Mutex;

use crate::pci::{DeviceOperator, PciDevice};
use crate::regs::*;
use constants::*;
use regs::FlibReg;

/// Identity of the FPGA build running on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub hardware_version: u32,
    pub build_date: u64,
    pub revision: [u32; 5],
    pub flags: u32,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hw version {} rev {:08x}{:08x}{:08x}{:08x}{:08x} date {}",
            self.hardware_version,
            self.revision[4],
            self.revision[3],
            self.revision[2],
            self.revision[1],
            self.revision[0],
            self.build_date
        )
    }
}

/// Snapshot of the DMA mux fill-state counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaPerfData {
    /// Cycles spent at 1/8 .. 8/8 FIFO fill
    pub fifo_fill: [u64; 8],
    pub cycle_cnt: u64,
    /// Mux overflow events
    pub overflow: u64,
}

/// One FLIB board.
pub struct FlibDevice {
    device: Arc<dyn PciDevice>,
    bus: FlibReg,
    links: Vec<FlibLink>,
    dlm_token: Mutex<()>,
}

impl FlibDevice {
    /// Binds to an enumerated device and builds one controller per hardware
    /// link.
    pub fn new(device: Arc<dyn PciDevice>) -> FlibResult<Self> {
        let bus = FlibReg::new(device.bar());
        let num_links = (bus.read_32(REG_N_CHANNELS) as usize).min(MAX_HW_LINKS);
        let links = (0..num_links)
            .map(|i| FlibLink::new(i, device.clone(), &bus))
            .collect();
        let flib = Self {
            device,
            bus,
            links,
            dlm_token: Mutex::new(()),
        };
        info!("FLIB: {}, {} links", flib.build_info(), num_links);
        Ok(flib)
    }

    /// Opens the `index`-th device of the enumeration table.
    pub fn open(operator: &dyn DeviceOperator, index: u64) -> FlibResult<Self> {
        let device = operator.open_device(index)?;
        Self::new(device)
    }

    pub fn pci_device(&self) -> &Arc<dyn PciDevice> {
        &self.device
    }

    /// Number of links instantiated in this hardware build.
    pub fn number_of_hw_links(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> &[FlibLink] {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut [FlibLink] {
        &mut self.links
    }

    pub fn link(&mut self, index: usize) -> Option<&mut FlibLink> {
        self.links.get_mut(index)
    }

    pub fn hardware_version(&self) -> u32 {
        self.bus.read_32(REG_HARDWARE_INFO)
    }

    pub fn build_info(&self) -> BuildInfo {
        let mut revision = [0u32; 5];
        self.bus.read_block(REG_BUILD_REV_0, &mut revision);
        BuildInfo {
            hardware_version: self.hardware_version(),
            build_date: self.bus.read_64(REG_BUILD_DATE_L, REG_BUILD_DATE_H),
            revision,
            flags: self.bus.read_32(REG_BUILD_FLAGS),
        }
    }

    /// Cycles the PCIe interface spent back-pressured by the host in the
    /// last interval.
    pub fn get_pci_stall(&self) -> u32 {
        self.bus.read_32(REG_PERF_PCI_NRDY)
    }

    /// Cycles the PCIe interface spent transmitting in the last interval.
    pub fn get_pci_trans(&self) -> u32 {
        self.bus.read_32(REG_PERF_PCI_TRANS)
    }

    /// Longest single PCIe stall of the last interval, in microseconds.
    pub fn get_pci_max_stall(&self) -> f32 {
        self.bus.read_32(REG_PERF_PCI_MAX_NRDY) as f32 / (PKT_CLK_HZ / 1_000_000) as f32
    }

    /// Snapshot of the DMA mux fill-state histogram. Reading latches the
    /// next window, the first read after an interval change is a dummy.
    pub fn get_dma_perf(&self) -> DmaPerfData {
        let mut fill = [0u32; 8];
        self.bus.read_block(REG_PERF_DMA_FIFO_FILL, &mut fill);
        let mut fifo_fill = [0u64; 8];
        for (acc, raw) in fifo_fill.iter_mut().zip(fill.iter()) {
            *acc = *raw as u64;
        }
        DmaPerfData {
            fifo_fill,
            cycle_cnt: self.bus.read_32(REG_PERF_DMA_CYCLE_CNT) as u64,
            overflow: self.bus.read_32(REG_PERF_DMA_OVERFLOW) as u64,
        }
    }

    /// Sets the performance measurement interval at device scope and for
    /// every link.
    pub fn set_perf_interval(&self, ms: u32) {
        self.bus.write_32(REG_SYS_PERF_INT, perf_interval_cycles(ms));
        for link in &self.links {
            link.set_perf_interval(ms);
        }
    }

    /// Length of the measurement interval in packet clock cycles.
    pub fn get_perf_interval_cycles(&self) -> u32 {
        self.bus.read_32(REG_SYS_PERF_INT)
    }

    /// Triggers all links prepared via [`FlibLink::prepare_dlm`] to emit
    /// their DLM synchronously. The token serializes trigger use across the
    /// process.
    pub fn send_dlm(&self) {
        let _token = self.dlm_token.lock();
        self.bus.write_32(REG_DLM_CFG, 1);
    }

    /// Best-effort halt of all links after an impossible-invariant read:
    /// packers off, DMA off, channels reset.
    pub fn emergency_stop(&mut self) {
        for link in &mut self.links {
            link.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlib;

    fn device(links: usize) -> (Arc<SimFlib>, FlibDevice) {
        let sim = SimFlib::new(links);
        let dev = FlibDevice::new(sim.clone()).unwrap();
        (sim, dev)
    }

    #[test]
    fn link_count_follows_hardware_register() {
        let (_sim, dev) = device(2);
        assert_eq!(dev.number_of_hw_links(), 2);
    }

    #[test]
    fn link_count_is_capped() {
        let sim = SimFlib::new(2);
        sim.set_global_reg(REG_N_CHANNELS, 99);
        let dev = FlibDevice::new(sim).unwrap();
        assert_eq!(dev.number_of_hw_links(), MAX_HW_LINKS);
    }

    #[test]
    fn perf_interval_reaches_device_and_links() {
        let (sim, dev) = device(2);
        dev.set_perf_interval(1000);
        let cycles = perf_interval_cycles(1000);
        assert_eq!(cycles, 100_000_000);
        assert_eq!(dev.get_perf_interval_cycles(), cycles);
        assert_eq!(sim.pkt_reg(0, REG_PERF_INTERVAL), cycles);
        assert_eq!(sim.gtx_reg(1, REG_GTX_PERF_INTERVAL), cycles);
    }

    #[test]
    fn pci_counters_and_max_stall() {
        let (sim, dev) = device(1);
        sim.set_global_reg(REG_PERF_PCI_NRDY, 1000);
        sim.set_global_reg(REG_PERF_PCI_TRANS, 2000);
        sim.set_global_reg(REG_PERF_PCI_MAX_NRDY, 500);
        assert_eq!(dev.get_pci_stall(), 1000);
        assert_eq!(dev.get_pci_trans(), 2000);
        // 500 cycles at 100 MHz are 5 us
        assert_eq!(dev.get_pci_max_stall(), 5.0);
    }

    #[test]
    fn dma_perf_snapshot() {
        let (sim, dev) = device(1);
        for i in 0..8 {
            sim.set_global_reg(REG_PERF_DMA_FIFO_FILL + i, 100 * (i + 1));
        }
        sim.set_global_reg(REG_PERF_DMA_CYCLE_CNT, 4000);
        sim.set_global_reg(REG_PERF_DMA_OVERFLOW, 3);
        let perf = dev.get_dma_perf();
        assert_eq!(perf.fifo_fill[0], 100);
        assert_eq!(perf.fifo_fill[7], 800);
        assert_eq!(perf.cycle_cnt, 4000);
        assert_eq!(perf.overflow, 3);
    }

    #[test]
    fn dlm_broadcast_hits_prepared_links_only() {
        let (sim, dev) = device(3);
        dev.links()[0].prepare_dlm(5, true);
        dev.links()[2].prepare_dlm(5, true);
        dev.send_dlm();

        assert_eq!(sim.gtx_reg(0, REG_GTX_DLM), (1 << 4) | 5);
        assert_eq!(sim.gtx_reg(1, REG_GTX_DLM), 0);
        assert_eq!(sim.gtx_reg(2, REG_GTX_DLM), (1 << 4) | 5);
        assert_eq!(sim.global_reg(REG_DLM_CFG), 1);
    }

    #[test]
    fn recv_dlm_reads_type_and_clears() {
        let (sim, dev) = device(1);
        sim.set_gtx_reg(0, REG_GTX_DLM, 7 << 5);
        assert_eq!(dev.links()[0].recv_dlm(), 7);
        assert_ne!(sim.gtx_reg(0, REG_GTX_DLM) & (1 << 31), 0);
    }

    #[test]
    fn build_info_renders() {
        use alloc::format;
        let (sim, dev) = device(1);
        sim.set_global_reg(REG_HARDWARE_INFO, 26);
        let info = dev.build_info();
        assert_eq!(info.hardware_version, 26);
        assert!(format!("{info}").contains("hw version 26"));
    }
}
