//! FLIB register map and hardware constants.
//!
//! Word offsets into the BAR window, fixed by the FPGA build. The layout is
//! kept in sync with the register file of the firmware; do not edit offsets
//! by hand without a matching firmware change.

#![allow(missing_docs)]

/// Per-channel window stride. Channel `i` starts at `(i + 1) * CHANNEL_OFFSET`.
pub const CHANNEL_OFFSET: u32 = 0x8000;
/// The GTX sub-window of a channel starts at `base + (1 << GTX_WINDOW_SHIFT)`.
pub const GTX_WINDOW_SHIFT: u32 = 13;

/// Hard upper bound on links per board, fixed by the hardware variant.
pub const MAX_HW_LINKS: usize = 8;

/// PCIe packet clock in Hz. Cycle counters and the measurement interval are
/// clocked by this. May be off in case of spread-spectrum clocking.
pub const PKT_CLK_HZ: u32 = 100_000_000;

/// Microslice descriptor stride in bytes, hard coded in hardware.
pub const MC_DESC_SIZE: usize = 32;

/// Maximum DMA payload per transfer in 32-bit words.
pub const MAX_PAYLOAD_WORDS: u32 = 128;

/// CBMnet control message bounds in 16-bit words.
pub const DCM_WORDS_MIN: u32 = 4;
pub const DCM_WORDS_MAX: u32 = 32;

/// Scatter-gather table depth of each descriptor-manager engine.
pub const SGDM_MAX_ENTRIES: usize = 2048;

/* global device window */
pub const REG_HARDWARE_INFO: u32 = 0;
pub const REG_BUILD_FLAGS: u32 = 1;
pub const REG_N_CHANNELS: u32 = 2;
pub const REG_PCIE_CTRL: u32 = 7;
pub const REG_SYS_PERF_INT: u32 = 8;
pub const REG_DLM_CFG: u32 = 10;
pub const REG_BUILD_DATE_L: u32 = 13;
pub const REG_BUILD_DATE_H: u32 = 14;
pub const REG_BUILD_REV_0: u32 = 15;
pub const REG_BUILD_REV_1: u32 = 16;
pub const REG_BUILD_REV_2: u32 = 17;
pub const REG_BUILD_REV_3: u32 = 18;
pub const REG_BUILD_REV_4: u32 = 19;
pub const REG_PERF_PCI_NRDY: u32 = 28;
pub const REG_PERF_PCI_TRANS: u32 = 29;
pub const REG_PERF_PCI_MAX_NRDY: u32 = 30;
/* DMA mux fill-state block, 8 buckets plus cycle count and overflow */
pub const REG_PERF_DMA_FIFO_FILL: u32 = 32;
pub const REG_PERF_DMA_CYCLE_CNT: u32 = 40;
pub const REG_PERF_DMA_OVERFLOW: u32 = 41;

/* packetizer window, one per channel */
pub const REG_EBDM_N_SG_CONFIG: u32 = 0;
pub const REG_EBDM_BUFFER_SIZE_L: u32 = 1;
pub const REG_EBDM_BUFFER_SIZE_H: u32 = 2;
pub const REG_RBDM_N_SG_CONFIG: u32 = 3;
pub const REG_RBDM_BUFFER_SIZE_L: u32 = 4;
pub const REG_RBDM_BUFFER_SIZE_H: u32 = 5;
pub const REG_EBDM_SW_READ_POINTER_L: u32 = 6;
pub const REG_EBDM_SW_READ_POINTER_H: u32 = 7;
pub const REG_RBDM_SW_READ_POINTER_L: u32 = 8;
pub const REG_RBDM_SW_READ_POINTER_H: u32 = 9;
pub const REG_DMA_CTRL: u32 = 10;
pub const REG_PERF_N_EVENTS: u32 = 11;
pub const REG_EBDM_FPGA_WRITE_POINTER_L: u32 = 12;
pub const REG_EBDM_FPGA_WRITE_POINTER_H: u32 = 13;
pub const REG_RBDM_FPGA_WRITE_POINTER_L: u32 = 14;
pub const REG_RBDM_FPGA_WRITE_POINTER_H: u32 = 15;
pub const REG_SGENTRY_ADDR_LOW: u32 = 16;
pub const REG_SGENTRY_ADDR_HIGH: u32 = 17;
pub const REG_SGENTRY_LEN: u32 = 18;
pub const REG_SGENTRY_CTRL: u32 = 19;
pub const REG_PERF_DMA_STALL: u32 = 20;
pub const REG_MISC_CFG: u32 = 21;
pub const REG_MISC_STS: u32 = 22;
pub const REG_DESC_CNT_L: u32 = 25;
pub const REG_DESC_CNT_H: u32 = 26;
pub const REG_PERF_INTERVAL: u32 = 27;
pub const REG_PERF_EBUF_STALL: u32 = 28;
pub const REG_PERF_RBUF_STALL: u32 = 29;
pub const REG_PERF_CYCLE_CNT: u32 = 30;

/* scatter-gather entry commit word */
pub const SGCTRL_WRITE_ENABLE: u32 = 1 << 31;
pub const SGCTRL_TARGET_RBDM: u32 = 1 << 30;

/* GTX window, one per channel */
pub const REG_GTX_DATAPATH_CFG: u32 = 0;
pub const REG_GTX_LINK_STS: u32 = 1;
pub const REG_GTX_PERF_INTERVAL: u32 = 2;
pub const REG_GTX_PERF_PKT_AFULL: u32 = 3;
pub const REG_GTX_PERF_CYCLE_CNT: u32 = 4;
pub const REG_GTX_MC_GEN_CFG: u32 = 5;
pub const REG_GTX_MC_GEN_CFG_IDX_L: u32 = 6;
pub const REG_GTX_MC_GEN_CFG_IDX_H: u32 = 7;
pub const REG_GTX_MC_GEN_CFG_HDR: u32 = 8;
pub const REG_GTX_PENDING_MC_L: u32 = 9;
pub const REG_GTX_PENDING_MC_H: u32 = 10;
pub const REG_GTX_MC_INDEX_L: u32 = 11;
pub const REG_GTX_MC_INDEX_H: u32 = 12;
pub const REG_GTX_CTRL_TX: u32 = 13;
pub const REG_GTX_CTRL_RX: u32 = 14;
pub const REG_GTX_DLM: u32 = 15;
/* CBMnet mailbox memories, 16 words each */
pub const MEM_BASE_CTRL_TX: u32 = 32;
pub const MEM_BASE_CTRL_RX: u32 = 48;

/// Converts a measurement interval in milliseconds to packet clock cycles.
pub const fn perf_interval_cycles(ms: u32) -> u32 {
    (ms as u64 * PKT_CLK_HZ as u64 / 1000) as u32
}
