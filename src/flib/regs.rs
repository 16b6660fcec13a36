//! Register definitions for the FLIB channel windows.
//!
//! Each register with named bits is a `bitflags!` struct implementing
//! [`FlagReg`] with its word offset, so it can be driven through the typed
//! accessor calls (`read_reg`, `modify_reg`, `set_reg`, ...). Packetizer and
//! GTX offsets overlap; the window is selected by the accessor instance the
//! call goes through.

#![allow(missing_docs)]

use crate::flib::{constants::*, err::FlibError};
use bitflags::bitflags;

use super::{FlagReg, Reg};

/// FLIB register accessor type
pub type FlibReg = Reg<FlibError>;

impl Clone for FlibReg {
    fn clone(&self) -> Self {
        Self::new(self.addr)
    }
}

// REG_DMA_CTRL, packetizer window
bitflags! {
    #[derive(Clone, Copy)]
    pub struct DmaCtrl: u32 {
        const DMA_ENABLE = 1 << 0; // RW DMA engine enable
        const FIFO_RESET = 1 << 1; // W packetizer FIFO reset, self clearing
        const EBDM_ENABLE = 1 << 2; // RW event buffer descriptor manager enable
        const RBDM_ENABLE = 1 << 3; // RW report buffer descriptor manager enable
        const BUSY = 1 << 7; // RO transfers pending
        const PAYLOAD_MASK = 0x3ff << 16; // RW max payload in dwords
    }
}

impl FlagReg for DmaCtrl {
    const REG: u32 = REG_DMA_CTRL;
}

impl DmaCtrl {
    pub fn max_payload_set(words: u32) -> Self {
        Self::from_bits_retain(set_reg32_bits!(words, 25, 16))
    }
    pub fn max_payload_get(reg: u32) -> u32 {
        get_reg32_bits!(reg, 25, 16)
    }
}

// REG_GTX_DATAPATH_CFG
// bit 0-1 data_rx_sel (00: disable, 01: emu, 10: link, 11: pgen)
// bit 2 datapath reset
bitflags! {
    #[derive(Clone, Copy)]
    pub struct DatapathCfg: u32 {
        const RX_SEL_L = 1 << 0;
        const RX_SEL_H = 1 << 1;
        const RESET = 1 << 2;
    }
}

impl FlagReg for DatapathCfg {
    const REG: u32 = REG_GTX_DATAPATH_CFG;
}

// REG_GTX_MC_GEN_CFG
// bit 0 set_start_index
// bit 1 rst_pending_mc
// bit 2 packer enable
bitflags! {
    #[derive(Clone, Copy)]
    pub struct McGenCfg: u32 {
        const SET_START_INDEX = 1 << 0; // W pulse, latches the start index pair
        const RST_PENDING_MC = 1 << 1; // W pulse
        const PACKER_ENABLE = 1 << 2; // RW
    }
}

impl FlagReg for McGenCfg {
    const REG: u32 = REG_GTX_MC_GEN_CFG;
}

// REG_GTX_LINK_STS
bitflags! {
    #[derive(Clone, Copy)]
    pub struct LinkSts: u32 {
        const CHANNEL_UP = 1 << 0;
        const HARD_ERR = 1 << 1;
        const SOFT_ERR = 1 << 2;
        const EOE_FIFO_OVERFLOW = 1 << 3;
        const D_FIFO_OVERFLOW = 1 << 4;
        const D_FIFO_MAX_WORDS_MASK = 0xffff << 8;
    }
}

impl FlagReg for LinkSts {
    const REG: u32 = REG_GTX_LINK_STS;
}

impl LinkSts {
    pub fn d_fifo_max_words(reg: u32) -> u32 {
        get_reg32_bits!(reg, 23, 8)
    }
}

// REG_GTX_DLM
// 3..0 tx type, 4 enable, 8..5 rx type, 31 set to clear rx reg
bitflags! {
    #[derive(Clone, Copy)]
    pub struct GtxDlm: u32 {
        const TX_TYPE_MASK = 0xf;
        const TX_ENABLE = 1 << 4;
        const RX_TYPE_MASK = 0xf << 5;
        const CLEAR_RX = 1 << 31;
    }
}

impl FlagReg for GtxDlm {
    const REG: u32 = REG_GTX_DLM;
}

impl GtxDlm {
    pub fn prepare(dlm_type: u8, enable: bool) -> Self {
        let mut reg = (dlm_type as u32) & 0xf;
        if enable {
            reg |= GtxDlm::TX_ENABLE.bits();
        }
        Self::from_bits_retain(reg)
    }
    pub fn rx_type(reg: u32) -> u8 {
        get_reg32_bits!(reg, 8, 5) as u8
    }
}

// REG_GTX_CTRL_TX
// bit 31 busy while the send FSM runs, 4..0 word count minus one
bitflags! {
    #[derive(Clone, Copy)]
    pub struct CtrlTx: u32 {
        const BUSY = 1 << 31;
        const WORDS_MASK = 0x1f;
    }
}

impl FlagReg for CtrlTx {
    const REG: u32 = REG_GTX_CTRL_TX;
}

impl CtrlTx {
    pub fn send(words: u32) -> Self {
        Self::from_bits_retain(CtrlTx::BUSY.bits() | (words - 1))
    }
}

// REG_GTX_CTRL_RX
// bit 31 message valid, 4..0 word count minus one
bitflags! {
    #[derive(Clone, Copy)]
    pub struct CtrlRx: u32 {
        const VALID = 1 << 31;
        const WORDS_MASK = 0x1f;
    }
}

impl FlagReg for CtrlRx {
    const REG: u32 = REG_GTX_CTRL_RX;
}

impl CtrlRx {
    pub fn words(reg: u32) -> u32 {
        (reg & CtrlRx::WORDS_MASK.bits()) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_field() {
        let reg = DmaCtrl::max_payload_set(128);
        assert_eq!(reg.bits(), 128 << 16);
        assert_eq!(DmaCtrl::max_payload_get(reg.bits()), 128);
    }

    #[test]
    fn dlm_encoding() {
        assert_eq!(GtxDlm::prepare(5, true).bits(), (1 << 4) | 5);
        assert_eq!(GtxDlm::prepare(5, false).bits(), 5);
        assert_eq!(GtxDlm::rx_type(7 << 5), 7);
    }

    #[test]
    fn ctrl_tx_encoding() {
        assert_eq!(CtrlTx::send(8).bits(), (1 << 31) | 7);
        assert_eq!(CtrlRx::words(7), 8);
    }
}
