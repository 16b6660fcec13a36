//! Wire-format records shared with the FLIB hardware.

use bitflags::bitflags;

/// Header format identifier the hardware stamps into every descriptor.
pub const MC_HDR_ID: u8 = 0xDD;
/// Header format version the hardware stamps into every descriptor.
pub const MC_HDR_VER: u8 = 0x01;

bitflags! {
    /// Microslice status and error flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MicrosliceFlags: u16 {
        /// Information in the CRC field is valid
        const CRC_VALID = 0x0001;
        /// Truncated by the FLIM
        const OVERFLOW_FLIM = 0x0002;
        /// Truncated by user logic
        const OVERFLOW_USER = 0x0004;
    }
}

/// Subsystem identifier of the equipment feeding a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubsystemId {
    /// Silicon Tracking System
    Sts = 0x10,
    /// Micro-Vertex Detector
    Mvd = 0x20,
    /// Ring Imaging Cherenkov detector
    Rich = 0x30,
    /// Transition Radiation Detector
    Trd = 0x40,
    /// Muon Chamber system
    Much = 0x50,
    /// Resistive Plate Chambers
    Rpc = 0x60,
    /// Electromagnetic Calorimeter
    Ecal = 0x70,
    /// Projectile Spectator Detector
    Psd = 0x80,
    /// TRB3 stream
    Trb3 = 0xE0,
    /// Fiber Hodoscope
    Hodoscope = 0xE1,
    Cherenkov = 0xE2,
    LeadGlass = 0xE3,
    /// First-level Event Selector pattern generators
    Fles = 0xF0,
}

impl SubsystemId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::Sts),
            0x20 => Some(Self::Mvd),
            0x30 => Some(Self::Rich),
            0x40 => Some(Self::Trd),
            0x50 => Some(Self::Much),
            0x60 => Some(Self::Rpc),
            0x70 => Some(Self::Ecal),
            0x80 => Some(Self::Psd),
            0xE0 => Some(Self::Trb3),
            0xE1 => Some(Self::Hodoscope),
            0xE2 => Some(Self::Cherenkov),
            0xE3 => Some(Self::LeadGlass),
            0xF0 => Some(Self::Fles),
            _ => None,
        }
    }
}

/// Subsystem format codes used with [`SubsystemId::Fles`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubsystemFormatFles {
    /// Hardware pattern generator ("pgen")
    CbmNetPattern = 0x10,
    /// Front-end emulation ("emu")
    CbmNetFrontendEmulation = 0x11,
    FlibPattern = 0x20,
}

/// Microslice descriptor, bit-identical to what the hardware emits.
///
/// 32 bytes packed little-endian; the stride in the report buffer is hard
/// coded in hardware. `idx` counts from 1 and is the publication edge the
/// consumer polls on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct MicrosliceDescriptor {
    /// Header format identifier, always [`MC_HDR_ID`]
    pub hdr_id: u8,
    /// Header format version, always [`MC_HDR_VER`]
    pub hdr_ver: u8,
    /// Equipment identifier
    pub eq_id: u16,
    /// Status and error flags, see [`MicrosliceFlags`]
    pub flags: u16,
    /// Subsystem identifier
    pub sys_id: u8,
    /// Subsystem format version
    pub sys_ver: u8,
    /// Microslice index, monotone, counting from 1
    pub idx: u64,
    /// CRC-32C (Castagnoli) of the data content
    pub crc: u32,
    /// Content size in bytes
    pub size: u32,
    /// Offset in the event buffer in bytes, modulo the buffer size
    pub offset: u64,
}

unsafe impl bytemuck::Zeroable for MicrosliceDescriptor {}
unsafe impl bytemuck::Pod for MicrosliceDescriptor {}

impl MicrosliceDescriptor {
    pub fn header_valid(&self) -> bool {
        self.hdr_id == MC_HDR_ID && self.hdr_ver == MC_HDR_VER
    }

    pub fn status_flags(&self) -> MicrosliceFlags {
        MicrosliceFlags::from_bits_truncate(self.flags)
    }
}

/// Header template applied to pattern-generated microslices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct HdrConfig {
    /// Equipment identifier
    pub eq_id: u16,
    /// Subsystem identifier
    pub sys_id: u8,
    /// Subsystem format version
    pub sys_ver: u8,
}

unsafe impl bytemuck::Zeroable for HdrConfig {}
unsafe impl bytemuck::Pod for HdrConfig {}

/// A CBMnet control message tunneled through the mailbox.
#[derive(Debug, Clone, Copy)]
pub struct CtrlMsg {
    /// Number of valid 16-bit data words, 4..=32
    pub words: u32,
    pub data: [u16; 32],
}

impl Default for CtrlMsg {
    fn default() -> Self {
        Self {
            words: 0,
            data: [0; 32],
        }
    }
}
