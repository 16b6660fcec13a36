use crate::pci::PciError;
use crate::regs::RegError;

/// FLIB driver error enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlibError {
    /// Bounded poll ran out of retries
    Timeout,
    /// Buffer create collided with a persistent allocation
    AlreadyExists,
    /// Buffer open found no matching id
    NotFound,
    /// Buffer allocation refused
    AllocFailed,
    /// Buffer release failed
    DeallocFailed,
    /// Operation preconditioned on a ready bit
    HardwareNotReady,
    /// Control message word count out of range on receive
    Truncated,
    /// Control message mailbox empty
    NoMessage,
    /// Parameter outside the hardware limits
    InvalidArgument,
    /// Operation not permitted in the current link state
    InvalidState,
    /// Register or descriptor read indicating impossible invariants
    Fatal,
}

impl RegError for FlibError {
    fn timeout() -> Self {
        FlibError::Timeout
    }
}

impl From<PciError> for FlibError {
    fn from(err: PciError) -> Self {
        match err {
            PciError::AlreadyExists => FlibError::AlreadyExists,
            PciError::NotFound => FlibError::NotFound,
            PciError::AllocFailed => FlibError::AllocFailed,
            PciError::DeallocFailed => FlibError::DeallocFailed,
        }
    }
}

/// Result type for FLIB operations.
pub type FlibResult<T = ()> = Result<T, FlibError>;
