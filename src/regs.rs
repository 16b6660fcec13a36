use crate::flib_sleep;
use bitflags::Flags;
use core::{marker::PhantomData, ops, ptr::NonNull, time::Duration};

/*
 * Implement a BitsOps trait for all bitflag!
 * Facilitates common operations for all bitflag!
 * The principle is that all bitflag! are structs, and structs implement ops::BitOr and other operations
 * At this point, implement a BitsOps trait for structs that implement ops::BitOr
 * This way all bitflag! can be recognized as implementing the BitsOps trait
*/
pub trait BitsOps:
    ops::BitOr<Output = Self>
    + ops::BitAnd<Output = Self>
    + ops::Not<Output = Self>
    + ops::BitXor<Output = Self>
    + Sized
{
}
impl<T> BitsOps for T where
    T: ops::BitOr<Output = Self>
        + ops::BitAnd<Output = Self>
        + ops::Not<Output = Self>
        + ops::BitXor<Output = Self>
{
}

/*
 * Create a contiguous bitmask starting at bit position @l and ending at
 * position @h. For example
 * GENMASK_ULL(39, 21) gives us the 64bit vector 0x000000ffffe00000.
 */
#[macro_export]
macro_rules! genmask {
    ($h:expr, $l:expr) => {
        (((!0u32) - (1u32 << $l) + 1) & ((!0u32) >> (32 - 1 - $h)))
    };
}

#[macro_export]
macro_rules! genmask_ull {
    ($h:expr, $l:expr) => {
        (((!0u64) - (1u64 << $l) + 1) & ((!0u64) >> (64 - 1 - $h)))
    };
}

/* set 32-bit register [a:b] as x, where a is high bit, b is low bit, x is setting/getting value */
#[macro_export]
macro_rules! get_reg32_bits {
    ($reg:expr, $a:expr, $b:expr) => {
        ($reg & genmask!($a, $b)) >> $b
    };
}

#[macro_export]
macro_rules! set_reg32_bits {
    ($reg:expr, $a:expr, $b:expr) => {
        (($reg << $b) & genmask!($a, $b))
    };
}

/// Accessor for a bank of memory mapped 32-bit registers.
///
/// Register addresses are 32-bit word offsets relative to the base address
/// bound at construction. All accesses are volatile; block operations are not
/// atomic with respect to concurrent device writes.
#[derive(Debug)]
pub struct Reg<E: RegError> {
    pub addr: NonNull<u8>,
    _marker: PhantomData<E>,
}

impl<E: RegError> Reg<E> {
    pub fn new(addr: NonNull<u8>) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    /// Derives an accessor for a sub-window at `offset` words from this base.
    pub fn window(&self, offset: u32) -> Self {
        unsafe { Self::new(self.addr.add(offset as usize * 4)) }
    }

    pub fn read_32(&self, reg: u32) -> u32 {
        unsafe {
            let ptr = self.addr.add(reg as usize * 4);
            ptr.cast().read_volatile()
        }
    }

    pub fn write_32(&self, reg: u32, val: u32) {
        unsafe {
            let ptr = self.addr.add(reg as usize * 4);
            ptr.cast().write_volatile(val);
        }
    }

    /// Reads a low/high register pair. Not atomic, see [`Reg::read_64_stable`].
    pub fn read_64(&self, reg_l: u32, reg_h: u32) -> u64 {
        let l = self.read_32(reg_l) as u64;
        let h = self.read_32(reg_h) as u64;
        (h << 32) | l
    }

    pub fn write_64(&self, reg_l: u32, reg_h: u32, val: u64) {
        self.write_32(reg_l, val as u32);
        self.write_32(reg_h, (val >> 32) as u32);
    }

    /// Reads a monotone low/high counter pair, re-reading until the high word
    /// is stable around the low read.
    pub fn read_64_stable(&self, reg_l: u32, reg_h: u32) -> u64 {
        let mut h = self.read_32(reg_h);
        let mut l = self.read_32(reg_l);
        for _ in 0..3 {
            let h2 = self.read_32(reg_h);
            if h2 == h {
                break;
            }
            h = h2;
            l = self.read_32(reg_l);
        }
        ((h as u64) << 32) | l as u64
    }

    pub fn read_block(&self, reg: u32, dest: &mut [u32]) {
        for (i, word) in dest.iter_mut().enumerate() {
            *word = self.read_32(reg + i as u32);
        }
    }

    pub fn write_block(&self, reg: u32, source: &[u32]) {
        for (i, word) in source.iter().enumerate() {
            self.write_32(reg + i as u32, *word);
        }
    }

    pub fn read_bit(&self, reg: u32, pos: u32) -> bool {
        self.read_32(reg) & (1 << pos) != 0
    }

    /// Read-modify-write of a single bit. Callers must ensure no concurrent
    /// writer aliases the word.
    pub fn write_bit(&self, reg: u32, pos: u32, set: bool) {
        let old = self.read_32(reg);
        if set {
            self.write_32(reg, old | (1 << pos));
        } else {
            self.write_32(reg, old & !(1 << pos));
        }
    }

    pub fn read_reg<F: FlagReg>(&self) -> F {
        F::from_bits_retain(self.read_32(F::REG))
    }

    pub fn write_reg<F: FlagReg>(&self, val: F) {
        self.write_32(F::REG, val.bits())
    }

    pub fn modify_reg<F: FlagReg>(&self, f: impl Fn(F) -> F) {
        let old = self.read_reg::<F>();
        self.write_reg(f(old));
    }

    pub fn clear_reg<F: FlagReg + Copy + BitsOps>(&self, val: F) {
        self.modify_reg(|old| !val & old)
    }

    pub fn set_reg<F: FlagReg + Copy + BitsOps>(&self, val: F) {
        self.modify_reg(|old| val | old)
    }

    /// Set-then-clear of an edge-triggered pulse bit. The two writes are
    /// adjacent, no other register access may interleave.
    pub fn pulse_reg<F: FlagReg + Copy + BitsOps>(&self, val: F) {
        let old = self.read_reg::<F>();
        self.write_reg(old | val);
        self.write_reg(old & !val);
    }

    pub fn get_base_addr(&self) -> NonNull<u8> {
        self.addr
    }

    pub fn wait_for<R: FlagReg, F: Fn(R) -> bool>(
        &self,
        f: F,
        interval: Duration,
        try_count: Option<usize>,
    ) -> Result<(), E> {
        for _ in 0..try_count.unwrap_or(usize::MAX) {
            if f(self.read_reg::<R>()) {
                return Ok(());
            }

            flib_sleep(interval);
        }
        Err(E::timeout())
    }

    pub fn retry_for<R: FlagReg, F: Fn(R) -> bool>(
        &self,
        f: F,
        try_count: Option<usize>,
    ) -> Result<(), E> {
        for _ in 0..try_count.unwrap_or(usize::MAX) {
            if f(self.read_reg::<R>()) {
                return Ok(());
            }
        }
        Err(E::timeout())
    }
}

impl<E: RegError> PartialEq for Reg<E> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

pub trait RegError {
    fn timeout() -> Self;
}

pub trait FlagReg: Flags<Bits = u32> {
    const REG: u32;
}
