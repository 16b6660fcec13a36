#![no_std]

extern crate alloc;

#[macro_use]
pub mod regs;
pub mod flib;
pub mod monitor;
pub mod pci;

pub use flib::*;

use core::time::Duration;

pub trait Kernel {
    fn sleep(duration: Duration);
}

pub(crate) fn flib_sleep(duration: Duration) {
    unsafe extern "Rust" {
        fn _flib_sleep(duration: Duration);
    }

    unsafe {
        _flib_sleep(duration);
    }
}

#[macro_export]
macro_rules! set_impl {
    ($t: ty) => {
        #[unsafe(no_mangle)]
        unsafe fn _flib_sleep(duration: core::time::Duration) {
            <$t as $crate::Kernel>::sleep(duration)
        }
    };
}

#[cfg(test)]
pub(crate) mod sim;

#[cfg(test)]
mod test_kernel {
    use core::time::Duration;

    struct TestKernel;

    impl crate::Kernel for TestKernel {
        fn sleep(_duration: Duration) {
            core::hint::spin_loop();
        }
    }

    crate::set_impl!(TestKernel);
}
