//! Volatile access to the memory-mapped register space
//!
//! Every driver in this crate talks to silicon through a [`RegisterBus`]. On
//! the target that is [`Mmio`], which turns each access into exactly one
//! volatile load or store at the given address. Unit tests substitute a
//! RAM-backed bus so the drivers can be exercised on the host.

use core::ptr;

/// Word and byte access to the peripheral address space
pub trait RegisterBus {
    /// Loads the 32-bit word at `addr`
    fn read(&self, addr: usize) -> u32;

    /// Stores `value` to the 32-bit word at `addr`
    fn write(&self, addr: usize, value: u32);

    /// Stores a single byte at `addr`
    ///
    /// Used for x8 flash programming, where the flash interface expects byte
    /// sized bus transactions.
    fn write_byte(&self, addr: usize, value: u8);
}

impl<B> RegisterBus for &B
where
    B: RegisterBus + ?Sized,
{
    #[inline(always)]
    fn read(&self, addr: usize) -> u32 {
        (**self).read(addr)
    }

    #[inline(always)]
    fn write(&self, addr: usize, value: u32) {
        (**self).write(addr, value)
    }

    #[inline(always)]
    fn write_byte(&self, addr: usize, value: u8) {
        (**self).write_byte(addr, value)
    }
}

/// The real peripheral address space
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mmio {
    _0: (),
}

impl Mmio {
    /// Grants access to the memory-mapped registers
    ///
    /// # Safety
    ///
    /// Only sound on an STM32F411, where every address in [`crate::map`] is
    /// backed by a peripheral. The caller is also responsible for not
    /// driving the same register from two contexts at once.
    pub const unsafe fn steal() -> Self {
        Mmio { _0: () }
    }
}

impl RegisterBus for Mmio {
    #[inline(always)]
    fn read(&self, addr: usize) -> u32 {
        // NOTE(unsafe) `Mmio` only exists on hardware with this memory map
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    #[inline(always)]
    fn write(&self, addr: usize, value: u32) {
        // NOTE(unsafe) `Mmio` only exists on hardware with this memory map
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    #[inline(always)]
    fn write_byte(&self, addr: usize, value: u8) {
        // NOTE(unsafe) `Mmio` only exists on hardware with this memory map
        unsafe { ptr::write_volatile(addr as *mut u8, value) }
    }
}
