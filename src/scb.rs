//! System control block
//!
//! Vector table relocation, run-time handler installation and the
//! AIRCR system reset.

use core::cell::UnsafeCell;
use core::hint;
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

use crate::bus::RegisterBus;
use crate::map;
use crate::nvic::IRQ_COUNT;

/// Number of system exception slots ahead of the device interrupts
pub const EXCEPTION_COUNT: usize = 16;

/// Entries in the vector table: 16 exceptions plus 86 interrupts (0x198 bytes)
pub const VECTOR_COUNT: usize = EXCEPTION_COUNT + IRQ_COUNT;

/// `VECTKEY` in the upper half, `SYSRESETREQ` at bit 2
pub const AIRCR_RESET: u32 = (0x05FA << 16) | (1 << 2);

/// An interrupt handler
pub type Handler = extern "C" fn();

/// A vector table in RAM
///
/// VTOR needs the table aligned to the next power of two of its size, which
/// is 512 bytes for 102 entries. Place it in a `static`; the hardware reads it
/// for as long as the program runs.
#[repr(C, align(512))]
pub struct VectorTable {
    slots: UnsafeCell<[usize; VECTOR_COUNT]>,
}

// NOTE(unsafe) slots are only written inside critical sections and read by
// the NVIC
unsafe impl Sync for VectorTable {}

impl VectorTable {
    /// An empty table
    pub const fn new() -> Self {
        VectorTable {
            slots: UnsafeCell::new([0; VECTOR_COUNT]),
        }
    }

    /// Address of the first entry
    pub fn as_ptr(&self) -> *const usize {
        self.slots.get() as *const usize
    }

    /// Copies the active vector table into this one and points VTOR here
    pub fn relocate<B: RegisterBus>(&'static self, bus: &B) {
        critical_section::with(|_| {
            let origin = bus.read(map::VTOR) as usize;
            let slots = self.slots.get() as *mut usize;
            for i in 0..VECTOR_COUNT {
                let entry = bus.read(origin + i * 4) as usize;
                // NOTE(unsafe) `i` is in bounds and no handler can run
                unsafe { ptr::write_volatile(slots.add(i), entry) };
            }
            compiler_fence(Ordering::SeqCst);
            bus.write(map::VTOR, self.as_ptr() as usize as u32);
        });
    }

    /// Installs `handler` for device interrupt `irq`
    ///
    /// Returns `false` for an IRQ number the device does not have. Installing
    /// over an existing entry replaces it.
    pub fn install(&self, irq: u8, handler: Handler) -> bool {
        let irq = usize::from(irq);
        if irq >= IRQ_COUNT {
            return false;
        }

        critical_section::with(|_| {
            let slots = self.slots.get() as *mut usize;
            // NOTE(unsafe) bounds checked above, interrupts masked
            unsafe { ptr::write_volatile(slots.add(EXCEPTION_COUNT + irq), handler as usize) };
        });
        true
    }

    /// Current entry for device interrupt `irq`
    pub fn handler(&self, irq: u8) -> Option<usize> {
        let irq = usize::from(irq);
        if irq >= IRQ_COUNT {
            return None;
        }
        let slots = self.slots.get() as *const usize;
        // NOTE(unsafe) bounds checked above
        Some(unsafe { ptr::read_volatile(slots.add(EXCEPTION_COUNT + irq)) })
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[inline(always)]
fn dsb() {
    #[cfg(target_arch = "arm")]
    // NOTE(unsafe) barrier only
    unsafe {
        core::arch::asm!("dsb", options(nomem, nostack, preserves_flags))
    };
    compiler_fence(Ordering::SeqCst);
}

/// Requests a system reset through AIRCR and waits for it
#[inline(always)]
pub fn system_reset<B: RegisterBus>(bus: &B) -> ! {
    dsb();
    bus.write(map::AIRCR, AIRCR_RESET);
    dsb();

    loop {
        hint::spin_loop();
    }
}
