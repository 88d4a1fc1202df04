//! STM32F411E-DISCO board support
//!
//! The four user LEDs on GPIOD, the flags the interrupt handlers raise for
//! the main loop and statically allocated DMA buffers.

use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::ptr;
use core::sync::atomic::AtomicBool;

use crate::bus::RegisterBus;
use crate::dma::{self, Stream};
use crate::gpio::{Gpio, Port};
use crate::hal::digital::v2::{OutputPin, StatefulOutputPin, ToggleableOutputPin};
use crate::rcc::Rcc;
use crate::serial::Serial;

/// Raised once a firmware image may be written
pub static UPDATE_FIRMWARE: AtomicBool = AtomicBool::new(false);

/// Raised when the receive DMA has filled the command buffer
pub static RX_READY: AtomicBool = AtomicBool::new(false);

/// A buffer the DMA writes behind the program's back
///
/// The main loop never borrows the contents; it takes a copy with
/// [`DmaBuffer::snapshot`].
#[repr(C, align(4))]
pub struct DmaBuffer<const N: usize> {
    data: UnsafeCell<[u8; N]>,
}

// NOTE(unsafe) the contents are only reached through raw pointers and
// volatile copies
unsafe impl<const N: usize> Sync for DmaBuffer<N> {}

impl<const N: usize> DmaBuffer<N> {
    pub const fn new() -> Self {
        DmaBuffer {
            data: UnsafeCell::new([0; N]),
        }
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    /// Bus address of the first byte, as the DMA sees it
    pub fn address(&self) -> u32 {
        self.as_mut_ptr() as usize as u32
    }

    /// Copies the current contents out
    pub fn snapshot(&self) -> [u8; N] {
        // NOTE(unsafe) the DMA may write concurrently; a volatile copy reads
        // each element exactly once and never creates a reference
        unsafe { ptr::read_volatile(self.data.get()) }
    }

    /// Copies `len` bytes starting at the beginning into `out`
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let len = out.len().min(N);
        let base = self.as_mut_ptr();
        for (i, byte) in out.iter_mut().take(len).enumerate() {
            // NOTE(unsafe) `i < N`
            *byte = unsafe { ptr::read_volatile(base.add(i)) };
        }
        len
    }

    /// Stores `byte` at `index`; ignored past the end
    pub fn store(&self, index: usize, byte: u8) {
        if index < N {
            // NOTE(unsafe) bounds checked above
            unsafe { ptr::write_volatile(self.as_mut_ptr().add(index), byte) }
        }
    }
}

impl<const N: usize> Default for DmaBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams command frames of `N` bytes into `buffer`, wrapping around
///
/// Each full frame raises the transfer complete interrupt of the receive
/// stream.
pub fn listen_for_commands<B, const N: usize>(
    serial: &mut Serial<B>,
    buffer: &'static DmaBuffer<N>,
) -> Result<Stream<B>, dma::Error>
where
    B: RegisterBus + Copy,
{
    let len = u16::try_from(N).map_err(|_| dma::Error::TransferTooLong)?;
    serial.rx_dma(buffer.address(), len, true)
}

/// Leaves command mode: stops `rx`, then sends `ack` through the transmit
/// DMA
///
/// The receive stream is confirmed stopped before the first byte of `ack`
/// leaves, so anything the host sends in reply stays in the data register
/// for polled reception instead of landing in the command buffer.
pub fn begin_update<B>(
    serial: &mut Serial<B>,
    rx: &mut Stream<B>,
    ack: &'static [u8],
) -> Result<Stream<B>, dma::Error>
where
    B: RegisterBus + Copy,
{
    rx.disable();
    let len = u16::try_from(ack.len()).map_err(|_| dma::Error::TransferTooLong)?;
    serial.tx_dma(ack.as_ptr() as usize as u32, len)
}

/// User LEDs, by their GPIOD pin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Led {
    Green = 12,
    Orange = 13,
    Red = 14,
    Blue = 15,
}

impl Led {
    pub const ALL: [Led; 4] = [Led::Green, Led::Orange, Led::Red, Led::Blue];

    pub const fn pin(self) -> u8 {
        self as u8
    }
}

/// The four user LEDs
pub struct Leds<B> {
    gpio: Gpio<B>,
}

impl<B: RegisterBus> Leds<B> {
    /// Takes over LEDs already set up by [`led_init`]
    pub const fn new(bus: B) -> Self {
        Leds {
            gpio: Gpio::new(bus, Port::D),
        }
    }

    pub fn on(&self, led: Led) {
        self.gpio.set_high(led.pin());
    }

    pub fn off(&self, led: Led) {
        self.gpio.set_low(led.pin());
    }

    pub fn toggle(&self, led: Led) {
        self.gpio.toggle(led.pin());
    }

    pub fn is_on(&self, led: Led) -> bool {
        self.gpio.is_set_high(led.pin())
    }
}

impl<B: RegisterBus + Copy> Leds<B> {
    /// A single LED as an `OutputPin`
    pub fn split(&self, led: Led) -> LedPin<B> {
        LedPin {
            gpio: Gpio::new(*self.gpio.bus(), Port::D),
            led,
        }
    }
}

/// Enables GPIOD and makes all four LED pins push-pull outputs, off
pub fn led_init<B: RegisterBus + Copy>(bus: B) -> Leds<B> {
    Rcc::new(bus).enable(Port::D.peripheral());

    let leds = Leds::new(bus);
    for led in Led::ALL {
        leds.off(led);
        leds.gpio.into_output(led.pin());
    }
    leds
}

/// One user LED
pub struct LedPin<B> {
    gpio: Gpio<B>,
    led: Led,
}

impl<B: RegisterBus> OutputPin for LedPin<B> {
    type Error = Infallible;

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.gpio.set_high(self.led.pin());
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.gpio.set_low(self.led.pin());
        Ok(())
    }
}

impl<B: RegisterBus> StatefulOutputPin for LedPin<B> {
    fn is_set_high(&self) -> Result<bool, Infallible> {
        Ok(self.gpio.is_set_high(self.led.pin()))
    }

    fn is_set_low(&self) -> Result<bool, Infallible> {
        Ok(!self.gpio.is_set_high(self.led.pin()))
    }
}

impl<B: RegisterBus> ToggleableOutputPin for LedPin<B> {
    type Error = Infallible;

    fn toggle(&mut self) -> Result<(), Infallible> {
        self.gpio.toggle(self.led.pin());
        Ok(())
    }
}
