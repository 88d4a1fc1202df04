//! Nested vectored interrupt controller

use core::mem::offset_of;

use crate::bus::RegisterBus;
use crate::map::{self, NvicBlock};

/// Device interrupts on the STM32F411 (IRQ 0 to 85)
pub const IRQ_COUNT: usize = 86;

/// Implemented priority bits, kept in the upper nibble of each IPR byte
pub const PRIORITY_BITS: u8 = 4;

/// STM32F411 interrupt numbers
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Interrupt {
    WWDG = 0,
    PVD = 1,
    TAMP_STAMP = 2,
    RTC_WKUP = 3,
    FLASH = 4,
    RCC = 5,
    EXTI0 = 6,
    EXTI1 = 7,
    EXTI2 = 8,
    EXTI3 = 9,
    EXTI4 = 10,
    DMA1_STREAM0 = 11,
    DMA1_STREAM1 = 12,
    DMA1_STREAM2 = 13,
    DMA1_STREAM3 = 14,
    DMA1_STREAM4 = 15,
    DMA1_STREAM5 = 16,
    DMA1_STREAM6 = 17,
    ADC = 18,
    EXTI9_5 = 23,
    TIM1_BRK_TIM9 = 24,
    TIM1_UP_TIM10 = 25,
    TIM1_TRG_COM_TIM11 = 26,
    TIM1_CC = 27,
    TIM2 = 28,
    TIM3 = 29,
    TIM4 = 30,
    I2C1_EV = 31,
    I2C1_ER = 32,
    I2C2_EV = 33,
    I2C2_ER = 34,
    SPI1 = 35,
    SPI2 = 36,
    USART1 = 37,
    USART2 = 38,
    EXTI15_10 = 40,
    RTC_ALARM = 41,
    OTG_FS_WKUP = 42,
    DMA1_STREAM7 = 47,
    SDIO = 49,
    TIM5 = 50,
    SPI3 = 51,
    DMA2_STREAM0 = 56,
    DMA2_STREAM1 = 57,
    DMA2_STREAM2 = 58,
    DMA2_STREAM3 = 59,
    DMA2_STREAM4 = 60,
    OTG_FS = 67,
    DMA2_STREAM5 = 68,
    DMA2_STREAM6 = 69,
    DMA2_STREAM7 = 70,
    USART6 = 71,
    I2C3_EV = 72,
    I2C3_ER = 73,
    FPU = 81,
    SPI4 = 84,
    SPI5 = 85,
}

impl Interrupt {
    /// IRQ number
    pub const fn nr(self) -> u8 {
        self as u8
    }
}

impl From<Interrupt> for u8 {
    fn from(irq: Interrupt) -> u8 {
        irq.nr()
    }
}

/// The interrupt controller
pub struct Nvic<B> {
    bus: B,
}

impl<B: RegisterBus> Nvic<B> {
    pub const fn new(bus: B) -> Self {
        Nvic { bus }
    }

    fn word(irq: u8) -> Option<(usize, u32)> {
        if usize::from(irq) < IRQ_COUNT {
            Some((usize::from(irq / 32) * 4, 1 << (irq % 32)))
        } else {
            None
        }
    }

    /// Enables `irq`; out-of-range numbers are ignored
    pub fn enable(&mut self, irq: impl Into<u8>) {
        if let Some((offset, bit)) = Self::word(irq.into()) {
            // set-enable registers ignore zeros, no read-modify-write needed
            self.bus
                .write(map::NVIC + offset_of!(NvicBlock, iser) + offset, bit);
        }
    }

    /// Disables `irq`; out-of-range numbers are ignored
    pub fn disable(&mut self, irq: impl Into<u8>) {
        if let Some((offset, bit)) = Self::word(irq.into()) {
            self.bus
                .write(map::NVIC + offset_of!(NvicBlock, icer) + offset, bit);
        }
    }

    /// Whether `irq` is enabled
    pub fn is_enabled(&self, irq: impl Into<u8>) -> bool {
        match Self::word(irq.into()) {
            Some((offset, bit)) => {
                self.bus
                    .read(map::NVIC + offset_of!(NvicBlock, iser) + offset)
                    & bit
                    != 0
            }
            None => false,
        }
    }

    /// Sets the priority of `irq`, 0 (highest) to 15
    ///
    /// Out-of-range IRQ numbers or priorities are ignored.
    pub fn set_priority(&mut self, irq: impl Into<u8>, priority: u8) {
        let irq = irq.into();
        if usize::from(irq) >= IRQ_COUNT || priority >= 1 << PRIORITY_BITS {
            return;
        }

        // IPR is byte addressed, four interrupts per word
        let addr = map::NVIC + offset_of!(NvicBlock, ipr) + usize::from(irq & !0b11);
        let shift = u32::from(irq & 0b11) * 8;
        let word = self.bus.read(addr);
        let byte = u32::from(priority << (8 - PRIORITY_BITS));
        self.bus
            .write(addr, (word & !(0xFF << shift)) | (byte << shift));
    }

    /// Priority of `irq`, or `None` for an IRQ number the device does not have
    pub fn priority(&self, irq: impl Into<u8>) -> Option<u8> {
        let irq = irq.into();
        if usize::from(irq) >= IRQ_COUNT {
            return None;
        }
        let addr = map::NVIC + offset_of!(NvicBlock, ipr) + usize::from(irq & !0b11);
        let shift = u32::from(irq & 0b11) * 8;
        Some(((self.bus.read(addr) >> shift) as u8) >> (8 - PRIORITY_BITS))
    }
}
