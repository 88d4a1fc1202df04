//! External interrupt/event controller
//!
//! GPIO lines 0 to 15 are routed to a port through SYSCFG, then armed for an
//! edge here. The NVIC line still has to be enabled separately; see
//! [`irq_for_line`].

use core::mem::offset_of;

use crate::bus::RegisterBus;
use crate::field::{Access, RegisterMap, Registers};
use crate::gpio::Port;
use crate::map::{self, ExtiBlock, SyscfgBlock};
use crate::nvic::Interrupt;

/// Lines 0 to 18, 21 and 22
pub const VALID_LINES: u32 = 0x0067_FFFF;

/// Logical EXTI registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExtiRegister {
    Imr,
    Emr,
    Rtsr,
    Ftsr,
    Swier,
    Pr,
}

/// Register description of the EXTI controller
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtiMap;

impl RegisterMap for ExtiMap {
    type Register = ExtiRegister;

    fn address(&self, reg: ExtiRegister) -> Option<usize> {
        let offset = match reg {
            ExtiRegister::Imr => offset_of!(ExtiBlock, imr),
            ExtiRegister::Emr => offset_of!(ExtiBlock, emr),
            ExtiRegister::Rtsr => offset_of!(ExtiBlock, rtsr),
            ExtiRegister::Ftsr => offset_of!(ExtiBlock, ftsr),
            ExtiRegister::Swier => offset_of!(ExtiBlock, swier),
            ExtiRegister::Pr => offset_of!(ExtiBlock, pr),
        };
        Some(map::EXTI + offset)
    }

    fn valid_bits(&self, _reg: ExtiRegister) -> u32 {
        VALID_LINES
    }

    fn access(&self, reg: ExtiRegister) -> Access {
        match reg {
            ExtiRegister::Pr => Access::WriteOneToClear,
            _ => Access::ReadWrite,
        }
    }
}

/// Edge that triggers a line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
    RisingFalling,
}

/// NVIC interrupt that serves EXTI `line`
pub fn irq_for_line(line: u8) -> Option<u8> {
    let irq = match line {
        0 => Interrupt::EXTI0,
        1 => Interrupt::EXTI1,
        2 => Interrupt::EXTI2,
        3 => Interrupt::EXTI3,
        4 => Interrupt::EXTI4,
        5..=9 => Interrupt::EXTI9_5,
        10..=15 => Interrupt::EXTI15_10,
        16 => Interrupt::PVD,
        17 => Interrupt::RTC_ALARM,
        18 => Interrupt::OTG_FS_WKUP,
        21 => Interrupt::TAMP_STAMP,
        22 => Interrupt::RTC_WKUP,
        _ => return None,
    };
    Some(irq.nr())
}

const fn valid_line(line: u8) -> bool {
    line < 32 && VALID_LINES & (1 << line) != 0
}

/// The EXTI controller together with the SYSCFG routing registers
pub struct Exti<B> {
    regs: Registers<ExtiMap, B>,
}

impl<B: RegisterBus> Exti<B> {
    pub const fn new(bus: B) -> Self {
        Exti {
            regs: Registers::new(ExtiMap, bus),
        }
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: ExtiRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: ExtiRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    /// Make GPIO line `pin` sensitive to `port`
    ///
    /// The SYSCFG clock must be enabled for the routing write to land.
    pub fn route(&self, port: Port, pin: u8) -> bool {
        if pin > 15 {
            return false;
        }
        let addr = map::SYSCFG + map::nth(offset_of!(SyscfgBlock, exticr), usize::from(pin / 4));
        crate::field::write_bits(self.regs.bus(), addr, 4 * (pin % 4), 4, u32::from(port.index()));
        true
    }

    /// Triggers `line` on `edge` and unmasks its interrupt
    ///
    /// Returns `false` for a line the controller does not have.
    pub fn configure(&self, line: u8, edge: Edge) -> bool {
        if !valid_line(line) {
            return false;
        }

        let (rising, falling) = match edge {
            Edge::Rising => (1, 0),
            Edge::Falling => (0, 1),
            Edge::RisingFalling => (1, 1),
        };
        self.regs.write(line, ExtiRegister::Rtsr, rising);
        self.regs.write(line, ExtiRegister::Ftsr, falling);
        self.regs.set(line, ExtiRegister::Imr);
        true
    }

    /// Masks the interrupt of `line`
    pub fn disable(&self, line: u8) {
        self.regs.clear(line, ExtiRegister::Imr);
    }

    /// Reads the interrupt pending bit of `line`
    #[inline(always)]
    pub fn is_pending(&self, line: u8) -> bool {
        self.regs.is_set(line, ExtiRegister::Pr)
    }

    /// Clear the interrupt pending bit of `line`
    #[inline(always)]
    pub fn clear_pending(&self, line: u8) {
        self.regs.set(line, ExtiRegister::Pr);
    }

    /// Raises `line` from software
    pub fn trigger(&self, line: u8) {
        self.regs.set(line, ExtiRegister::Swier);
    }
}
