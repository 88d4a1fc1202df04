//! Timers

use core::mem::offset_of;

use crate::hal::timer::{CountDown, Periodic};
use cast::{u16, u32};
use void::Void;

use crate::bus::RegisterBus;
use crate::field::{self, Access, RegisterMap, Registers};
use crate::map::{self, TimBlock};
use crate::nvic::{Interrupt, Nvic};
use crate::rcc::{Clocks, Peripheral, Rcc};
use crate::time::Hertz;

/// Logical timer registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerRegister {
    Cr1,
    Cr2,
    Smcr,
    Dier,
    Sr,
    Egr,
    Ccmr1,
    Ccmr2,
    Ccer,
    Cnt,
    Psc,
    Arr,
    Rcr,
    Ccr1,
    Ccr2,
    Ccr3,
    Ccr4,
    Bdtr,
    Dcr,
    Dmar,
    Tim2Or,
    Tim5Or,
    Tim11Or,
}

/// Timer instances of the STM32F411
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instance {
    Tim1,
    Tim2,
    Tim3,
    Tim4,
    Tim5,
    Tim9,
    Tim10,
    Tim11,
}

/// Register subsets shared by groups of timers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Class {
    /// TIM1
    Advanced,
    /// TIM2, TIM5
    General32,
    /// TIM3, TIM4
    General16,
    /// TIM9
    TwoChannel,
    /// TIM10, TIM11
    OneChannel,
}

const M32: u32 = u32::MAX;

// Implemented bits per class, columns in `TimerRegister` order from CR1 to
// DMAR. The CCMR columns are only consulted by `write_ccmr`.
#[rustfmt::skip]
const VALID_BITS: [[u32; 20]; 5] = [
    //  CR1    CR2     SMCR    DIER    SR      EGR   CCMR1   CCMR2   CCER    CNT     PSC     ARR     RCR   CCR1    CCR2    CCR3    CCR4    BDTR    DCR     DMAR
    [0x3FF, 0x7FFD, 0xFFF7, 0x7FFF, 0x1EFF, 0xFF, 0xFFFF, 0xFFFF, 0x3FFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0x1F1F, M32],
    [0x3FF, 0xF8,   0xFFF7, 0x5F5F, 0x1E5F, 0x5F, 0xFFFF, 0xFFFF, 0xBBBB, M32,    0xFFFF, M32,    0,    M32,    M32,    M32,    M32,    0,      0x1F1F, 0xFFFF],
    [0x3FF, 0xF8,   0xFFF7, 0x5F5F, 0x1E5F, 0x5F, 0xFFFF, 0xFFFF, 0xBBBB, 0xFFFF, 0xFFFF, 0xFFFF, 0,    0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0,      0x1F1F, 0xFFFF],
    [0x38F, 0,      0xF7,   0x47,   0x647,  0x47, 0x7F7F, 0,      0xBB,   0xFFFF, 0xFFFF, 0xFFFF, 0,    0xFFFF, 0xFFFF, 0,      0,      0,      0,      0],
    [0x387, 0,      0,      0x3,    0x203,  0x3,  0x7F,   0,      0xB,    0xFFFF, 0xFFFF, 0xFFFF, 0,    0xFFFF, 0,      0,      0,      0,      0,      0],
];

impl Class {
    const fn row(self) -> usize {
        match self {
            Class::Advanced => 0,
            Class::General32 => 1,
            Class::General16 => 2,
            Class::TwoChannel => 3,
            Class::OneChannel => 4,
        }
    }

    /// Largest value the auto-reload register takes
    pub const fn max_arr(self) -> u32 {
        match self {
            Class::General32 => u32::MAX,
            _ => 0xFFFF,
        }
    }

    /// Capture/compare channels
    pub const fn channels(self) -> u8 {
        match self {
            Class::Advanced | Class::General32 | Class::General16 => 4,
            Class::TwoChannel => 2,
            Class::OneChannel => 1,
        }
    }
}

impl Instance {
    pub const fn class(self) -> Class {
        match self {
            Instance::Tim1 => Class::Advanced,
            Instance::Tim2 | Instance::Tim5 => Class::General32,
            Instance::Tim3 | Instance::Tim4 => Class::General16,
            Instance::Tim9 => Class::TwoChannel,
            Instance::Tim10 | Instance::Tim11 => Class::OneChannel,
        }
    }

    /// Base address of the instance
    pub const fn base(self) -> usize {
        match self {
            Instance::Tim1 => map::TIM1,
            Instance::Tim2 => map::TIM2,
            Instance::Tim3 => map::TIM3,
            Instance::Tim4 => map::TIM4,
            Instance::Tim5 => map::TIM5,
            Instance::Tim9 => map::TIM9,
            Instance::Tim10 => map::TIM10,
            Instance::Tim11 => map::TIM11,
        }
    }

    pub const fn peripheral(self) -> Peripheral {
        match self {
            Instance::Tim1 => Peripheral::Tim1,
            Instance::Tim2 => Peripheral::Tim2,
            Instance::Tim3 => Peripheral::Tim3,
            Instance::Tim4 => Peripheral::Tim4,
            Instance::Tim5 => Peripheral::Tim5,
            Instance::Tim9 => Peripheral::Tim9,
            Instance::Tim10 => Peripheral::Tim10,
            Instance::Tim11 => Peripheral::Tim11,
        }
    }

    /// Interrupt raised by the update event
    pub const fn update_irq(self) -> Interrupt {
        match self {
            Instance::Tim1 | Instance::Tim10 => Interrupt::TIM1_UP_TIM10,
            Instance::Tim2 => Interrupt::TIM2,
            Instance::Tim3 => Interrupt::TIM3,
            Instance::Tim4 => Interrupt::TIM4,
            Instance::Tim5 => Interrupt::TIM5,
            Instance::Tim9 => Interrupt::TIM1_BRK_TIM9,
            Instance::Tim11 => Interrupt::TIM1_TRG_COM_TIM11,
        }
    }

    const fn on_apb2(self) -> bool {
        matches!(
            self,
            Instance::Tim1 | Instance::Tim9 | Instance::Tim10 | Instance::Tim11
        )
    }

    /// Kernel clock of the instance
    pub fn clock(self, clocks: &Clocks) -> Hertz {
        if self.on_apb2() {
            clocks.timclk2()
        } else {
            clocks.timclk1()
        }
    }

    // option register bits, present on one instance each
    const fn option_bits(self, reg: TimerRegister) -> Option<(u8, u32)> {
        match (self, reg) {
            (Instance::Tim2, TimerRegister::Tim2Or) => Some((10, 0b11 << 10)),
            (Instance::Tim5, TimerRegister::Tim5Or) => Some((6, 0b11 << 6)),
            (Instance::Tim11, TimerRegister::Tim11Or) => Some((0, 0b11)),
            _ => None,
        }
    }

    fn class_bits(self, reg: TimerRegister) -> u32 {
        let column = reg as usize;
        if column < 20 {
            VALID_BITS[self.class().row()][column]
        } else {
            self.option_bits(reg).map_or(0, |(_, mask)| mask)
        }
    }
}

impl RegisterMap for Instance {
    type Register = TimerRegister;

    fn address(&self, reg: TimerRegister) -> Option<usize> {
        use TimerRegister::*;

        if self.class_bits(reg) == 0 {
            return None;
        }
        let offset = match reg {
            Cr1 => offset_of!(TimBlock, cr1),
            Cr2 => offset_of!(TimBlock, cr2),
            Smcr => offset_of!(TimBlock, smcr),
            Dier => offset_of!(TimBlock, dier),
            Sr => offset_of!(TimBlock, sr),
            Egr => offset_of!(TimBlock, egr),
            Ccmr1 => offset_of!(TimBlock, ccmr1),
            Ccmr2 => offset_of!(TimBlock, ccmr2),
            Ccer => offset_of!(TimBlock, ccer),
            Cnt => offset_of!(TimBlock, cnt),
            Psc => offset_of!(TimBlock, psc),
            Arr => offset_of!(TimBlock, arr),
            Rcr => offset_of!(TimBlock, rcr),
            Ccr1 => offset_of!(TimBlock, ccr1),
            Ccr2 => offset_of!(TimBlock, ccr2),
            Ccr3 => offset_of!(TimBlock, ccr3),
            Ccr4 => offset_of!(TimBlock, ccr4),
            Bdtr => offset_of!(TimBlock, bdtr),
            Dcr => offset_of!(TimBlock, dcr),
            Dmar => offset_of!(TimBlock, dmar),
            Tim2Or | Tim5Or | Tim11Or => offset_of!(TimBlock, or),
        };
        Some(self.base() + offset)
    }

    fn valid_bits(&self, reg: TimerRegister) -> u32 {
        match reg {
            // layout depends on the channel direction, see `write_ccmr`
            TimerRegister::Ccmr1 | TimerRegister::Ccmr2 => 0,
            _ => self.class_bits(reg),
        }
    }

    fn field_width(&self, reg: TimerRegister, bit: u8) -> u8 {
        use TimerRegister::*;

        let counter = if self.class() == Class::General32 { 32 } else { 16 };
        match (reg, bit) {
            // CMS, CKD
            (Cr1, 5 | 8) => 2,
            // MMS
            (Cr2, 4) => 3,
            // SMS, TS, ETF, ETPS
            (Smcr, 0 | 4) => 3,
            (Smcr, 8) => 4,
            (Smcr, 12) => 2,
            (Cnt | Arr | Ccr1 | Ccr2 | Ccr3 | Ccr4, 0) => counter,
            (Psc, 0) => 16,
            (Rcr, 0) => 8,
            // DTG, LOCK
            (Bdtr, 0) => 8,
            (Bdtr, 8) => 2,
            // DBA, DBL
            (Dcr, 0 | 8) => 5,
            (Dmar, 0) => {
                if self.class() == Class::Advanced {
                    32
                } else {
                    16
                }
            }
            (Tim2Or | Tim5Or | Tim11Or, _) => match self.option_bits(reg) {
                Some((pos, _)) if pos == bit => 2,
                _ => 1,
            },
            _ => 1,
        }
    }

    fn access(&self, reg: TimerRegister) -> Access {
        match reg {
            TimerRegister::Egr => Access::WriteOnly,
            _ => Access::ReadWrite,
        }
    }
}

/// Direction of a capture/compare channel, which decides its CCMR layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcmrLayout {
    /// OCxFE, OCxPE, OCxM, OCxCE
    Output,
    /// ICxPSC, ICxF
    Input,
}

impl CcmrLayout {
    const fn width(self, field_bit: u8) -> Option<u8> {
        match (self, field_bit) {
            // CCxS
            (_, 0) => Some(2),
            (CcmrLayout::Output, 2 | 3 | 7) => Some(1),
            (CcmrLayout::Output, 4) => Some(3),
            (CcmrLayout::Input, 2) => Some(2),
            (CcmrLayout::Input, 4) => Some(4),
            _ => None,
        }
    }
}

/// Prescaler and auto-reload for a requested rate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    pub psc: u16,
    pub arr: u32,
    /// `input / ((psc + 1) * (arr + 1))`, which integer rounding can move
    /// away from the request
    pub achieved: Hertz,
}

/// Finds the smallest prescaler whose auto-reload fits in `max_arr`
///
/// The search starts at `input / (target * (max_arr + 1))`, clamped to 16
/// bits, and walks up one prescaler step at a time. `None` if the input or
/// the target is zero, or if no 16-bit prescaler works.
pub fn calculate(input: Hertz, target: Hertz, max_arr: u32) -> Option<Timing> {
    let input = u64::from(input.0);
    let target = u64::from(target.0);
    if input == 0 || target == 0 {
        return None;
    }

    let start = (input / (target * (u64::from(max_arr) + 1))).min(0xFFFF);
    for psc in start..=0xFFFF {
        let reload = input / (target * (psc + 1));
        if reload == 0 {
            // a larger prescaler only makes this smaller
            return None;
        }
        let arr = reload - 1;
        if arr <= u64::from(max_arr) {
            return Some(Timing {
                psc: u16(psc).ok()?,
                arr: u32(arr).ok()?,
                achieved: Hertz(u32(input / ((psc + 1) * reload)).ok()?),
            });
        }
    }
    None
}

/// Interrupt events
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Timer timed out / count down ended
    TimeOut,
}

/// Timer errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No prescaler / auto-reload pair reaches the requested rate
    RateOutOfRange,
}

mod bits {
    pub const CEN: u8 = 0;
    pub const UIE: u8 = 0;
    pub const UIF: u8 = 0;
    pub const UG: u8 = 0;
}

/// Hardware timers
pub struct Timer<B> {
    regs: Registers<Instance, B>,
    input: Hertz,
    timing: Option<Timing>,
}

impl<B: RegisterBus> Timer<B> {
    /// Wraps `instance` clocked at `input`, without touching the hardware
    pub const fn new(bus: B, instance: Instance, input: Hertz) -> Self {
        Timer {
            regs: Registers::new(instance, bus),
            input,
            timing: None,
        }
    }

    pub fn instance(&self) -> Instance {
        *self.regs.map()
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: TimerRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: TimerRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    /// Writes a CCMR field of capture/compare `channel` (1 to 4)
    ///
    /// `field_bit` is the position within the channel's byte, as laid out
    /// for `layout`. Channels the instance does not have and positions that
    /// start no field are ignored.
    pub fn write_ccmr(&self, channel: u8, layout: CcmrLayout, field_bit: u8, value: u32) {
        if let Some((addr, pos, width)) = self.ccmr_field(channel, layout, field_bit) {
            field::write_bits(self.regs.bus(), addr, pos, width, value);
        }
    }

    /// Reads a CCMR field, see [`Timer::write_ccmr`]
    pub fn read_ccmr(&self, channel: u8, layout: CcmrLayout, field_bit: u8) -> u32 {
        match self.ccmr_field(channel, layout, field_bit) {
            Some((addr, pos, width)) => field::read_bits(self.regs.bus(), addr, pos, width),
            None => field::INVALID,
        }
    }

    fn ccmr_field(&self, channel: u8, layout: CcmrLayout, field_bit: u8) -> Option<(usize, u8, u8)> {
        let instance = self.instance();
        if channel == 0 || channel > instance.class().channels() {
            return None;
        }
        let width = layout.width(field_bit)?;
        let reg = if channel <= 2 {
            TimerRegister::Ccmr1
        } else {
            TimerRegister::Ccmr2
        };
        let pos = (if channel % 2 == 1 { 0 } else { 8 }) + field_bit;

        let span = ((1u32 << width) - 1) << pos;
        if span & !instance.class_bits(reg) != 0 {
            return None;
        }
        Some((instance.address(reg)?, pos, width))
    }

    /// Programs the counter for `rate` and starts it, without interrupts
    pub fn start_rate(&mut self, rate: Hertz) -> Result<Timing, Error> {
        let timing = calculate(self.input, rate, self.instance().class().max_arr())
            .ok_or(Error::RateOutOfRange)?;

        // pause
        self.regs.clear(bits::CEN, TimerRegister::Cr1);

        self.regs.write(0, TimerRegister::Psc, u32::from(timing.psc));
        self.regs.write(0, TimerRegister::Arr, timing.arr);

        // Trigger an update event to load the prescaler value to the clock
        self.regs.set(bits::UG, TimerRegister::Egr);
        // The above line raises an update event which will indicate
        // that the timer is already finished. Since this is not the case,
        // it should be cleared
        self.clear_update();

        self.regs.set(bits::CEN, TimerRegister::Cr1);
        self.timing = Some(timing);
        Ok(timing)
    }

    /// Timing currently programmed
    pub fn timing(&self) -> Option<Timing> {
        self.timing
    }

    /// Starts listening for an `event`
    pub fn listen(&mut self, event: Event) {
        match event {
            Event::TimeOut => self.regs.set(bits::UIE, TimerRegister::Dier),
        }
    }

    /// Stops listening for an `event`
    pub fn unlisten(&mut self, event: Event) {
        match event {
            Event::TimeOut => self.regs.clear(bits::UIE, TimerRegister::Dier),
        }
    }

    /// Clears Update Interrupt Flag
    ///
    /// If the flag is not cleared, the interrupt retriggers as soon as the
    /// ISR returns.
    #[inline(always)]
    pub fn clear_update(&self) {
        self.regs.clear(bits::UIF, TimerRegister::Sr);
    }

    /// Whether an update event is pending
    #[inline(always)]
    pub fn is_update_pending(&self) -> bool {
        self.regs.is_set(bits::UIF, TimerRegister::Sr)
    }

    /// Get the count of the timer.
    pub fn count(&self) -> u32 {
        self.regs.read(0, TimerRegister::Cnt)
    }

    /// Releases the bus, pausing the counter
    pub fn free(self) -> B {
        self.regs.clear(bits::CEN, TimerRegister::Cr1);
        self.regs.free().1
    }
}

impl<B: RegisterBus + Copy> Timer<B> {
    /// Turns `instance` into a periodic interrupt source at `rate`
    ///
    /// Enables the timer clock, programs PSC and ARR, loads them with an
    /// update event, unmasks the update interrupt in the timer and in the
    /// NVIC, then starts counting.
    pub fn tick(bus: B, instance: Instance, clocks: &Clocks, rate: Hertz) -> Result<Self, Error> {
        Rcc::new(bus).enable(instance.peripheral());

        let mut timer = Timer::new(bus, instance, instance.clock(clocks));
        // keep the counter stopped until the interrupt is armed
        let timing = calculate(timer.input, rate, instance.class().max_arr())
            .ok_or(Error::RateOutOfRange)?;
        timer.regs.write(0, TimerRegister::Psc, u32::from(timing.psc));
        timer.regs.write(0, TimerRegister::Arr, timing.arr);
        timer.regs.set(bits::UG, TimerRegister::Egr);
        timer.clear_update();
        timer.listen(Event::TimeOut);

        Nvic::new(bus).enable(instance.update_irq());

        timer.regs.set(bits::CEN, TimerRegister::Cr1);
        timer.timing = Some(timing);
        Ok(timer)
    }
}

impl<B: RegisterBus> Periodic for Timer<B> {}

impl<B: RegisterBus> CountDown for Timer<B> {
    type Time = Hertz;

    /// Restarts the counter at `timeout`
    ///
    /// A rate out of reach leaves the counter stopped, so `wait` blocks
    /// forever.
    fn start<T>(&mut self, timeout: T)
    where
        T: Into<Hertz>,
    {
        if self.start_rate(timeout.into()).is_err() {
            self.regs.clear(bits::CEN, TimerRegister::Cr1);
        }
    }

    fn wait(&mut self) -> nb::Result<(), Void> {
        if self.is_update_pending() {
            self.clear_update();
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}
