//! General Purpose Input / Output

use core::mem::offset_of;

use crate::bus::RegisterBus;
use crate::field::{Access, RegisterMap, Registers, INVALID};
use crate::map::{self, GpioBlock};
use crate::rcc::Peripheral;

/// Logical GPIO registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpioRegister {
    Moder,
    Otyper,
    Ospeedr,
    Pupdr,
    Idr,
    Odr,
    Bsrr,
    Lckr,
    Afrl,
    Afrh,
}

/// GPIO ports of the STM32F411
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
    H,
}

impl Port {
    /// Base address of the port
    pub const fn base(self) -> usize {
        match self {
            Port::A => map::GPIOA,
            Port::B => map::GPIOB,
            Port::C => map::GPIOC,
            Port::D => map::GPIOD,
            Port::E => map::GPIOE,
            Port::H => map::GPIOH,
        }
    }

    /// Index used by the SYSCFG EXTI routing fields
    pub const fn index(self) -> u8 {
        match self {
            Port::A => 0,
            Port::B => 1,
            Port::C => 2,
            Port::D => 3,
            Port::E => 4,
            Port::H => 7,
        }
    }

    /// Clock gate of the port
    pub const fn peripheral(self) -> Peripheral {
        match self {
            Port::A => Peripheral::GpioA,
            Port::B => Peripheral::GpioB,
            Port::C => Peripheral::GpioC,
            Port::D => Peripheral::GpioD,
            Port::E => Peripheral::GpioE,
            Port::H => Peripheral::GpioH,
        }
    }
}

impl RegisterMap for Port {
    type Register = GpioRegister;

    fn address(&self, reg: GpioRegister) -> Option<usize> {
        use GpioRegister::*;

        let offset = match reg {
            Moder => offset_of!(GpioBlock, moder),
            Otyper => offset_of!(GpioBlock, otyper),
            Ospeedr => offset_of!(GpioBlock, ospeedr),
            Pupdr => offset_of!(GpioBlock, pupdr),
            Idr => offset_of!(GpioBlock, idr),
            Odr => offset_of!(GpioBlock, odr),
            Bsrr => offset_of!(GpioBlock, bsrr),
            Lckr => offset_of!(GpioBlock, lckr),
            Afrl => offset_of!(GpioBlock, afrl),
            Afrh => offset_of!(GpioBlock, afrh),
        };
        Some(self.base() + offset)
    }

    fn valid_bits(&self, reg: GpioRegister) -> u32 {
        use GpioRegister::*;

        match reg {
            Otyper | Idr | Odr => 0x0000_FFFF,
            Lckr => 0x0001_FFFF,
            Moder | Ospeedr | Pupdr | Bsrr | Afrl | Afrh => u32::MAX,
        }
    }

    fn field_width(&self, reg: GpioRegister, bit: u8) -> u8 {
        use GpioRegister::*;

        match reg {
            Moder | Ospeedr | Pupdr if bit % 2 == 0 => 2,
            Afrl | Afrh if bit % 4 == 0 => 4,
            _ => 1,
        }
    }

    fn access(&self, reg: GpioRegister) -> Access {
        match reg {
            GpioRegister::Idr => Access::ReadOnly,
            GpioRegister::Bsrr => Access::WriteOnly,
            _ => Access::ReadWrite,
        }
    }
}

/// Which pin setting a [`Gpio::write_pin`] / [`Gpio::read_pin`] call targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinMode {
    Moder,
    Otyper,
    Ospeedr,
    Pupdr,
    Odr,
    Idr,
    /// 1 drives the pin high through the set half, 0 low through the reset half
    Bsrr,
    /// Alternate function of pins 0 to 7
    Afrl,
    /// Alternate function of pins 8 to 15
    Afrh,
}

/// GPIO Pin speed selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Low = 0,
    Medium = 1,
    High = 2,
    VeryHigh = 3,
}

/// Internal pull resistor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pull {
    None = 0,
    Up = 1,
    Down = 2,
}

/// Output driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OutputType {
    PushPull = 0,
    OpenDrain = 1,
}

mod moder {
    pub const INPUT: u32 = 0b00;
    pub const OUTPUT: u32 = 0b01;
    pub const ALTERNATE: u32 = 0b10;
    pub const ANALOG: u32 = 0b11;
}

const LCKK: u32 = 1 << 16;

/// One GPIO port
pub struct Gpio<B> {
    regs: Registers<Port, B>,
}

impl<B: RegisterBus> Gpio<B> {
    /// Wraps `port` on `bus`
    ///
    /// The port clock has to be enabled through the RCC first.
    pub const fn new(bus: B, port: Port) -> Self {
        Gpio {
            regs: Registers::new(port, bus),
        }
    }

    pub fn port(&self) -> Port {
        *self.regs.map()
    }

    pub fn bus(&self) -> &B {
        self.regs.bus()
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: GpioRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: GpioRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    /// Writes the `mode` setting of `pin`
    ///
    /// Pins above 15, reads-only settings, BSRR values other than 0 and 1 and
    /// the AFR half that does not hold `pin` are ignored.
    pub fn write_pin(&self, pin: u8, mode: PinMode, value: u32) {
        if pin > 15 {
            return;
        }

        match mode {
            PinMode::Moder => self.write(pin * 2, GpioRegister::Moder, value),
            PinMode::Otyper => self.write(pin, GpioRegister::Otyper, value),
            PinMode::Ospeedr => self.write(pin * 2, GpioRegister::Ospeedr, value),
            PinMode::Pupdr => self.write(pin * 2, GpioRegister::Pupdr, value),
            PinMode::Odr => self.write(pin, GpioRegister::Odr, value),
            PinMode::Idr => self.write(pin, GpioRegister::Idr, value),
            PinMode::Bsrr => match value {
                1 => self.write(pin, GpioRegister::Bsrr, 1),
                0 => self.write(pin + 16, GpioRegister::Bsrr, 1),
                _ => {}
            },
            PinMode::Afrl if pin < 8 => self.write(pin * 4, GpioRegister::Afrl, value),
            PinMode::Afrh if pin >= 8 => self.write((pin - 8) * 4, GpioRegister::Afrh, value),
            PinMode::Afrl | PinMode::Afrh => {}
        }
    }

    /// Reads the `mode` setting of `pin`
    ///
    /// `None` for pins above 15, for BSRR and for the AFR half that does not
    /// hold `pin`.
    pub fn read_pin(&self, pin: u8, mode: PinMode) -> Option<u32> {
        if pin > 15 {
            return None;
        }

        let value = match mode {
            PinMode::Moder => self.read(pin * 2, GpioRegister::Moder),
            PinMode::Otyper => self.read(pin, GpioRegister::Otyper),
            PinMode::Ospeedr => self.read(pin * 2, GpioRegister::Ospeedr),
            PinMode::Pupdr => self.read(pin * 2, GpioRegister::Pupdr),
            PinMode::Odr => self.read(pin, GpioRegister::Odr),
            PinMode::Idr => self.read(pin, GpioRegister::Idr),
            PinMode::Afrl if pin < 8 => self.read(pin * 4, GpioRegister::Afrl),
            PinMode::Afrh if pin >= 8 => self.read((pin - 8) * 4, GpioRegister::Afrh),
            PinMode::Bsrr | PinMode::Afrl | PinMode::Afrh => INVALID,
        };

        if value == INVALID {
            None
        } else {
            Some(value)
        }
    }

    /// Freezes the configuration of `pin` until the next reset
    ///
    /// Runs the LCKR key sequence (write 1, write 0, write 1, read, read) and
    /// reports whether LCKK reads back set.
    pub fn lock_pin(&self, pin: u8) -> bool {
        if pin > 15 {
            return false;
        }
        let addr = match self.regs.map().address(GpioRegister::Lckr) {
            Some(addr) => addr,
            None => return false,
        };
        let bus = self.regs.bus();
        let key = 1 << pin;

        // any deviation from this exact sequence aborts the lock
        bus.write(addr, LCKK | key);
        bus.write(addr, key);
        bus.write(addr, LCKK | key);
        bus.read(addr);
        bus.read(addr) & LCKK != 0
    }

    /// Configures `pin` as a push-pull output
    pub fn into_output(&self, pin: u8) {
        self.write_pin(pin, PinMode::Otyper, OutputType::PushPull as u32);
        self.write_pin(pin, PinMode::Moder, moder::OUTPUT);
    }

    /// Configures `pin` as a floating input
    pub fn into_input(&self, pin: u8) {
        self.write_pin(pin, PinMode::Moder, moder::INPUT);
    }

    /// Routes alternate function `af` to `pin`
    pub fn into_alternate(&self, pin: u8, af: u8) {
        if af > 15 {
            return;
        }
        let half = if pin < 8 { PinMode::Afrl } else { PinMode::Afrh };
        self.write_pin(pin, half, u32::from(af));
        self.write_pin(pin, PinMode::Moder, moder::ALTERNATE);
    }

    /// Configures `pin` as an analog input
    pub fn into_analog(&self, pin: u8) {
        self.write_pin(pin, PinMode::Moder, moder::ANALOG);
    }

    pub fn set_output_type(&self, pin: u8, otype: OutputType) {
        self.write_pin(pin, PinMode::Otyper, otype as u32);
    }

    pub fn set_speed(&self, pin: u8, speed: Speed) {
        self.write_pin(pin, PinMode::Ospeedr, speed as u32);
    }

    pub fn set_pull(&self, pin: u8, pull: Pull) {
        self.write_pin(pin, PinMode::Pupdr, pull as u32);
    }

    /// Drives `pin` high through the set half of BSRR
    #[inline]
    pub fn set_high(&self, pin: u8) {
        self.write_pin(pin, PinMode::Bsrr, 1);
    }

    /// Drives `pin` low through the reset half of BSRR
    #[inline]
    pub fn set_low(&self, pin: u8) {
        self.write_pin(pin, PinMode::Bsrr, 0);
    }

    /// Whether the output latch of `pin` is high
    pub fn is_set_high(&self, pin: u8) -> bool {
        self.read_pin(pin, PinMode::Odr) == Some(1)
    }

    pub fn toggle(&self, pin: u8) {
        if self.is_set_high(pin) {
            self.set_low(pin)
        } else {
            self.set_high(pin)
        }
    }

    /// Whether `pin` reads as high
    pub fn is_high(&self, pin: u8) -> bool {
        self.read_pin(pin, PinMode::Idr) == Some(1)
    }
}
