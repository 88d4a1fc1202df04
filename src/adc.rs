//! Analog to digital converter
//!
//! ADC1 and its common registers. Single regular conversions go through
//! `embedded_hal`'s `OneShot`; the internal temperature sensor is sampled as
//! an injected conversion so it never disturbs the regular sequence.

use core::mem::offset_of;

use crate::bus::RegisterBus;
use crate::field::{Access, RegisterMap, Registers};
use crate::hal::adc::{Channel, OneShot};
use crate::map::{self, AdcBlock, AdcCommonBlock};
use crate::rcc::{Peripheral, Rcc};

/// Input wired to the temperature sensor
pub const TEMPERATURE_CHANNEL: u8 = 16;
/// Internal reference voltage input
pub const VREFINT_CHANNEL: u8 = 17;
/// Highest input channel
pub const MAX_CHANNEL: u8 = 18;

/// Logical ADC registers, ADC1 followed by the common block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcRegister {
    Sr,
    Cr1,
    Cr2,
    Smpr1,
    Smpr2,
    Jofr1,
    Jofr2,
    Jofr3,
    Jofr4,
    Htr,
    Ltr,
    Sqr1,
    Sqr2,
    Sqr3,
    Jsqr,
    Jdr1,
    Jdr2,
    Jdr3,
    Jdr4,
    Dr,
    Csr,
    Ccr,
    Cdr,
}

/// Register description of ADC1
#[derive(Clone, Copy, Debug, Default)]
pub struct AdcMap;

impl RegisterMap for AdcMap {
    type Register = AdcRegister;

    fn address(&self, reg: AdcRegister) -> Option<usize> {
        use AdcRegister::*;

        let jofr = offset_of!(AdcBlock, jofr);
        let jdr = offset_of!(AdcBlock, jdr);
        let addr = match reg {
            Sr => map::ADC1 + offset_of!(AdcBlock, sr),
            Cr1 => map::ADC1 + offset_of!(AdcBlock, cr1),
            Cr2 => map::ADC1 + offset_of!(AdcBlock, cr2),
            Smpr1 => map::ADC1 + offset_of!(AdcBlock, smpr1),
            Smpr2 => map::ADC1 + offset_of!(AdcBlock, smpr2),
            Jofr1 => map::ADC1 + map::nth(jofr, 0),
            Jofr2 => map::ADC1 + map::nth(jofr, 1),
            Jofr3 => map::ADC1 + map::nth(jofr, 2),
            Jofr4 => map::ADC1 + map::nth(jofr, 3),
            Htr => map::ADC1 + offset_of!(AdcBlock, htr),
            Ltr => map::ADC1 + offset_of!(AdcBlock, ltr),
            Sqr1 => map::ADC1 + offset_of!(AdcBlock, sqr1),
            Sqr2 => map::ADC1 + offset_of!(AdcBlock, sqr2),
            Sqr3 => map::ADC1 + offset_of!(AdcBlock, sqr3),
            Jsqr => map::ADC1 + offset_of!(AdcBlock, jsqr),
            Jdr1 => map::ADC1 + map::nth(jdr, 0),
            Jdr2 => map::ADC1 + map::nth(jdr, 1),
            Jdr3 => map::ADC1 + map::nth(jdr, 2),
            Jdr4 => map::ADC1 + map::nth(jdr, 3),
            Dr => map::ADC1 + offset_of!(AdcBlock, dr),
            Csr => map::ADC_COMMON + offset_of!(AdcCommonBlock, csr),
            Ccr => map::ADC_COMMON + offset_of!(AdcCommonBlock, ccr),
            Cdr => map::ADC_COMMON + offset_of!(AdcCommonBlock, cdr),
        };
        Some(addr)
    }

    fn valid_bits(&self, reg: AdcRegister) -> u32 {
        use AdcRegister::*;

        match reg {
            Sr => 0x3F,
            Cr1 => 0x07C0_FFFF,
            Cr2 => 0x7F7F_0F03,
            Smpr1 => 0x07FF_FFFF,
            Smpr2 | Sqr2 | Sqr3 => 0x3FFF_FFFF,
            Jofr1 | Jofr2 | Jofr3 | Jofr4 | Htr | Ltr => 0xFFF,
            Sqr1 => 0x00FF_FFFF,
            Jsqr => 0x003F_FFFF,
            Jdr1 | Jdr2 | Jdr3 | Jdr4 | Dr => 0xFFFF,
            Csr => 0x3F,
            // ADCPRE, VBATE, TSVREFE
            Ccr => 0x00C3_0000,
            Cdr => u32::MAX,
        }
    }

    fn field_width(&self, reg: AdcRegister, bit: u8) -> u8 {
        use AdcRegister::*;

        match (reg, bit) {
            // AWDCH, DISCNUM, RES
            (Cr1, 0) => 5,
            (Cr1, 13) => 3,
            (Cr1, 24) => 2,
            // JEXTSEL, EXTSEL / JEXTEN, EXTEN
            (Cr2, 16 | 24) => 4,
            (Cr2, 20 | 28) => 2,
            (Smpr1 | Smpr2, b) if b % 3 == 0 => 3,
            (Jofr1 | Jofr2 | Jofr3 | Jofr4 | Htr | Ltr, 0) => 12,
            (Sqr1, 0 | 5 | 10 | 15) => 5,
            (Sqr1, 20) => 4,
            (Sqr2 | Sqr3, b) if b % 5 == 0 => 5,
            (Jsqr, 0 | 5 | 10 | 15) => 5,
            (Jsqr, 20) => 2,
            (Jdr1 | Jdr2 | Jdr3 | Jdr4 | Dr, 0) => 16,
            (Ccr, 16) => 2,
            (Cdr, 0 | 16) => 16,
            _ => 1,
        }
    }

    fn access(&self, reg: AdcRegister) -> Access {
        match reg {
            AdcRegister::Csr | AdcRegister::Cdr => Access::ReadOnly,
            _ => Access::ReadWrite,
        }
    }
}

mod sr {
    pub const EOC: u8 = 1;
    pub const JEOC: u8 = 2;
}

mod cr2 {
    pub const ADON: u8 = 0;
    pub const JSWSTART: u8 = 22;
    pub const SWSTART: u8 = 30;
}

mod ccr {
    pub const ADCPRE: u8 = 16;
    pub const TSVREFE: u8 = 23;
}

mod sqr1 {
    pub const L: u8 = 20;
}

mod jsqr {
    pub const JSQ4: u8 = 15;
    pub const JL: u8 = 20;
}

/// ADC Sampling time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleTime {
    /// 3 ADC clock cycles
    Cycles3 = 0b000,
    /// 15 ADC clock cycles
    Cycles15 = 0b001,
    /// 28 ADC clock cycles
    Cycles28 = 0b010,
    /// 56 ADC clock cycles
    Cycles56 = 0b011,
    /// 84 ADC clock cycles
    Cycles84 = 0b100,
    /// 112 ADC clock cycles
    Cycles112 = 0b101,
    /// 144 ADC clock cycles
    Cycles144 = 0b110,
    /// 480 ADC clock cycles
    Cycles480 = 0b111,
}

/// Division of PCLK2 feeding the converter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Prescaler {
    Div2 = 0b00,
    Div4 = 0b01,
    Div6 = 0b10,
    Div8 = 0b11,
}

/// Converts a 12-bit sample of the temperature sensor to degrees Celsius
///
/// Assumes a 3.0 V reference, 0.76 V at 25 °C and 2.5 mV/°C.
pub fn to_celsius(raw: u16) -> f32 {
    let v_in = f32::from(raw) * 3.0 / 4095.0;
    (v_in - 0.76) / 0.0025 + 25.0
}

/// An ADC input channel, for `OneShot`
pub struct AdcIn<const CH: u8>;

/// The temperature sensor input
pub type VTemp = AdcIn<TEMPERATURE_CHANNEL>;

/// The internal reference voltage input
pub type VRef = AdcIn<VREFINT_CHANNEL>;

impl<B, const CH: u8> Channel<Adc<B>> for AdcIn<CH> {
    type ID = u8;

    fn channel() -> u8 {
        CH
    }
}

/// Analog to Digital Converter
pub struct Adc<B> {
    regs: Registers<AdcMap, B>,
}

impl<B: RegisterBus> Adc<B> {
    /// Wraps ADC1; its clock must already be enabled
    pub const fn new(bus: B) -> Self {
        Adc {
            regs: Registers::new(AdcMap, bus),
        }
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: AdcRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: AdcRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    pub fn enable(&mut self) {
        self.regs.set(cr2::ADON, AdcRegister::Cr2);
    }

    pub fn disable(&mut self) {
        self.regs.clear(cr2::ADON, AdcRegister::Cr2);
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.is_set(cr2::ADON, AdcRegister::Cr2)
    }

    pub fn set_prescaler(&mut self, prescaler: Prescaler) {
        self.regs.write(ccr::ADCPRE, AdcRegister::Ccr, prescaler as u32);
    }

    /// Sets the sampling time of `channel`; `false` if there is no such input
    pub fn set_sample_time(&mut self, channel: u8, sample_time: SampleTime) -> bool {
        let (reg, slot) = match channel {
            0..=9 => (AdcRegister::Smpr2, channel),
            10..=MAX_CHANNEL => (AdcRegister::Smpr1, channel - 10),
            _ => return false,
        };
        self.regs.write(3 * slot, reg, sample_time as u32);
        true
    }

    /// Connects the temperature sensor and VREFINT
    pub fn enable_temperature_sensor(&mut self) {
        self.regs.set(ccr::TSVREFE, AdcRegister::Ccr);
    }

    /// One conversion of the injected channel set up by `init_temperature_sensor`
    pub fn read_temperature(&mut self) -> f32 {
        self.regs.set(cr2::JSWSTART, AdcRegister::Cr2);
        self.regs.spin_until(sr::JEOC, AdcRegister::Sr, 1);
        self.regs.clear(sr::JEOC, AdcRegister::Sr);

        to_celsius(self.regs.read(0, AdcRegister::Jdr1) as u16)
    }

    /// A single regular conversion of `channel`
    ///
    /// Returns `None` for a channel the converter does not have.
    pub fn convert(&mut self, channel: u8) -> Option<u16> {
        if channel > MAX_CHANNEL {
            return None;
        }
        self.regs.write(sqr1::L, AdcRegister::Sqr1, 0);
        self.regs.write(0, AdcRegister::Sqr3, u32::from(channel));

        self.regs.set(cr2::SWSTART, AdcRegister::Cr2);
        self.regs.spin_until(sr::EOC, AdcRegister::Sr, 1);

        // reading DR clears EOC
        Some(self.regs.read(0, AdcRegister::Dr) as u16)
    }
}

impl<B: RegisterBus + Copy> Adc<B> {
    /// Brings up ADC1 for the temperature sensor
    ///
    /// The sensor needs at least 10 µs of sampling, so channel 16 gets the
    /// longest sampling time. It is the only entry of the injected sequence,
    /// which with JL = 0 is taken from JSQ4.
    pub fn init_temperature_sensor(bus: B) -> Self {
        Rcc::new(bus).enable(Peripheral::Adc1);

        let mut adc = Adc::new(bus);
        adc.set_prescaler(Prescaler::Div2);
        adc.set_sample_time(TEMPERATURE_CHANNEL, SampleTime::Cycles480);
        adc.regs.write(jsqr::JL, AdcRegister::Jsqr, 0);
        adc.regs
            .write(jsqr::JSQ4, AdcRegister::Jsqr, u32::from(TEMPERATURE_CHANNEL));
        adc.enable_temperature_sensor();
        adc.enable();
        adc
    }
}

impl<B, WORD, PIN> OneShot<Adc<B>, WORD, PIN> for Adc<B>
where
    B: RegisterBus,
    WORD: From<u16>,
    PIN: Channel<Adc<B>, ID = u8>,
{
    type Error = ();

    fn read(&mut self, _pin: &mut PIN) -> nb::Result<WORD, Self::Error> {
        self.convert(PIN::channel())
            .map(WORD::from)
            .ok_or(nb::Error::Other(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::INVALID;
    use crate::mock::MockBus;

    const SR: usize = map::ADC1;
    const CR2: usize = map::ADC1 + 0x08;
    const SMPR1: usize = map::ADC1 + 0x0C;
    const SMPR2: usize = map::ADC1 + 0x10;
    const SQR3: usize = map::ADC1 + 0x34;
    const JSQR: usize = map::ADC1 + 0x38;
    const JDR1: usize = map::ADC1 + 0x3C;
    const DR: usize = map::ADC1 + 0x4C;
    const CCR: usize = map::ADC_COMMON + 0x04;

    #[test]
    fn mid_scale_reads_321_degrees() {
        let t = to_celsius(2048);
        assert!((t - 321.15).abs() < 0.1, "{}", t);
        assert!((to_celsius(0) - (-279.0)).abs() < 0.01);
    }

    #[test]
    fn temperature_sensor_setup() {
        let bus = MockBus::new();
        bus.set(CCR, 0b11 << 16);

        let adc = Adc::init_temperature_sensor(&bus);

        assert_eq!(bus.get(map::RCC + 0x44), 1 << 8);
        assert_eq!(bus.get(CCR), 1 << 23);
        assert_eq!(bus.get(SMPR1), 0b111 << 18);
        assert_eq!(bus.get(JSQR), 16 << 15);
        assert_eq!(bus.get(CR2), 1);
        assert!(adc.is_enabled());
    }

    #[test]
    fn temperature_conversion() {
        let bus = MockBus::new();
        bus.set(CR2, 1);
        bus.set(SR, 1 << 2);
        bus.set(JDR1, 2048);
        let mut adc = Adc::new(&bus);

        let t = adc.read_temperature();

        assert!((t - 321.15).abs() < 0.1);
        assert_eq!(bus.get(CR2), 1 | (1 << 22));
        assert_eq!(bus.get(SR), 0);
    }

    #[test]
    fn sample_time_slots() {
        let bus = MockBus::new();
        let mut adc = Adc::new(&bus);

        assert!(adc.set_sample_time(5, SampleTime::Cycles84));
        assert!(adc.set_sample_time(18, SampleTime::Cycles15));
        assert!(!adc.set_sample_time(19, SampleTime::Cycles15));

        assert_eq!(bus.get(SMPR2), 0b100 << 15);
        assert_eq!(bus.get(SMPR1), 0b001 << 24);
    }

    #[test]
    fn one_shot_conversion() {
        let bus = MockBus::new();
        bus.set(SR, 1 << 1);
        bus.set(DR, 0x0ABC);
        let mut adc = Adc::new(&bus);

        let value: u16 = OneShot::read(&mut adc, &mut AdcIn::<3>).unwrap();

        assert_eq!(value, 0x0ABC);
        assert_eq!(bus.get(SQR3), 3);
        assert_eq!(bus.get(CR2), 1 << 30);

        let missing: nb::Result<u16, ()> = OneShot::read(&mut adc, &mut AdcIn::<19>);
        assert_eq!(missing, Err(nb::Error::Other(())));
    }

    #[test]
    fn register_validation() {
        let bus = MockBus::new();
        let adc = Adc::new(&bus);

        adc.write(0, AdcRegister::Ccr, 1);
        adc.write(0, AdcRegister::Csr, 1);
        adc.write(27, AdcRegister::Smpr1, 1);
        adc.write(20, AdcRegister::Jsqr, 4);
        adc.write(0, AdcRegister::Jofr2, 0x1000);
        assert_eq!(bus.total_writes(), 0);
        assert_eq!(adc.read(6, AdcRegister::Sr), INVALID);

        adc.write(20, AdcRegister::Sqr1, 0xF);
        adc.write(20, AdcRegister::Jsqr, 3);
        assert_eq!(adc.read(20, AdcRegister::Sqr1), 0xF);
        assert_eq!(adc.read(20, AdcRegister::Jsqr), 3);
    }
}
