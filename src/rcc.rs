//! Reset and Clock Control

use core::mem::offset_of;

use cast::u32;

use crate::bus::RegisterBus;
use crate::field::{RegisterMap, Registers};
use crate::flash::Flash;
use crate::map::{self, RccBlock};
use crate::time::Hertz;

/// Internal 16 MHz RC oscillator, the clock source out of reset
pub const HSI: u32 = 16_000_000;

/// HSE ready polls before giving up
pub const HSERDY_TIMEOUT: u32 = 0x2000;
/// PLL lock polls before giving up
pub const PLLRDY_TIMEOUT: u32 = 0x4000;
/// System clock switch polls before giving up
pub const SWS_TIMEOUT: u32 = 0x4000;

const VCO_MIN: u64 = 100_000_000;
const VCO_MAX: u64 = 432_000_000;
const SYSCLK_MAX: u32 = 100_000_000;
const PCLK1_MAX: u32 = 50_000_000;

/// Logical RCC registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RccRegister {
    Cr,
    PllCfgr,
    Cfgr,
    Cir,
    Ahb1Rstr,
    Ahb2Rstr,
    Apb1Rstr,
    Apb2Rstr,
    Ahb1Enr,
    Ahb2Enr,
    Apb1Enr,
    Apb2Enr,
    Ahb1LpEnr,
    Ahb2LpEnr,
    Apb1LpEnr,
    Apb2LpEnr,
    Bdcr,
    Csr,
    Sscgr,
    PllI2sCfgr,
    DckCfgr,
}

const AHB1_ENR_VALID: u32 = 0x1F | (1 << 7) | (1 << 12) | (1 << 21) | (1 << 22);
const APB1_VALID: u32 =
    !(0x7F0 | (1 << 12) | (1 << 13) | (1 << 16) | 0x001C_0000 | 0x0F00_0000 | 0xE000_0000);
const APB2_VALID: u32 = !(0xE
    | (1 << 6)
    | (1 << 7)
    | (1 << 9)
    | (1 << 10)
    | (1 << 15)
    | (1 << 19)
    | 0xFFE0_0000);

/// Register description of the RCC
#[derive(Clone, Copy, Debug, Default)]
pub struct RccMap;

impl RegisterMap for RccMap {
    type Register = RccRegister;

    fn address(&self, reg: RccRegister) -> Option<usize> {
        use RccRegister::*;

        let offset = match reg {
            Cr => offset_of!(RccBlock, cr),
            PllCfgr => offset_of!(RccBlock, pllcfgr),
            Cfgr => offset_of!(RccBlock, cfgr),
            Cir => offset_of!(RccBlock, cir),
            Ahb1Rstr => offset_of!(RccBlock, ahb1rstr),
            Ahb2Rstr => offset_of!(RccBlock, ahb2rstr),
            Apb1Rstr => offset_of!(RccBlock, apb1rstr),
            Apb2Rstr => offset_of!(RccBlock, apb2rstr),
            Ahb1Enr => offset_of!(RccBlock, ahb1enr),
            Ahb2Enr => offset_of!(RccBlock, ahb2enr),
            Apb1Enr => offset_of!(RccBlock, apb1enr),
            Apb2Enr => offset_of!(RccBlock, apb2enr),
            Ahb1LpEnr => offset_of!(RccBlock, ahb1lpenr),
            Ahb2LpEnr => offset_of!(RccBlock, ahb2lpenr),
            Apb1LpEnr => offset_of!(RccBlock, apb1lpenr),
            Apb2LpEnr => offset_of!(RccBlock, apb2lpenr),
            Bdcr => offset_of!(RccBlock, bdcr),
            Csr => offset_of!(RccBlock, csr),
            Sscgr => offset_of!(RccBlock, sscgr),
            PllI2sCfgr => offset_of!(RccBlock, plli2scfgr),
            DckCfgr => offset_of!(RccBlock, dckcfgr),
        };
        Some(map::RCC + offset)
    }

    fn valid_bits(&self, reg: RccRegister) -> u32 {
        use RccRegister::*;

        match reg {
            Cr => !((1 << 2) | 0x00F0_0000 | 0xF000_0000),
            PllCfgr => !((1 << 15) | 0x003C_0000 | (1 << 23) | 0xF000_0000),
            Cfgr => !((1 << 8) | (1 << 9)),
            Cir => !((1 << 6) | (1 << 14) | (1 << 15) | (1 << 22) | 0xFF00_0000),
            Ahb1Rstr => !((1 << 5) | (1 << 6) | 0xF00 | 0x001F_E000 | 0xFF80_0000),
            Ahb2Rstr | Ahb2Enr | Ahb2LpEnr => 1 << 7,
            Apb1Rstr | Apb1Enr | Apb1LpEnr => APB1_VALID,
            Apb2Rstr | Apb2Enr | Apb2LpEnr => APB2_VALID,
            Ahb1Enr => AHB1_ENR_VALID,
            Ahb1LpEnr => !((1 << 5)
                | (1 << 6)
                | 0xF00
                | (1 << 13)
                | (1 << 14)
                | 0x001E_0000
                | 0xFF80_0000),
            Bdcr => !(0xFFFE_0000 | 0x7C00 | 0xF0),
            Csr => !0x00FF_FFFC,
            Sscgr => !((1 << 28) | (1 << 29)),
            PllI2sCfgr => !((1 << 31) | 0x0FFF_8000),
            DckCfgr => 1 << 24,
        }
    }

    fn field_width(&self, reg: RccRegister, bit: u8) -> u8 {
        use RccRegister::*;

        match (reg, bit) {
            // HSITRIM, HSICAL
            (Cr, 3) => 5,
            (Cr, 8) => 8,
            // PLLM, PLLN, PLLP, PLLQ
            (PllCfgr, 0) => 6,
            (PllCfgr, 6) => 9,
            (PllCfgr, 16) => 2,
            (PllCfgr, 24) => 4,
            // SW, SWS, MCO1, MCO2
            (Cfgr, 0 | 2 | 21 | 30) => 2,
            // HPRE
            (Cfgr, 4) => 4,
            // PPRE1, PPRE2, MCO1PRE, MCO2PRE
            (Cfgr, 10 | 13 | 24 | 27) => 3,
            // RTCPRE
            (Cfgr, 16) => 5,
            // RTCSEL
            (Bdcr, 8) => 2,
            // MODPER, INCSTEP
            (Sscgr, 0) => 13,
            (Sscgr, 13) => 15,
            // PLLI2SM, PLLI2SN, PLLI2SR
            (PllI2sCfgr, 0) => 6,
            (PllI2sCfgr, 6) => 9,
            (PllI2sCfgr, 28) => 3,
            _ => 1,
        }
    }
}

mod cr {
    pub const HSEON: u8 = 16;
    pub const HSERDY: u8 = 17;
    pub const PLLON: u8 = 24;
    pub const PLLRDY: u8 = 25;
}

mod pllcfgr {
    pub const PLLM: u8 = 0;
    pub const PLLN: u8 = 6;
    pub const PLLP: u8 = 16;
    pub const PLLSRC: u8 = 22;
}

mod cfgr {
    pub const SW: u8 = 0;
    pub const SWS: u8 = 2;
    pub const HPRE: u8 = 4;
    pub const PPRE1: u8 = 10;
    pub const PPRE2: u8 = 13;
    pub const SW_PLL: u32 = 0b10;
}

/// Peripherals with a clock-enable bit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Peripheral {
    GpioA,
    GpioB,
    GpioC,
    GpioD,
    GpioE,
    GpioH,
    Crc,
    Dma1,
    Dma2,
    Tim2,
    Tim3,
    Tim4,
    Tim5,
    Wwdg,
    Spi2,
    Spi3,
    Usart2,
    I2c1,
    I2c2,
    I2c3,
    Pwr,
    Tim1,
    Usart1,
    Usart6,
    Adc1,
    Sdio,
    Spi1,
    Spi4,
    Syscfg,
    Tim9,
    Tim10,
    Tim11,
    Spi5,
}

/// Bus a peripheral hangs off
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bus {
    Ahb1,
    Apb1,
    Apb2,
}

impl Peripheral {
    /// The bus and the bit in its enable/reset registers
    pub const fn slot(self) -> (Bus, u8) {
        use Peripheral::*;

        match self {
            GpioA => (Bus::Ahb1, 0),
            GpioB => (Bus::Ahb1, 1),
            GpioC => (Bus::Ahb1, 2),
            GpioD => (Bus::Ahb1, 3),
            GpioE => (Bus::Ahb1, 4),
            GpioH => (Bus::Ahb1, 7),
            Crc => (Bus::Ahb1, 12),
            Dma1 => (Bus::Ahb1, 21),
            Dma2 => (Bus::Ahb1, 22),
            Tim2 => (Bus::Apb1, 0),
            Tim3 => (Bus::Apb1, 1),
            Tim4 => (Bus::Apb1, 2),
            Tim5 => (Bus::Apb1, 3),
            Wwdg => (Bus::Apb1, 11),
            Spi2 => (Bus::Apb1, 14),
            Spi3 => (Bus::Apb1, 15),
            Usart2 => (Bus::Apb1, 17),
            I2c1 => (Bus::Apb1, 21),
            I2c2 => (Bus::Apb1, 22),
            I2c3 => (Bus::Apb1, 23),
            Pwr => (Bus::Apb1, 28),
            Tim1 => (Bus::Apb2, 0),
            Usart1 => (Bus::Apb2, 4),
            Usart6 => (Bus::Apb2, 5),
            Adc1 => (Bus::Apb2, 8),
            Sdio => (Bus::Apb2, 11),
            Spi1 => (Bus::Apb2, 12),
            Spi4 => (Bus::Apb2, 13),
            Syscfg => (Bus::Apb2, 14),
            Tim9 => (Bus::Apb2, 16),
            Tim10 => (Bus::Apb2, 17),
            Tim11 => (Bus::Apb2, 18),
            Spi5 => (Bus::Apb2, 20),
        }
    }
}

impl Bus {
    const fn enr(self) -> RccRegister {
        match self {
            Bus::Ahb1 => RccRegister::Ahb1Enr,
            Bus::Apb1 => RccRegister::Apb1Enr,
            Bus::Apb2 => RccRegister::Apb2Enr,
        }
    }

    const fn rstr(self) -> RccRegister {
        match self {
            Bus::Ahb1 => RccRegister::Ahb1Rstr,
            Bus::Apb1 => RccRegister::Apb1Rstr,
            Bus::Apb2 => RccRegister::Apb2Rstr,
        }
    }
}

/// Clock tree bring-up failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockError {
    /// HSE oscillator never reported ready
    HseTimeout,
    /// PLL never locked
    PllTimeout,
    /// System clock switch to the PLL was not confirmed
    SwitchTimeout,
    /// The PLL factors put the VCO output outside 100..=432 MHz
    VcoOutOfRange,
    /// The system clock would exceed 100 MHz, or APB1 50 MHz
    ClockTooFast,
}

/// The RCC peripheral
pub struct Rcc<B> {
    regs: Registers<RccMap, B>,
}

impl<B: RegisterBus> Rcc<B> {
    /// Wraps the RCC on `bus`
    pub const fn new(bus: B) -> Self {
        Rcc {
            regs: Registers::new(RccMap, bus),
        }
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: RccRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: RccRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    /// Turns on the clock of `p`
    pub fn enable(&self, p: Peripheral) {
        let (bus, bit) = p.slot();
        self.regs.set(bit, bus.enr());
    }

    /// Turns off the clock of `p`
    pub fn disable(&self, p: Peripheral) {
        let (bus, bit) = p.slot();
        self.regs.clear(bit, bus.enr());
    }

    /// Whether the clock of `p` is on
    pub fn is_enabled(&self, p: Peripheral) -> bool {
        let (bus, bit) = p.slot();
        self.regs.is_set(bit, bus.enr())
    }

    /// Pulses the reset line of `p`
    pub fn reset(&self, p: Peripheral) {
        let (bus, bit) = p.slot();
        self.regs.set(bit, bus.rstr());
        self.regs.clear(bit, bus.rstr());
    }
}

/// Main PLL output divider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PllP {
    Div2 = 0b00,
    Div4 = 0b01,
    Div6 = 0b10,
    Div8 = 0b11,
}

impl PllP {
    const fn divisor(self) -> u32 {
        (self as u32 + 1) * 2
    }
}

/// Pll Configuration - Calculation = ((hse / m) * n) / p
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PllConfig {
    /// Input division factor, 2..=63
    pub m: u8,
    /// VCO multiplication factor, 50..=432
    pub n: u16,
    /// Output division factor
    pub p: PllP,
}

/// Clock configuration
///
/// The default turns the 8 MHz HSE into a 100 MHz system clock with APB1 at
/// 50 MHz and APB2 at 100 MHz.
#[derive(Clone, Copy, Debug)]
pub struct CFGR {
    hse: u32,
    pll: PllConfig,
    ppre1: u8,
    ppre2: u8,
    latency: u8,
}

impl Default for CFGR {
    fn default() -> Self {
        CFGR {
            hse: 8_000_000,
            pll: PllConfig {
                m: 8,
                n: 200,
                p: PllP::Div2,
            },
            ppre1: 2,
            ppre2: 1,
            latency: 3,
        }
    }
}

fn ppre_bits(div: u8) -> u32 {
    match div {
        1 => 0b000,
        2 => 0b100,
        4 => 0b101,
        8 => 0b110,
        _ => 0b111,
    }
}

impl CFGR {
    /// Uses an external oscillator of frequency `freq`
    pub fn hse<F>(mut self, freq: F) -> Self
    where
        F: Into<Hertz>,
    {
        self.hse = freq.into().0;
        self
    }

    /// Sets the main PLL factors
    pub fn pll(mut self, cfg: PllConfig) -> Self {
        assert!((2..=63).contains(&cfg.m), "PLLM out of range");
        assert!((50..=432).contains(&cfg.n), "PLLN out of range");
        self.pll = cfg;
        self
    }

    /// Sets the APB1 divider (1, 2, 4, 8 or 16)
    pub fn pclk1_div(mut self, div: u8) -> Self {
        assert!(matches!(div, 1 | 2 | 4 | 8 | 16), "APB divider must be a power of two up to 16");
        self.ppre1 = div;
        self
    }

    /// Sets the APB2 divider (1, 2, 4, 8 or 16)
    pub fn pclk2_div(mut self, div: u8) -> Self {
        assert!(matches!(div, 1 | 2 | 4 | 8 | 16), "APB divider must be a power of two up to 16");
        self.ppre2 = div;
        self
    }

    /// Sets the flash wait states used once the PLL drives the core
    pub fn latency(mut self, wait_states: u8) -> Self {
        assert!(wait_states <= 15, "LATENCY is a 4 bit field");
        self.latency = wait_states;
        self
    }

    /// VCO output frequency, `None` outside 100..=432 MHz
    pub fn vco(&self) -> Option<Hertz> {
        let vco = u64::from(self.hse) * u64::from(self.pll.n) / u64::from(self.pll.m);
        if (VCO_MIN..=VCO_MAX).contains(&vco) {
            u32(vco).ok().map(Hertz)
        } else {
            None
        }
    }

    /// System clock this configuration produces, `None` if the VCO is out
    /// of range
    pub fn sysclk(&self) -> Option<Hertz> {
        self.vco().map(|vco| Hertz(vco.0 / self.pll.p.divisor()))
    }

    /// Freezes the clock configuration, making it effective
    ///
    /// Each wait for the hardware is bounded. On a timeout the remaining
    /// steps are skipped and the core keeps running from whatever clock it
    /// had, which is the HSI out of reset.
    pub fn freeze<B, F>(&self, rcc: &Rcc<B>, flash: &mut Flash<F>) -> Result<Clocks, ClockError>
    where
        B: RegisterBus,
        F: RegisterBus,
    {
        let sysclk = self.sysclk().ok_or(ClockError::VcoOutOfRange)?.0;
        let pclk1 = sysclk / u32::from(self.ppre1);
        let pclk2 = sysclk / u32::from(self.ppre2);
        if sysclk > SYSCLK_MAX || pclk1 > PCLK1_MAX {
            return Err(ClockError::ClockTooFast);
        }

        let regs = &rcc.regs;

        regs.clear(cr::PLLON, RccRegister::Cr);
        regs.set(cr::HSEON, RccRegister::Cr);
        if !regs.poll(cr::HSERDY, RccRegister::Cr, 1, HSERDY_TIMEOUT) {
            return Err(ClockError::HseTimeout);
        }

        regs.set(pllcfgr::PLLSRC, RccRegister::PllCfgr);
        regs.write(pllcfgr::PLLM, RccRegister::PllCfgr, u32::from(self.pll.m));
        regs.write(pllcfgr::PLLN, RccRegister::PllCfgr, u32::from(self.pll.n));
        regs.write(pllcfgr::PLLP, RccRegister::PllCfgr, self.pll.p as u32);

        regs.set(cr::PLLON, RccRegister::Cr);
        if !regs.poll(cr::PLLRDY, RccRegister::Cr, 1, PLLRDY_TIMEOUT) {
            return Err(ClockError::PllTimeout);
        }

        regs.write(cfgr::HPRE, RccRegister::Cfgr, 0);
        regs.write(cfgr::PPRE1, RccRegister::Cfgr, ppre_bits(self.ppre1));
        regs.write(cfgr::PPRE2, RccRegister::Cfgr, ppre_bits(self.ppre2));

        // wait states have to be raised before the core speeds up
        flash.set_latency(self.latency);

        regs.write(cfgr::SW, RccRegister::Cfgr, cfgr::SW_PLL);
        if !regs.poll(cfgr::SWS, RccRegister::Cfgr, cfgr::SW_PLL, SWS_TIMEOUT) {
            return Err(ClockError::SwitchTimeout);
        }

        Ok(Clocks {
            hclk: Hertz(sysclk),
            pclk1: Hertz(pclk1),
            pclk2: Hertz(pclk2),
            ppre1: self.ppre1,
            ppre2: self.ppre2,
            sysclk: Hertz(sysclk),
        })
    }
}

/// Frozen clock frequencies
///
/// The existence of this value indicates that the clock configuration can no longer be changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Clocks {
    hclk: Hertz,
    pclk1: Hertz,
    pclk2: Hertz,
    ppre1: u8,
    ppre2: u8,
    sysclk: Hertz,
}

impl Clocks {
    /// The clock tree straight out of reset: everything on the 16 MHz HSI
    pub const fn hsi() -> Self {
        Clocks {
            hclk: Hertz(HSI),
            pclk1: Hertz(HSI),
            pclk2: Hertz(HSI),
            ppre1: 1,
            ppre2: 1,
            sysclk: Hertz(HSI),
        }
    }

    /// Returns the frequency of the AHB
    pub fn hclk(&self) -> Hertz {
        self.hclk
    }

    /// Returns the frequency of the APB1
    pub fn pclk1(&self) -> Hertz {
        self.pclk1
    }

    /// Returns the frequency of the APB2
    pub fn pclk2(&self) -> Hertz {
        self.pclk2
    }

    /// Timer kernel clock on APB1, doubled whenever the bus is divided
    pub fn timclk1(&self) -> Hertz {
        if self.ppre1 == 1 {
            self.pclk1
        } else {
            Hertz(self.pclk1.0 * 2)
        }
    }

    /// Timer kernel clock on APB2
    pub fn timclk2(&self) -> Hertz {
        if self.ppre2 == 1 {
            self.pclk2
        } else {
            Hertz(self.pclk2.0 * 2)
        }
    }

    /// Returns the system (core) frequency
    pub fn sysclk(&self) -> Hertz {
        self.sysclk
    }
}
