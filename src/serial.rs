//! Serial communication using UART
//!
//! USART1, USART2 and USART6 in asynchronous mode, with blocking byte I/O,
//! the `embedded_hal` non-blocking traits and DMA streaming on the fixed
//! stream of each instance.

use core::fmt;
use core::mem::offset_of;
use core::sync::atomic::{self, Ordering};

use crate::bus::RegisterBus;
use crate::dma::{self, Controller, DataSize, Direction, Stream, StreamId, TransferConfig};
use crate::field::{RegisterMap, Registers};
use crate::gpio::{Gpio, Port};
use crate::hal::serial;
use crate::map::{self, UsartBlock};
use crate::nvic::{Interrupt, Nvic};
use crate::rcc::{Clocks, Peripheral, Rcc};
use crate::time::{Bps, Hertz, U32Ext};

/// Logical UART registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartRegister {
    Sr,
    Dr,
    Brr,
    Cr1,
    Cr2,
    Cr3,
    Gtpr,
}

/// UART instances
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instance {
    Usart1,
    Usart2,
    Usart6,
}

/// A DMA request line: controller, stream and channel
pub type DmaRoute = (Controller, StreamId, u8);

impl Instance {
    pub const fn base(self) -> usize {
        match self {
            Instance::Usart1 => map::USART1,
            Instance::Usart2 => map::USART2,
            Instance::Usart6 => map::USART6,
        }
    }

    pub const fn peripheral(self) -> Peripheral {
        match self {
            Instance::Usart1 => Peripheral::Usart1,
            Instance::Usart2 => Peripheral::Usart2,
            Instance::Usart6 => Peripheral::Usart6,
        }
    }

    /// Alternate function number of the TX/RX pins
    pub const fn alternate_function(self) -> u8 {
        match self {
            Instance::Usart1 | Instance::Usart2 => 7,
            Instance::Usart6 => 8,
        }
    }

    pub const fn irq(self) -> Interrupt {
        match self {
            Instance::Usart1 => Interrupt::USART1,
            Instance::Usart2 => Interrupt::USART2,
            Instance::Usart6 => Interrupt::USART6,
        }
    }

    /// Kernel clock of the instance
    pub fn clock(self, clocks: &Clocks) -> Hertz {
        match self {
            Instance::Usart2 => clocks.pclk1(),
            Instance::Usart1 | Instance::Usart6 => clocks.pclk2(),
        }
    }

    /// DMA request line of the receiver
    pub const fn rx_dma(self) -> DmaRoute {
        match self {
            Instance::Usart1 => (Controller::Dma2, StreamId::S2, 4),
            Instance::Usart2 => (Controller::Dma1, StreamId::S5, 4),
            Instance::Usart6 => (Controller::Dma2, StreamId::S1, 5),
        }
    }

    /// DMA request line of the transmitter
    pub const fn tx_dma(self) -> DmaRoute {
        match self {
            Instance::Usart1 => (Controller::Dma2, StreamId::S7, 4),
            Instance::Usart2 => (Controller::Dma1, StreamId::S6, 4),
            Instance::Usart6 => (Controller::Dma2, StreamId::S6, 5),
        }
    }

    /// Address of the data register, as seen by the DMA
    pub const fn data_register(self) -> u32 {
        (self.base() + offset_of!(UsartBlock, dr)) as u32
    }
}

impl RegisterMap for Instance {
    type Register = UartRegister;

    fn address(&self, reg: UartRegister) -> Option<usize> {
        let offset = match reg {
            UartRegister::Sr => offset_of!(UsartBlock, sr),
            UartRegister::Dr => offset_of!(UsartBlock, dr),
            UartRegister::Brr => offset_of!(UsartBlock, brr),
            UartRegister::Cr1 => offset_of!(UsartBlock, cr1),
            UartRegister::Cr2 => offset_of!(UsartBlock, cr2),
            UartRegister::Cr3 => offset_of!(UsartBlock, cr3),
            UartRegister::Gtpr => offset_of!(UsartBlock, gtpr),
        };
        Some(self.base() + offset)
    }

    fn valid_bits(&self, reg: UartRegister) -> u32 {
        match reg {
            UartRegister::Sr => 0x3FF,
            UartRegister::Dr => 0x1FF,
            UartRegister::Brr => 0xFFFF,
            UartRegister::Cr1 => 0xBFFF,
            UartRegister::Cr2 => 0x7F6F,
            UartRegister::Cr3 => 0xFFF,
            UartRegister::Gtpr => 0xFFFF,
        }
    }

    fn field_width(&self, reg: UartRegister, bit: u8) -> u8 {
        match (reg, bit) {
            (UartRegister::Dr, 0) => 9,
            // whole divisor, or the mantissa alone
            (UartRegister::Brr, 0) => 16,
            (UartRegister::Brr, 4) => 12,
            // ADD, STOP
            (UartRegister::Cr2, 0) => 4,
            (UartRegister::Cr2, 12) => 2,
            // PSC, GT
            (UartRegister::Gtpr, 0 | 8) => 8,
            _ => 1,
        }
    }
}

mod sr {
    pub const PE: u32 = 1 << 0;
    pub const FE: u32 = 1 << 1;
    pub const NF: u32 = 1 << 2;
    pub const ORE: u32 = 1 << 3;
    pub const RXNE: u8 = 5;
    pub const TC: u8 = 6;
    pub const TXE: u8 = 7;
}

mod cr1 {
    pub const RE: u8 = 2;
    pub const TE: u8 = 3;
    pub const IDLEIE: u8 = 4;
    pub const RXNEIE: u8 = 5;
    pub const TCIE: u8 = 6;
    pub const TXEIE: u8 = 7;
    pub const PS: u8 = 9;
    pub const PCE: u8 = 10;
    pub const M: u8 = 12;
    pub const UE: u8 = 13;
    pub const OVER8: u8 = 15;
}

mod cr3 {
    pub const DMAR: u8 = 6;
    pub const DMAT: u8 = 7;
}

/// Baud rate register value for `baud` on a `pclk` kernel clock
///
/// The divisor is rounded to the nearest 1/16 (1/8 with `over8`), carrying
/// into the mantissa. `None` when the mantissa would be zero or wider than 12
/// bits.
pub fn brr(pclk: u32, baud: u32, over8: bool) -> Option<u32> {
    if baud == 0 {
        return None;
    }
    // USARTDIV in sixteenths (eighths with OVER8) is pclk / baud
    let div = (u64::from(pclk) + u64::from(baud) / 2) / u64::from(baud);
    let (mantissa, fraction) = if over8 {
        (div >> 3, div & 0x7)
    } else {
        (div >> 4, div & 0xF)
    };
    if mantissa == 0 || mantissa > 0xFFF {
        return None;
    }
    Some(((mantissa << 4) | fraction) as u32)
}

/// Interrupt event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// New data has been received
    Rxne,
    /// New data can be sent
    Txe,
    /// The last byte has left the shift register
    TransmissionComplete,
    /// The line has gone idle
    Idle,
}

/// Serial error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Framing error
    Framing,
    /// Noise error
    Noise,
    /// RX buffer overrun
    Overrun,
    /// Parity check error
    Parity,
}

/// USART parity settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    /// No parity
    ParityNone,
    /// Even parity
    ParityEven,
    /// Odd parity
    ParityOdd,
}

/// USART word length, parity bit included
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WordLength {
    DataBits8,
    DataBits9,
}

/// USART oversampling settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Oversampling {
    /// Oversample 8 times (allows for faster data rates)
    Over8,
    /// Oversample 16 times (higher stability)
    Over16,
}

/// Which directions hand their data to the DMA
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaConfig {
    None,
    Rx,
    Tx,
    TxRx,
}

/// USART Configuration structure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    baudrate: Bps,
    parity: Parity,
    wordlength: WordLength,
    oversampling: Oversampling,
    dma: DmaConfig,
}

impl Config {
    /// Set the baudrate to a specific value
    pub fn baudrate(mut self, baudrate: Bps) -> Self {
        self.baudrate = baudrate;
        self
    }

    /// Set parity to none
    pub fn parity_none(mut self) -> Self {
        self.parity = Parity::ParityNone;
        self
    }

    /// Set parity to even
    pub fn parity_even(mut self) -> Self {
        self.parity = Parity::ParityEven;
        self
    }

    /// Set parity to odd
    pub fn parity_odd(mut self) -> Self {
        self.parity = Parity::ParityOdd;
        self
    }

    pub fn wordlength_8(mut self) -> Self {
        self.wordlength = WordLength::DataBits8;
        self
    }

    pub fn wordlength_9(mut self) -> Self {
        self.wordlength = WordLength::DataBits9;
        self
    }

    /// Set the oversampling size
    pub fn oversampling(mut self, oversampling: Oversampling) -> Self {
        self.oversampling = oversampling;
        self
    }

    /// Set the DMA request enables
    pub fn dma(mut self, dma: DmaConfig) -> Self {
        self.dma = dma;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            baudrate: 115_200_u32.bps(),
            parity: Parity::ParityNone,
            wordlength: WordLength::DataBits8,
            oversampling: Oversampling::Over16,
            dma: DmaConfig::None,
        }
    }
}

/// Serial abstraction
pub struct Serial<B> {
    regs: Registers<Instance, B>,
}

impl<B: RegisterBus> Serial<B> {
    /// Wraps an instance that is already configured
    pub const fn new(bus: B, instance: Instance) -> Self {
        Serial {
            regs: Registers::new(instance, bus),
        }
    }

    pub fn instance(&self) -> Instance {
        *self.regs.map()
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: UartRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: UartRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    fn status(&self) -> u32 {
        self.regs
            .map()
            .address(UartRegister::Sr)
            .map_or(0, |addr| self.regs.bus().read(addr))
    }

    // a read-modify-write of DR would consume a received character
    fn store_data(&self, word: u16) {
        if let Some(addr) = self.regs.map().address(UartRegister::Dr) {
            self.regs.bus().write(addr, u32::from(word) & 0x1FF);
        }
    }

    fn load_data(&self) -> u16 {
        self.regs.read(0, UartRegister::Dr) as u16
    }

    fn error(status: u32) -> Option<Error> {
        if status & sr::PE != 0 {
            Some(Error::Parity)
        } else if status & sr::FE != 0 {
            Some(Error::Framing)
        } else if status & sr::NF != 0 {
            Some(Error::Noise)
        } else if status & sr::ORE != 0 {
            Some(Error::Overrun)
        } else {
            None
        }
    }

    /// Sends `word` and waits until it has left the shift register
    pub fn transmit(&mut self, word: u16) {
        self.regs.spin_until(sr::TXE, UartRegister::Sr, 1);
        self.store_data(word);
        self.regs.spin_until(sr::TC, UartRegister::Sr, 1);
    }

    /// Sends every byte of `data`
    pub fn transmit_all(&mut self, data: &[u8]) {
        for byte in data {
            self.transmit(u16::from(*byte));
        }
    }

    /// Waits for a character
    ///
    /// The status register is read before the data register, which is the
    /// sequence that clears the error flags, so DR is read even when the
    /// character is discarded.
    pub fn receive(&mut self) -> Result<u16, Error> {
        self.regs.spin_until(sr::RXNE, UartRegister::Sr, 1);
        let status = self.status();
        let word = self.load_data();
        match Self::error(status) {
            Some(err) => Err(err),
            None => Ok(word),
        }
    }

    /// Starts listening for an interrupt event
    pub fn listen(&mut self, event: Event) {
        self.regs.set(Self::enable_bit(event), UartRegister::Cr1);
    }

    /// Stops listening for an interrupt event
    pub fn unlisten(&mut self, event: Event) {
        self.regs.clear(Self::enable_bit(event), UartRegister::Cr1);
    }

    fn enable_bit(event: Event) -> u8 {
        match event {
            Event::Rxne => cr1::RXNEIE,
            Event::Txe => cr1::TXEIE,
            Event::TransmissionComplete => cr1::TCIE,
            Event::Idle => cr1::IDLEIE,
        }
    }

    pub fn free(self) -> (Instance, B) {
        self.regs.free()
    }
}

impl<B: RegisterBus + Copy> Serial<B> {
    /// Brings up `instance` on pins `tx` and `rx` of `port`
    ///
    /// Enables the USART and GPIO clocks, routes both pins to the USART and
    /// programs the frame format. The receiver, transmitter and the USART
    /// itself are switched on last.
    ///
    /// # Panics
    ///
    /// When the baud rate cannot be reached from the instance clock.
    pub fn init(
        bus: B,
        instance: Instance,
        config: Config,
        pins: (Port, u8, u8),
        clocks: &Clocks,
    ) -> Self {
        let (port, tx, rx) = pins;
        let over8 = config.oversampling == Oversampling::Over8;
        let Some(divisor) = brr(instance.clock(clocks).raw(), config.baudrate.0, over8) else {
            panic!("impossible baud rate");
        };

        let rcc = Rcc::new(bus);
        rcc.enable(instance.peripheral());
        rcc.enable(port.peripheral());

        let gpio = Gpio::new(bus, port);
        let af = instance.alternate_function();
        gpio.into_alternate(tx, af);
        gpio.into_alternate(rx, af);

        let serial = Serial::new(bus, instance);
        let regs = &serial.regs;
        regs.write(cr1::OVER8, UartRegister::Cr1, u32::from(over8));
        regs.write(0, UartRegister::Brr, divisor);
        regs.set(cr1::RE, UartRegister::Cr1);
        regs.set(cr1::TE, UartRegister::Cr1);

        let (pce, ps) = match config.parity {
            Parity::ParityNone => (0, 0),
            Parity::ParityEven => (1, 0),
            Parity::ParityOdd => (1, 1),
        };
        regs.write(cr1::PCE, UartRegister::Cr1, pce);
        regs.write(cr1::PS, UartRegister::Cr1, ps);
        regs.write(
            cr1::M,
            UartRegister::Cr1,
            (config.wordlength == WordLength::DataBits9) as u32,
        );

        let (dmat, dmar) = match config.dma {
            DmaConfig::None => (0, 0),
            DmaConfig::Rx => (0, 1),
            DmaConfig::Tx => (1, 0),
            DmaConfig::TxRx => (1, 1),
        };
        regs.write(cr3::DMAT, UartRegister::Cr3, dmat);
        regs.write(cr3::DMAR, UartRegister::Cr3, dmar);

        regs.set(cr1::UE, UartRegister::Cr1);
        serial
    }

    fn start_dma(&self, route: DmaRoute, transfer: TransferConfig) -> Result<Stream<B>, dma::Error> {
        let bus = *self.regs.bus();
        let (controller, id, _) = route;
        Rcc::new(bus).enable(controller.peripheral());

        let mut stream = Stream::new(bus, controller, id);
        if stream.is_enabled() {
            stream.disable();
        }
        stream.configure(&transfer)?;
        Nvic::new(bus).enable(stream.irq());

        // NOTE(compiler_fence) operations on the buffer should not be
        // reordered after the next statement, which starts the transfer
        atomic::compiler_fence(Ordering::Release);
        stream.enable();
        Ok(stream)
    }

    /// Streams received bytes into `len` bytes at `memory`
    ///
    /// With `circular` the stream wraps around and keeps running. The
    /// transfer complete interrupt of the stream is unmasked in the NVIC.
    /// `memory` must stay valid for as long as the stream runs.
    pub fn rx_dma(&mut self, memory: u32, len: u16, circular: bool) -> Result<Stream<B>, dma::Error> {
        let route = self.instance().rx_dma();
        self.regs.set(cr3::DMAR, UartRegister::Cr3);
        self.start_dma(
            route,
            TransferConfig {
                channel: route.2,
                direction: Direction::PeripheralToMemory,
                peripheral: self.instance().data_register(),
                memory,
                count: len,
                circular,
                memory_increment: true,
                peripheral_size: DataSize::Byte,
                memory_size: DataSize::Byte,
                transfer_complete_interrupt: true,
                ..TransferConfig::default()
            },
        )
    }

    /// Sends `len` bytes from `memory` through the DMA
    pub fn tx_dma(&mut self, memory: u32, len: u16) -> Result<Stream<B>, dma::Error> {
        let route = self.instance().tx_dma();
        self.regs.set(cr3::DMAT, UartRegister::Cr3);
        self.regs.clear(sr::TC, UartRegister::Sr);
        self.start_dma(
            route,
            TransferConfig {
                channel: route.2,
                direction: Direction::MemoryToPeripheral,
                peripheral: self.instance().data_register(),
                memory,
                count: len,
                memory_increment: true,
                transfer_complete_interrupt: true,
                ..TransferConfig::default()
            },
        )
    }
}

impl<B: RegisterBus> serial::Read<u8> for Serial<B> {
    type Error = Error;

    fn read(&mut self) -> nb::Result<u8, Error> {
        let status = self.status();
        if let Some(err) = Self::error(status) {
            // SR then DR clears the error flags
            self.load_data();
            Err(nb::Error::Other(err))
        } else if status & (1 << sr::RXNE) != 0 {
            Ok(self.load_data() as u8)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

impl<B: RegisterBus> serial::Write<u8> for Serial<B> {
    type Error = Error;

    fn flush(&mut self) -> nb::Result<(), Error> {
        if self.regs.is_set(sr::TC, UartRegister::Sr) {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn write(&mut self, byte: u8) -> nb::Result<(), Error> {
        if self.regs.is_set(sr::TXE, UartRegister::Sr) {
            self.store_data(u16::from(byte));
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

impl<B: RegisterBus> fmt::Write for Serial<B> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let _ = s
            .as_bytes()
            .iter()
            .map(|c| nb::block!(serial::Write::write(self, *c)))
            .last();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::INVALID;
    use crate::hal::serial::{Read, Write};
    use crate::mock::{MockBus, Op};
    use core::fmt::Write as _;

    const SR: usize = map::USART1;
    const DR: usize = map::USART1 + 0x04;
    const BRR: usize = map::USART1 + 0x08;
    const CR1: usize = map::USART1 + 0x0C;
    const CR3: usize = map::USART1 + 0x14;

    const RXNE: u32 = 1 << 5;
    const TC: u32 = 1 << 6;
    const TXE: u32 = 1 << 7;

    #[test]
    fn brr_at_100_mhz() {
        // USARTDIV 651.04: mantissa 651, fraction 1/16
        assert_eq!(brr(100_000_000, 9_600, false), Some((651 << 4) | 1));
        assert_eq!(brr(100_000_000, 9_600, false), Some(0x28B1));
        assert_eq!(brr(100_000_000, 115_200, false), Some(0x364));
        assert_eq!(brr(100_000_000, 115_200, true), Some(0x6C4));
    }

    #[test]
    fn brr_fraction_carries_into_mantissa() {
        // USARTDIV 1.99: the fraction rounds up to a whole step
        assert_eq!(brr(3_184, 100, false), Some(2 << 4));
    }

    #[test]
    fn brr_out_of_range() {
        assert_eq!(brr(100_000_000, 0, false), None);
        assert_eq!(brr(100_000_000, 1_200, false), None);
        assert_eq!(brr(16_000_000, 2_000_000, false), None);
        assert_eq!(brr(16_000_000, 300, false), Some(53_333));
    }

    #[test]
    fn init_usart1_on_pa9_pa10() {
        let bus = MockBus::new();

        Serial::init(
            &bus,
            Instance::Usart1,
            Config::default(),
            (Port::A, 9, 10),
            &Clocks::hsi(),
        );

        // 16 MHz / 115200 = 138.9
        assert_eq!(bus.get(BRR), 139);
        assert_eq!(bus.get(map::RCC + 0x44), 1 << 4);
        assert_eq!(bus.get(map::RCC + 0x30), 1 << 0);
        assert_eq!(bus.get(map::GPIOA), (0b10 << 18) | (0b10 << 20));
        assert_eq!(bus.get(map::GPIOA + 0x24), (7 << 4) | (7 << 8));
        assert_eq!(bus.get(CR1), (1 << 2) | (1 << 3) | (1 << 13));
        assert_eq!(bus.get(CR3), 0);

        let divisor = bus.first_write_with(BRR, 139).unwrap();
        let enable = bus.first_write_with(CR1, 1 << 13).unwrap();
        assert!(divisor < enable);
    }

    #[test]
    fn init_frame_format() {
        let bus = MockBus::new();
        let config = Config::default()
            .baudrate(9_600.bps())
            .parity_odd()
            .wordlength_9()
            .dma(DmaConfig::TxRx);

        Serial::init(&bus, Instance::Usart6, config, (Port::C, 6, 7), &Clocks::hsi());

        let cr1 = bus.get(map::USART6 + 0x0C);
        assert_eq!(cr1 & (1 << 10 | 1 << 9 | 1 << 12), 1 << 10 | 1 << 9 | 1 << 12);
        assert_eq!(bus.get(map::USART6 + 0x14), (1 << 7) | (1 << 6));
        // USART6 is AF8
        assert_eq!(bus.get(map::GPIOC + 0x20), (8 << 24) | (8 << 28));
    }

    #[test]
    #[should_panic(expected = "impossible baud rate")]
    fn init_rejects_unreachable_baud() {
        let bus = MockBus::new();
        let config = Config::default().baudrate(4_000_000.bps());

        Serial::init(&bus, Instance::Usart2, config, (Port::A, 2, 3), &Clocks::hsi());
    }

    #[test]
    fn transmit_writes_data_directly() {
        let bus = MockBus::new();
        bus.set(SR, TXE | TC);
        let mut serial = Serial::new(&bus, Instance::Usart1);

        serial.transmit(u16::from(b'A'));
        serial.transmit(0x1FF);

        assert_eq!(bus.written(DR), [0x41, 0x1FF]);
        assert_eq!(bus.reads(DR), 0);
    }

    #[test]
    fn receive_reads_status_then_data() {
        let bus = MockBus::new();
        bus.set(SR, RXNE);
        bus.set(DR, 0x41);
        let mut serial = Serial::new(&bus, Instance::Usart1);

        assert_eq!(serial.receive(), Ok(0x41));

        let log = bus.log();
        let status = log.iter().rposition(|op| matches!(op, Op::Read(SR, _))).unwrap();
        let data = log.iter().position(|op| matches!(op, Op::Read(DR, _))).unwrap();
        assert!(status < data);
    }

    #[test]
    fn parity_error_discards_data() {
        let bus = MockBus::new();
        bus.set(SR, RXNE | 1);
        bus.set(DR, 0x55);
        let mut serial = Serial::new(&bus, Instance::Usart1);

        assert_eq!(serial.receive(), Err(Error::Parity));
        assert_eq!(bus.reads(DR), 1);
    }

    #[test]
    fn non_blocking_read() {
        let bus = MockBus::new();
        let mut serial = Serial::new(&bus, Instance::Usart1);

        assert_eq!(Read::read(&mut serial), Err(nb::Error::WouldBlock));

        bus.set(SR, RXNE | (1 << 3));
        bus.set(DR, 0x12);
        assert_eq!(Read::read(&mut serial), Err(nb::Error::Other(Error::Overrun)));
        assert_eq!(bus.reads(DR), 1);

        bus.set(SR, RXNE);
        assert_eq!(Read::read(&mut serial), Ok(0x12));
    }

    #[test]
    fn non_blocking_write() {
        let bus = MockBus::new();
        let mut serial = Serial::new(&bus, Instance::Usart2);

        assert_eq!(Write::write(&mut serial, b'x'), Err(nb::Error::WouldBlock));
        assert_eq!(Write::flush(&mut serial), Err(nb::Error::WouldBlock));

        bus.set(map::USART2, TXE | TC);
        assert_eq!(Write::write(&mut serial, b'x'), Ok(()));
        assert_eq!(Write::flush(&mut serial), Ok(()));
        assert_eq!(bus.written(map::USART2 + 0x04), [u32::from(b'x')]);
    }

    #[test]
    fn formatted_output() {
        let bus = MockBus::new();
        bus.set(SR, TXE | TC);
        let mut serial = Serial::new(&bus, Instance::Usart1);

        write!(serial, "T={}", 7).unwrap();

        assert_eq!(bus.written(DR), [u32::from(b'T'), u32::from(b'='), u32::from(b'7')]);
    }

    #[test]
    fn rx_dma_on_dma2_stream2() {
        let bus = MockBus::new();
        let mut serial = Serial::new(&bus, Instance::Usart1);

        let stream = serial.rx_dma(0x2000_0100, 64, true).unwrap();

        let s2cr = map::DMA2 + 0x10 + 2 * 0x18;
        assert_eq!(stream.id(), StreamId::S2);
        assert_eq!(bus.get(s2cr), (4 << 25) | (1 << 10) | (1 << 8) | (1 << 4) | 1);
        assert_eq!(bus.get(s2cr + 0x08), 0x4001_1004);
        assert_eq!(bus.get(s2cr + 0x0C), 0x2000_0100);
        assert_eq!(bus.get(s2cr + 0x04), 64);
        assert_eq!(bus.get(CR3), 1 << 6);
        // DMA2 clock, NVIC line 58
        assert_eq!(bus.get(map::RCC + 0x30), 1 << 22);
        assert_eq!(bus.get(0xE000_E104), 1 << 26);
    }

    #[test]
    fn rx_dma_restarts_a_running_stream() {
        let bus = MockBus::new();
        let s5cr = map::DMA1 + 0x10 + 5 * 0x18;
        bus.set(s5cr, 1);
        let mut serial = Serial::new(&bus, Instance::Usart2);

        let stream = serial.rx_dma(0x2000_0000, 16, false).unwrap();

        assert_eq!(stream.controller(), Controller::Dma1);
        assert_eq!(bus.written(s5cr)[0], 0);
        assert_eq!(bus.get(s5cr), (4 << 25) | (1 << 10) | (1 << 4) | 1);
    }

    #[test]
    fn tx_dma_on_usart6() {
        let bus = MockBus::new();
        bus.set(map::USART6, TXE | TC);
        let mut serial = Serial::new(&bus, Instance::Usart6);

        let stream = serial.tx_dma(0x2000_0200, 5).unwrap();

        let s6cr = map::DMA2 + 0x10 + 6 * 0x18;
        assert_eq!(stream.id(), StreamId::S6);
        assert_eq!(bus.get(s6cr), (5 << 25) | (1 << 10) | (1 << 6) | (1 << 4) | 1);
        assert_eq!(bus.get(map::USART6), TXE);
        assert_eq!(bus.get(map::USART6 + 0x14), 1 << 7);
    }

    #[test]
    fn register_validation() {
        let bus = MockBus::new();
        let serial = Serial::new(&bus, Instance::Usart1);

        serial.write(14, UartRegister::Cr1, 1);
        serial.write(4, UartRegister::Cr2, 1);
        serial.write(0, UartRegister::Dr, 0x200);
        assert_eq!(bus.total_writes(), 0);
        assert_eq!(serial.read(7, UartRegister::Cr2), INVALID);

        serial.write(4, UartRegister::Brr, 651);
        serial.write(0, UartRegister::Brr, 0x28B1);
        assert_eq!(bus.get(BRR), 0x28B1);
        assert_eq!(serial.read(4, UartRegister::Brr), 651);
        serial.write(12, UartRegister::Cr2, 0b10);
        assert_eq!(bus.get(map::USART1 + 0x10), 0b10 << 12);
    }
}
