//! Direct Memory Access Engine
//!
//! Both controllers with all eight streams. Stream assignment is static: the
//! caller picks the stream and channel from the request mapping table, and
//! nothing arbitrates between two users of the same stream.

use core::mem::offset_of;

use crate::bus::RegisterBus;
use crate::field::{Access, RegisterMap, Registers};
use crate::map::{self, DmaBlock, DmaStreamBlock};
use crate::nvic::Interrupt;
use crate::rcc::Peripheral;

/// Interrupt flags of one stream, relative to its flag offset
const STREAM_FLAGS: u32 = 0x3D;
const FLAG_BITS: u32 = 0x0F7D_0F7D;

/// DMA controllers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Controller {
    Dma1,
    Dma2,
}

/// One of the eight streams of a controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamId(u8);

impl StreamId {
    pub const S0: StreamId = StreamId(0);
    pub const S1: StreamId = StreamId(1);
    pub const S2: StreamId = StreamId(2);
    pub const S3: StreamId = StreamId(3);
    pub const S4: StreamId = StreamId(4);
    pub const S5: StreamId = StreamId(5);
    pub const S6: StreamId = StreamId(6);
    pub const S7: StreamId = StreamId(7);

    /// `None` above 7
    pub const fn new(n: u8) -> Option<Self> {
        if n < 8 {
            Some(StreamId(n))
        } else {
            None
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

/// Logical DMA registers; the per-stream ones carry the stream number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaRegister {
    Lisr,
    Hisr,
    Lifcr,
    Hifcr,
    Cr(u8),
    Ndtr(u8),
    Par(u8),
    M0ar(u8),
    M1ar(u8),
    Fcr(u8),
}

impl Controller {
    /// Base address of the controller
    pub const fn base(self) -> usize {
        match self {
            Controller::Dma1 => map::DMA1,
            Controller::Dma2 => map::DMA2,
        }
    }

    pub const fn peripheral(self) -> Peripheral {
        match self {
            Controller::Dma1 => Peripheral::Dma1,
            Controller::Dma2 => Peripheral::Dma2,
        }
    }

    /// Interrupt of `stream`
    pub const fn irq(self, stream: StreamId) -> Interrupt {
        use Interrupt::*;

        match (self, stream.0) {
            (Controller::Dma1, 0) => DMA1_STREAM0,
            (Controller::Dma1, 1) => DMA1_STREAM1,
            (Controller::Dma1, 2) => DMA1_STREAM2,
            (Controller::Dma1, 3) => DMA1_STREAM3,
            (Controller::Dma1, 4) => DMA1_STREAM4,
            (Controller::Dma1, 5) => DMA1_STREAM5,
            (Controller::Dma1, 6) => DMA1_STREAM6,
            (Controller::Dma1, _) => DMA1_STREAM7,
            (Controller::Dma2, 0) => DMA2_STREAM0,
            (Controller::Dma2, 1) => DMA2_STREAM1,
            (Controller::Dma2, 2) => DMA2_STREAM2,
            (Controller::Dma2, 3) => DMA2_STREAM3,
            (Controller::Dma2, 4) => DMA2_STREAM4,
            (Controller::Dma2, 5) => DMA2_STREAM5,
            (Controller::Dma2, 6) => DMA2_STREAM6,
            (Controller::Dma2, _) => DMA2_STREAM7,
        }
    }
}

impl RegisterMap for Controller {
    type Register = DmaRegister;

    fn address(&self, reg: DmaRegister) -> Option<usize> {
        use DmaRegister::*;

        let offset = match reg {
            Lisr => offset_of!(DmaBlock, lisr),
            Hisr => offset_of!(DmaBlock, hisr),
            Lifcr => offset_of!(DmaBlock, lifcr),
            Hifcr => offset_of!(DmaBlock, hifcr),
            Cr(n) | Ndtr(n) | Par(n) | M0ar(n) | M1ar(n) | Fcr(n) => {
                if n > 7 {
                    return None;
                }
                let field = match reg {
                    Cr(_) => offset_of!(DmaStreamBlock, cr),
                    Ndtr(_) => offset_of!(DmaStreamBlock, ndtr),
                    Par(_) => offset_of!(DmaStreamBlock, par),
                    M0ar(_) => offset_of!(DmaStreamBlock, m0ar),
                    M1ar(_) => offset_of!(DmaStreamBlock, m1ar),
                    _ => offset_of!(DmaStreamBlock, fcr),
                };
                map::dma_stream(usize::from(n)) + field
            }
        };
        Some(self.base() + offset)
    }

    fn valid_bits(&self, reg: DmaRegister) -> u32 {
        use DmaRegister::*;

        match reg {
            Lisr | Hisr | Lifcr | Hifcr => FLAG_BITS,
            Cr(_) => 0x0FEF_FFFF,
            Ndtr(_) => 0xFFFF,
            Par(_) | M0ar(_) | M1ar(_) => u32::MAX,
            Fcr(_) => 0xBF,
        }
    }

    fn field_width(&self, reg: DmaRegister, bit: u8) -> u8 {
        use DmaRegister::*;

        match (reg, bit) {
            // DIR, PSIZE, MSIZE, PL, PBURST, MBURST
            (Cr(_), 6 | 11 | 13 | 16 | 21 | 23) => 2,
            // CHSEL
            (Cr(_), 25) => 3,
            (Ndtr(_), 0) => 16,
            (Par(_) | M0ar(_) | M1ar(_), 0) => 32,
            // FTH, FS
            (Fcr(_), 0) => 2,
            (Fcr(_), 3) => 3,
            _ => 1,
        }
    }

    fn access(&self, reg: DmaRegister) -> Access {
        match reg {
            DmaRegister::Lisr | DmaRegister::Hisr => Access::ReadOnly,
            DmaRegister::Lifcr | DmaRegister::Hifcr => Access::WriteOnly,
            _ => Access::ReadWrite,
        }
    }
}

/// Position of the first flag of `stream` in its status register half
pub const fn flag_offset(stream: StreamId) -> u8 {
    match stream.0 % 4 {
        0 => 0,
        1 => 6,
        2 => 16,
        _ => 22,
    }
}

/// Transfer direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    PeripheralToMemory = 0b00,
    MemoryToPeripheral = 0b01,
    MemoryToMemory = 0b10,
}

/// Size of one data item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSize {
    Byte = 0b00,
    HalfWord = 0b01,
    Word = 0b10,
}

/// Stream priority level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low = 0b00,
    Medium = 0b01,
    High = 0b10,
    VeryHigh = 0b11,
}

/// Everything a stream needs before it is enabled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferConfig {
    /// Request channel, 0 to 7
    pub channel: u8,
    pub direction: Direction,
    /// Peripheral data register
    pub peripheral: u32,
    /// First memory location
    pub memory: u32,
    /// Number of data items
    pub count: u16,
    /// Reload the count and addresses when the transfer finishes
    pub circular: bool,
    pub memory_increment: bool,
    pub peripheral_size: DataSize,
    pub memory_size: DataSize,
    pub priority: Priority,
    /// Raise the stream interrupt on transfer complete
    pub transfer_complete_interrupt: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            channel: 0,
            direction: Direction::PeripheralToMemory,
            peripheral: 0,
            memory: 0,
            count: 0,
            circular: false,
            memory_increment: true,
            peripheral_size: DataSize::Byte,
            memory_size: DataSize::Byte,
            priority: Priority::Low,
            transfer_complete_interrupt: false,
        }
    }
}

/// Stream interrupt events
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    HalfTransfer,
    TransferComplete,
    TransferError,
}

impl Event {
    const fn enable_bit(self) -> u8 {
        match self {
            Event::TransferError => cr::TEIE,
            Event::HalfTransfer => cr::HTIE,
            Event::TransferComplete => cr::TCIE,
        }
    }

    // position relative to the stream's flag offset
    const fn flag(self) -> u8 {
        match self {
            Event::TransferError => 3,
            Event::HalfTransfer => 4,
            Event::TransferComplete => 5,
        }
    }
}

/// DMA errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The stream has to be disabled before it is reconfigured
    StreamEnabled,
    /// Channel above 7
    InvalidChannel,
    /// A transfer of zero items
    EmptyTransfer,
    /// More items than NDTR can count
    TransferTooLong,
}

mod cr {
    pub const EN: u8 = 0;
    pub const TEIE: u8 = 2;
    pub const HTIE: u8 = 3;
    pub const TCIE: u8 = 4;
    pub const DIR: u8 = 6;
    pub const CIRC: u8 = 8;
    pub const PINC: u8 = 9;
    pub const MINC: u8 = 10;
    pub const PSIZE: u8 = 11;
    pub const MSIZE: u8 = 13;
    pub const PL: u8 = 16;
    pub const CHSEL: u8 = 25;
}

/// One DMA stream
pub struct Stream<B> {
    regs: Registers<Controller, B>,
    id: StreamId,
}

impl<B: RegisterBus> Stream<B> {
    /// Wraps `id` of `controller`; the controller clock must be on
    pub const fn new(bus: B, controller: Controller, id: StreamId) -> Self {
        Stream {
            regs: Registers::new(controller, bus),
            id,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn controller(&self) -> Controller {
        *self.regs.map()
    }

    /// Interrupt of this stream
    pub fn irq(&self) -> Interrupt {
        self.controller().irq(self.id)
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: DmaRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: DmaRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    fn cr(&self) -> DmaRegister {
        DmaRegister::Cr(self.id.0)
    }

    fn status(&self) -> DmaRegister {
        if self.id.0 < 4 {
            DmaRegister::Lisr
        } else {
            DmaRegister::Hisr
        }
    }

    fn clear_register(&self) -> DmaRegister {
        if self.id.0 < 4 {
            DmaRegister::Lifcr
        } else {
            DmaRegister::Hifcr
        }
    }

    /// Programs addresses, count and control bits
    ///
    /// Pending flags are cleared so the stream can be enabled right after.
    /// The stream must be disabled first.
    pub fn configure(&mut self, config: &TransferConfig) -> Result<(), Error> {
        if self.is_enabled() {
            return Err(Error::StreamEnabled);
        }
        if config.channel > 7 {
            return Err(Error::InvalidChannel);
        }
        if config.count == 0 {
            return Err(Error::EmptyTransfer);
        }

        let n = self.id.0;
        self.clear_flags();

        self.regs.write(0, DmaRegister::Par(n), config.peripheral);
        self.regs.write(0, DmaRegister::M0ar(n), config.memory);
        self.regs.write(0, DmaRegister::Ndtr(n), u32::from(config.count));

        // one full store, so nothing from an earlier transfer survives
        // (HTIE, TEIE, PINC, double buffering, bursts); EN stays 0
        let control = (u32::from(config.channel) << cr::CHSEL)
            | ((config.priority as u32) << cr::PL)
            | ((config.memory_size as u32) << cr::MSIZE)
            | ((config.peripheral_size as u32) << cr::PSIZE)
            | (u32::from(config.memory_increment) << cr::MINC)
            | (u32::from(config.circular) << cr::CIRC)
            | ((config.direction as u32) << cr::DIR)
            | (u32::from(config.transfer_complete_interrupt) << cr::TCIE);
        if let Some(addr) = self.regs.map().address(self.cr()) {
            self.regs.bus().write(addr, control);
        }
        Ok(())
    }

    /// Starts the stream
    #[inline(always)]
    pub fn enable(&mut self) {
        self.regs.set(cr::EN, self.cr());
    }

    /// Stops the stream and waits until the hardware confirms it
    ///
    /// EN stays set until the current data item has been moved, so the
    /// stream may not be touched before this returns.
    #[inline(always)]
    pub fn disable(&mut self) {
        self.regs.clear(cr::EN, self.cr());
        self.regs.spin_until(cr::EN, self.cr(), 0);
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.regs.is_set(cr::EN, self.cr())
    }

    /// Data items left to transfer
    pub fn remaining(&self) -> u16 {
        self.regs.read(0, DmaRegister::Ndtr(self.id.0)) as u16
    }

    /// Starts listening for an `event`
    pub fn listen(&mut self, event: Event) {
        self.regs.set(event.enable_bit(), self.cr());
    }

    /// Stops listening for an `event`
    pub fn unlisten(&mut self, event: Event) {
        self.regs.clear(event.enable_bit(), self.cr());
    }

    /// Whether the flag of `event` is set
    pub fn is_pending(&self, event: Event) -> bool {
        self.regs
            .is_set(flag_offset(self.id) + event.flag(), self.status())
    }

    /// Whether the transfer complete flag is set
    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.is_pending(Event::TransferComplete)
    }

    /// Clears the flag of `event`
    pub fn clear(&mut self, event: Event) {
        self.regs
            .set(flag_offset(self.id) + event.flag(), self.clear_register());
    }

    /// Clears every flag of this stream in one store
    pub fn clear_flags(&mut self) {
        if let Some(addr) = self.regs.map().address(self.clear_register()) {
            self.regs
                .bus()
                .write(addr, STREAM_FLAGS << flag_offset(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::INVALID;
    use crate::mock::MockBus;

    const DMA2_HISR: usize = map::DMA2 + 0x04;
    const DMA2_LIFCR: usize = map::DMA2 + 0x08;
    const DMA2_HIFCR: usize = map::DMA2 + 0x0C;
    const DMA2_S2CR: usize = map::DMA2 + 0x10 + 2 * 0x18;
    const DMA2_S2NDTR: usize = DMA2_S2CR + 0x04;
    const DMA2_S2PAR: usize = DMA2_S2CR + 0x08;
    const DMA2_S2M0AR: usize = DMA2_S2CR + 0x0C;
    const DMA1_S7CR: usize = map::DMA1 + 0x10 + 7 * 0x18;

    fn usart1_rx(memory: u32) -> TransferConfig {
        TransferConfig {
            channel: 4,
            peripheral: 0x4001_1004,
            memory,
            count: 64,
            circular: true,
            transfer_complete_interrupt: true,
            ..TransferConfig::default()
        }
    }

    #[test]
    fn configure_usart1_rx() {
        let bus = MockBus::new();
        let mut stream = Stream::new(&bus, Controller::Dma2, StreamId::S2);

        stream.configure(&usart1_rx(0x2000_0100)).unwrap();
        stream.enable();

        assert_eq!(bus.get(DMA2_S2PAR), 0x4001_1004);
        assert_eq!(bus.get(DMA2_S2M0AR), 0x2000_0100);
        assert_eq!(bus.get(DMA2_S2NDTR), 64);
        assert_eq!(
            bus.get(DMA2_S2CR),
            (4 << 25) | (1 << 10) | (1 << 8) | (1 << 4) | 1
        );
        assert_eq!(bus.last_write(DMA2_LIFCR), Some(0x3D << 16));
        assert_eq!(stream.irq(), Interrupt::DMA2_STREAM2);
    }

    #[test]
    fn reconfigure_drops_earlier_control_bits() {
        let bus = MockBus::new();
        let mut stream = Stream::new(&bus, Controller::Dma2, StreamId::S2);

        stream.configure(&usart1_rx(0x2000_0100)).unwrap();
        stream.listen(Event::HalfTransfer);
        stream.listen(Event::TransferError);
        // PINC and double buffer mode from some other user of the stream
        bus.set(DMA2_S2CR, bus.get(DMA2_S2CR) | (1 << 9) | (1 << 18));

        let tx = TransferConfig {
            channel: 4,
            direction: Direction::MemoryToPeripheral,
            peripheral: 0x4001_1004,
            memory: 0x2000_0200,
            count: 5,
            memory_increment: true,
            ..TransferConfig::default()
        };
        stream.configure(&tx).unwrap();

        assert_eq!(bus.get(DMA2_S2CR), (4 << 25) | (1 << 10) | (0b01 << 6));
        assert_eq!(bus.get(DMA2_S2NDTR), 5);
    }

    #[test]
    fn configure_refused_while_enabled() {
        let bus = MockBus::new();
        bus.set(DMA2_S2CR, 1);
        let mut stream = Stream::new(&bus, Controller::Dma2, StreamId::S2);

        assert_eq!(
            stream.configure(&usart1_rx(0x2000_0000)),
            Err(Error::StreamEnabled)
        );
        assert_eq!(bus.total_writes(), 0);
    }

    #[test]
    fn configure_checks_request() {
        let bus = MockBus::new();
        let mut stream = Stream::new(&bus, Controller::Dma1, StreamId::S5);

        let mut config = usart1_rx(0x2000_0000);
        config.channel = 8;
        assert_eq!(stream.configure(&config), Err(Error::InvalidChannel));
        config.channel = 4;
        config.count = 0;
        assert_eq!(stream.configure(&config), Err(Error::EmptyTransfer));
    }

    #[test]
    fn disable_waits_for_hardware() {
        let bus = MockBus::new();
        bus.set(DMA2_S2CR, 1 | (1 << 8));
        bus.hold(DMA2_S2CR, 1, 5);
        let mut stream = Stream::new(&bus, Controller::Dma2, StreamId::S2);

        stream.disable();

        // one read for the clear, four spins with EN still up, one clean
        assert_eq!(bus.reads(DMA2_S2CR), 6);
        assert_eq!(bus.get(DMA2_S2CR), 1 << 8);
        assert!(!stream.is_enabled());
    }

    #[test]
    fn flag_offsets() {
        assert_eq!(flag_offset(StreamId::S0), 0);
        assert_eq!(flag_offset(StreamId::S1), 6);
        assert_eq!(flag_offset(StreamId::S6), 16);
        assert_eq!(flag_offset(StreamId::S7), 22);
        assert_eq!(StreamId::new(8), None);
    }

    #[test]
    fn stream7_complete_and_clear() {
        let bus = MockBus::new();
        bus.set(DMA2_HISR, (1 << 27) | (1 << 5));
        let mut stream = Stream::new(&bus, Controller::Dma2, StreamId::S7);

        assert!(stream.is_complete());
        assert!(!stream.is_pending(Event::HalfTransfer));

        stream.clear(Event::TransferComplete);
        assert_eq!(bus.last_write(DMA2_HIFCR), Some(1 << 27));
        assert_eq!(bus.reads(DMA2_HIFCR), 0);

        stream.clear_flags();
        assert_eq!(bus.last_write(DMA2_HIFCR), Some(0x3D << 22));
    }

    #[test]
    fn register_validation() {
        let bus = MockBus::new();
        let stream = Stream::new(&bus, Controller::Dma1, StreamId::S7);

        // bit 20 of CR is reserved, LISR is read-only, there is no stream 8
        stream.write(20, DmaRegister::Cr(7), 1);
        stream.write(5, DmaRegister::Lisr, 1);
        stream.write(0, DmaRegister::Cr(8), 1);
        stream.write(1, DmaRegister::Lifcr, 1);
        assert_eq!(bus.total_writes(), 0);
        assert_eq!(stream.read(0, DmaRegister::Fcr(8)), INVALID);
        assert_eq!(stream.read(0, DmaRegister::Lifcr), INVALID);

        stream.write(25, DmaRegister::Cr(7), 7);
        assert_eq!(bus.get(DMA1_S7CR), 7 << 25);
        assert_eq!(stream.irq(), Interrupt::DMA1_STREAM7);
    }

    #[test]
    fn listen_sets_enable_bits() {
        let bus = MockBus::new();
        let mut stream = Stream::new(&bus, Controller::Dma2, StreamId::S2);

        stream.listen(Event::HalfTransfer);
        stream.listen(Event::TransferError);
        stream.unlisten(Event::HalfTransfer);

        assert_eq!(bus.get(DMA2_S2CR), 1 << 2);
    }
}
