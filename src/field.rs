//! Validated bit-field access
//!
//! A peripheral describes its registers once, through [`RegisterMap`]:
//!
//! - where each logical register lives,
//! - which of its bits are implemented,
//! - how wide the field starting at a given bit is.
//!
//! [`write`] and [`read`] combine that description with the arithmetic in
//! [`write_bits`] / [`read_bits`] to change exactly one field of one register.
//!
//! Invalid requests never reach the hardware. A rejected write does nothing
//! and a rejected read returns [`INVALID`]. This covers unknown registers,
//! reserved bits, fields running past bit 31 and values too wide for their
//! field.
//!
//! ```ignore
//! // GPIOD clock enable
//! regs.write(3, RccRegister::Ahb1Enr, 1);
//! assert_eq!(regs.read(3, RccRegister::Ahb1Enr), 1);
//! ```

use core::hint;

use crate::bus::RegisterBus;

/// Returned by reads that fail validation
pub const INVALID: u32 = 0xFFFF_FFFF;

/// How software may touch a register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Access {
    /// Plain read-modify-write register
    ReadWrite,
    /// Status register, writes are rejected
    ReadOnly,
    /// Reads back as zero; writes are stored as-is without reading first
    WriteOnly,
    /// Writing a 1 clears the bit, writing 0 has no effect
    WriteOneToClear,
}

/// Static description of a peripheral's registers
pub trait RegisterMap {
    /// Logical register selector
    type Register: Copy;

    /// Physical address of `reg`, or `None` if this instance does not have it
    fn address(&self, reg: Self::Register) -> Option<usize>;

    /// Implemented bits of `reg`; a 0 marks a reserved position
    fn valid_bits(&self, reg: Self::Register) -> u32;

    /// Width of the field of `reg` starting at `bit`
    fn field_width(&self, _reg: Self::Register, _bit: u8) -> u8 {
        1
    }

    /// Access rules of `reg`
    fn access(&self, _reg: Self::Register) -> Access {
        Access::ReadWrite
    }
}

/// A register field that passed validation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Field {
    /// Address of the containing register
    pub addr: usize,
    /// Lowest bit of the field
    pub pos: u8,
    /// Number of bits
    pub width: u8,
    /// Access rules of the containing register
    pub access: Access,
}

#[inline(always)]
const fn ones(width: u8) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

#[inline(always)]
const fn in_range(pos: u8, width: u8) -> bool {
    pos <= 31 && width >= 1 && width <= 32 && pos as u32 + width as u32 <= 32
}

#[inline(always)]
const fn fits(width: u8, value: u32) -> bool {
    width >= 32 || value >> width == 0
}

/// Replaces bits `[pos, pos + width)` of the register at `addr` with `value`
///
/// Does nothing unless `pos <= 31`, `1 <= width <= 32`, `pos + width <= 32`
/// and `value` fits in `width` bits. A full word at position 0 is stored
/// directly; anything narrower is a read-modify-write that leaves the other
/// bits untouched.
#[inline(always)]
pub fn write_bits<B>(bus: &B, addr: usize, pos: u8, width: u8, value: u32)
where
    B: RegisterBus + ?Sized,
{
    if !in_range(pos, width) || !fits(width, value) {
        return;
    }

    if width == 32 {
        bus.write(addr, value);
        return;
    }

    let mask = ones(width) << pos;
    let current = bus.read(addr);
    bus.write(addr, (current & !mask) | (value << pos));
}

/// Extracts bits `[pos, pos + width)` of the register at `addr`, right aligned
///
/// Returns [`INVALID`] under the same conditions that make [`write_bits`] a
/// no-op.
#[inline(always)]
pub fn read_bits<B>(bus: &B, addr: usize, pos: u8, width: u8) -> u32
where
    B: RegisterBus + ?Sized,
{
    if !in_range(pos, width) {
        return INVALID;
    }

    let word = bus.read(addr);
    if width == 32 {
        word
    } else {
        (word >> pos) & ones(width)
    }
}

/// Looks up the field of `reg` starting at `bit`
///
/// Returns `None` if the register does not exist on `map`, or if any bit of
/// the field is out of range or reserved.
#[inline(always)]
pub fn resolve<M>(map: &M, bit: u8, reg: M::Register) -> Option<Field>
where
    M: RegisterMap + ?Sized,
{
    let addr = map.address(reg)?;
    let width = map.field_width(reg, bit);
    if !in_range(bit, width) {
        return None;
    }

    let span = ones(width) << bit;
    if span & !map.valid_bits(reg) != 0 {
        return None;
    }

    Some(Field {
        addr,
        pos: bit,
        width,
        access: map.access(reg),
    })
}

/// Writes `value` into the field of `reg` starting at `bit`
#[inline(always)]
pub fn write<M, B>(map: &M, bus: &B, bit: u8, reg: M::Register, value: u32)
where
    M: RegisterMap + ?Sized,
    B: RegisterBus + ?Sized,
{
    let field = match resolve(map, bit, reg) {
        Some(field) => field,
        None => return,
    };

    match field.access {
        Access::ReadOnly => {}
        Access::ReadWrite => write_bits(bus, field.addr, field.pos, field.width, value),
        // a read-modify-write would clear flags or re-issue commands that
        // happen to read back as set
        Access::WriteOnly | Access::WriteOneToClear => {
            if fits(field.width, value) {
                bus.write(field.addr, value << field.pos);
            }
        }
    }
}

/// Reads the field of `reg` starting at `bit`, or [`INVALID`]
#[inline(always)]
pub fn read<M, B>(map: &M, bus: &B, bit: u8, reg: M::Register) -> u32
where
    M: RegisterMap + ?Sized,
    B: RegisterBus + ?Sized,
{
    match resolve(map, bit, reg) {
        Some(field) if field.access != Access::WriteOnly => {
            read_bits(bus, field.addr, field.pos, field.width)
        }
        _ => INVALID,
    }
}

/// A register map bound to the bus it lives on
///
/// Every driver in this crate wraps one of these.
#[derive(Clone, Copy, Debug)]
pub struct Registers<M, B> {
    map: M,
    bus: B,
}

impl<M, B> Registers<M, B>
where
    M: RegisterMap,
    B: RegisterBus,
{
    /// Binds `map` to `bus`
    pub const fn new(map: M, bus: B) -> Self {
        Registers { map, bus }
    }

    /// The register description
    pub fn map(&self) -> &M {
        &self.map
    }

    /// The underlying bus
    #[inline(always)]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Splits into the description and the bus
    pub fn free(self) -> (M, B) {
        (self.map, self.bus)
    }

    /// See [`write`]
    #[inline(always)]
    pub fn write(&self, bit: u8, reg: M::Register, value: u32) {
        write(&self.map, &self.bus, bit, reg, value)
    }

    /// See [`read`]
    #[inline(always)]
    pub fn read(&self, bit: u8, reg: M::Register) -> u32 {
        read(&self.map, &self.bus, bit, reg)
    }

    /// Sets a single-bit flag
    #[inline(always)]
    pub fn set(&self, bit: u8, reg: M::Register) {
        self.write(bit, reg, 1)
    }

    /// Clears a single-bit flag
    #[inline(always)]
    pub fn clear(&self, bit: u8, reg: M::Register) {
        self.write(bit, reg, 0)
    }

    /// Whether the field at `bit` reads as 1
    #[inline(always)]
    pub fn is_set(&self, bit: u8, reg: M::Register) -> bool {
        self.read(bit, reg) == 1
    }

    /// Polls the field at `bit` until it reads `expected`, at most `limit` times
    ///
    /// Returns `false` when the limit runs out first.
    pub fn poll(&self, bit: u8, reg: M::Register, expected: u32, limit: u32) -> bool {
        for _ in 0..limit {
            if self.read(bit, reg) == expected {
                return true;
            }
            hint::spin_loop();
        }
        false
    }

    /// Spins until the field at `bit` reads `expected`
    #[inline(always)]
    pub fn spin_until(&self, bit: u8, reg: M::Register, expected: u32) {
        while self.read(bit, reg) != expected {
            hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    const REG: usize = 0x4000_0000;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Reg {
        Control,
        Status,
        Command,
        Flags,
        Missing,
    }

    struct Map;

    impl RegisterMap for Map {
        type Register = Reg;

        fn address(&self, reg: Reg) -> Option<usize> {
            match reg {
                Reg::Control => Some(REG),
                Reg::Status => Some(REG + 4),
                Reg::Command => Some(REG + 8),
                Reg::Flags => Some(REG + 12),
                Reg::Missing => None,
            }
        }

        fn valid_bits(&self, reg: Reg) -> u32 {
            match reg {
                // bits 4..=7 reserved
                Reg::Control => !0x0000_00F0,
                _ => u32::MAX,
            }
        }

        fn field_width(&self, reg: Reg, bit: u8) -> u8 {
            match (reg, bit) {
                (Reg::Control, 0) => 3,
                (Reg::Control, 8) => 9,
                (Reg::Control, 28) => 4,
                (Reg::Control, 30) => 4,
                (Reg::Command, 0) => 32,
                _ => 1,
            }
        }

        fn access(&self, reg: Reg) -> Access {
            match reg {
                Reg::Status => Access::ReadOnly,
                Reg::Command => Access::WriteOnly,
                Reg::Flags => Access::WriteOneToClear,
                _ => Access::ReadWrite,
            }
        }
    }

    #[test]
    fn write_bits_preserves_neighbours() {
        let bus = MockBus::new();
        bus.set(REG, 0xA5A5_A5A5);

        write_bits(&bus, REG, 8, 4, 0x3);

        assert_eq!(bus.get(REG), 0xA5A5_A3A5);
        assert_eq!(read_bits(&bus, REG, 8, 4), 0x3);
    }

    #[test]
    fn write_bits_full_word() {
        let bus = MockBus::new();
        bus.set(REG, 0x1234_5678);

        write_bits(&bus, REG, 0, 32, 0xDEAD_BEEF);

        assert_eq!(bus.get(REG), 0xDEAD_BEEF);
        assert_eq!(read_bits(&bus, REG, 0, 32), 0xDEAD_BEEF);
        // a full word store does not need the old value
        assert_eq!(bus.reads(REG), 1);
    }

    #[test]
    fn write_bits_rejects_bad_geometry() {
        let bus = MockBus::new();
        bus.set(REG, 0x0F0F_0F0F);

        write_bits(&bus, REG, 32, 1, 1);
        write_bits(&bus, REG, 30, 3, 1);
        write_bits(&bus, REG, 1, 32, 1);
        write_bits(&bus, REG, 0, 33, 1);
        write_bits(&bus, REG, 4, 0, 0);

        assert_eq!(bus.get(REG), 0x0F0F_0F0F);
        assert_eq!(bus.writes(REG), 0);

        assert_eq!(read_bits(&bus, REG, 32, 1), INVALID);
        assert_eq!(read_bits(&bus, REG, 30, 3), INVALID);
        assert_eq!(read_bits(&bus, REG, 1, 32), INVALID);
    }

    #[test]
    fn write_bits_rejects_oversized_value() {
        let bus = MockBus::new();
        bus.set(REG, 0x8000_0001);

        write_bits(&bus, REG, 4, 2, 0b100);
        write_bits(&bus, REG, 31, 1, 2);

        assert_eq!(bus.get(REG), 0x8000_0001);
        assert_eq!(bus.writes(REG), 0);
    }

    #[test]
    fn top_bit_field() {
        let bus = MockBus::new();

        write_bits(&bus, REG, 31, 1, 1);
        assert_eq!(bus.get(REG), 0x8000_0000);
        assert_eq!(read_bits(&bus, REG, 31, 1), 1);

        write_bits(&bus, REG, 16, 16, 0xFFFF);
        assert_eq!(bus.get(REG), 0xFFFF_0000);
    }

    #[test]
    fn accessor_round_trip() {
        let bus = MockBus::new();
        bus.set(REG, 0x5555_0000);

        write(&Map, &bus, 8, Reg::Control, 0x1AB);

        assert_eq!(read(&Map, &bus, 8, Reg::Control), 0x1AB);
        assert_eq!(bus.get(REG), 0x5555_0000 & !(0x1FF << 8) | (0x1AB << 8));
    }

    #[test]
    fn accessor_rejects_reserved_span() {
        let bus = MockBus::new();
        bus.set(REG, 0x0000_000F);

        // starts in reserved space
        write(&Map, &bus, 5, Reg::Control, 1);
        // 3-bit field at 0 is fine, but a 1-bit write at 4 is reserved
        write(&Map, &bus, 4, Reg::Control, 1);

        assert_eq!(bus.get(REG), 0x0000_000F);
        assert_eq!(read(&Map, &bus, 5, Reg::Control), INVALID);
        assert_eq!(read(&Map, &bus, 0, Reg::Control), 0x7);
    }

    #[test]
    fn accessor_rejects_field_past_bit_31() {
        let bus = MockBus::new();

        write(&Map, &bus, 30, Reg::Control, 1);

        assert_eq!(bus.writes(REG), 0);
        assert_eq!(read(&Map, &bus, 30, Reg::Control), INVALID);
        // 28 + 4 fits exactly
        write(&Map, &bus, 28, Reg::Control, 0xF);
        assert_eq!(bus.get(REG), 0xF000_0000);
    }

    #[test]
    fn accessor_rejects_oversized_value() {
        let bus = MockBus::new();

        write(&Map, &bus, 0, Reg::Control, 8);

        assert_eq!(bus.writes(REG), 0);
    }

    #[test]
    fn missing_register() {
        let bus = MockBus::new();

        write(&Map, &bus, 0, Reg::Missing, 1);

        assert_eq!(bus.total_writes(), 0);
        assert_eq!(read(&Map, &bus, 0, Reg::Missing), INVALID);
    }

    #[test]
    fn read_only_rejects_writes() {
        let bus = MockBus::new();
        bus.set(REG + 4, 0x20);

        write(&Map, &bus, 0, Reg::Status, 1);

        assert_eq!(bus.writes(REG + 4), 0);
        assert_eq!(read(&Map, &bus, 5, Reg::Status), 1);
    }

    #[test]
    fn write_only_skips_the_read() {
        let bus = MockBus::new();

        write(&Map, &bus, 0, Reg::Command, 0x4567_0123);

        assert_eq!(bus.reads(REG + 8), 0);
        assert_eq!(bus.get(REG + 8), 0x4567_0123);
        assert_eq!(read(&Map, &bus, 0, Reg::Command), INVALID);
    }

    #[test]
    fn write_one_to_clear_touches_one_flag() {
        let bus = MockBus::new();
        bus.set(REG + 12, 0b1011);

        write(&Map, &bus, 1, Reg::Flags, 1);

        // only the requested flag is presented to the hardware
        assert_eq!(bus.last_write(REG + 12), Some(0b0010));
        assert_eq!(bus.reads(REG + 12), 0);
    }

    #[test]
    fn registers_poll_gives_up() {
        let bus = MockBus::new();
        bus.hold(REG, 1 << 0, 10);
        let regs = Registers::new(Map, &bus);

        assert!(!regs.poll(0, Reg::Control, 0, 5));
        assert!(regs.poll(0, Reg::Control, 0, 10));
    }
}
