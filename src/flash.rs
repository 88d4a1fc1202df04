//! Flash memory module
//!
//! Example usage of the flash programming interface:
//!
//! ```ignore
//! fn program_region<B: RegisterBus>(flash: &mut Flash<B>) -> Result<(), FlashError> {
//!     // Unlock the flashing module
//!     let mut prog = flash.unlock()?;
//!
//!     // Sector 5 starts at 0x0802_0000
//!     prog.erase_sector(5)?;
//!     prog.program(flash::SECTOR_ADDRESSES[5] as usize, b"hello")?;
//!
//!     Ok(())
//!     // `prog` locks the controller again when dropped
//! }
//! ```
//!
//! Reprogramming the image the CPU is running from goes through
//! [`update_firmware`], which runs from RAM with interrupts masked and ends in
//! a system reset.

#![deny(missing_docs)]

use core::ops::{Drop, Range};

use crate::bus::{Mmio, RegisterBus};
use crate::field::{Access, RegisterMap, Registers};
use crate::map::{self, FlashBlock};
use crate::scb;
use core::mem::offset_of;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;

/// Start address of each of the eight flash sectors
pub const SECTOR_ADDRESSES: [u32; 8] = [
    0x0800_0000,
    0x0800_4000,
    0x0800_8000,
    0x0800_C000,
    0x0801_0000,
    0x0802_0000,
    0x0804_0000,
    0x0806_0000,
];

/// First address past the end of the main flash array
pub const FLASH_END: u32 = 0x0808_0000;

/// Logical FLASH interface registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashRegister {
    /// Access control
    Acr,
    /// Key
    Keyr,
    /// Option key
    OptKeyr,
    /// Status
    Sr,
    /// Control
    Cr,
    /// Option control
    OptCr,
}

/// Register description of the FLASH interface
#[derive(Clone, Copy, Debug, Default)]
pub struct FlashMap;

impl RegisterMap for FlashMap {
    type Register = FlashRegister;

    #[inline(always)]
    fn address(&self, reg: FlashRegister) -> Option<usize> {
        let offset = match reg {
            FlashRegister::Acr => offset_of!(FlashBlock, acr),
            FlashRegister::Keyr => offset_of!(FlashBlock, keyr),
            FlashRegister::OptKeyr => offset_of!(FlashBlock, optkeyr),
            FlashRegister::Sr => offset_of!(FlashBlock, sr),
            FlashRegister::Cr => offset_of!(FlashBlock, cr),
            FlashRegister::OptCr => offset_of!(FlashBlock, optcr),
        };
        Some(map::FLASH + offset)
    }

    #[inline(always)]
    fn valid_bits(&self, reg: FlashRegister) -> u32 {
        match reg {
            FlashRegister::Acr => !((0xF << 4) | 0xFFFF_E000),
            FlashRegister::Keyr | FlashRegister::OptKeyr => u32::MAX,
            FlashRegister::Sr => !((0x3 << 2) | (0x7F << 9) | (0x7FFF << 17)),
            FlashRegister::Cr => !((1 << 7) | (0x3F << 10) | (0x7F << 17) | (0x1F << 26)),
            FlashRegister::OptCr => !((1 << 4) | (0x7F << 24)),
        }
    }

    #[inline(always)]
    fn field_width(&self, reg: FlashRegister, bit: u8) -> u8 {
        match (reg, bit) {
            (FlashRegister::Acr, acr::LATENCY) => 4,
            (FlashRegister::Keyr | FlashRegister::OptKeyr, 0) => 32,
            (FlashRegister::Cr, cr::SNB) => 4,
            (FlashRegister::Cr, cr::PSIZE) => 2,
            (FlashRegister::OptCr, 2) => 2,
            (FlashRegister::OptCr, 8) => 8,
            (FlashRegister::OptCr, 16) => 8,
            _ => 1,
        }
    }

    #[inline(always)]
    fn access(&self, reg: FlashRegister) -> Access {
        match reg {
            FlashRegister::Keyr | FlashRegister::OptKeyr => Access::WriteOnly,
            FlashRegister::Sr => Access::WriteOneToClear,
            _ => Access::ReadWrite,
        }
    }
}

mod acr {
    pub const LATENCY: u8 = 0;
}

mod cr {
    pub const PG: u8 = 0;
    pub const SER: u8 = 1;
    pub const SNB: u8 = 3;
    pub const PSIZE: u8 = 8;
    pub const STRT: u8 = 16;
    pub const LOCK: u8 = 31;
}

mod sr {
    pub const OPERR: u8 = 1;
    pub const WRPERR: u8 = 4;
    pub const PGAERR: u8 = 5;
    pub const PGPERR: u8 = 6;
    pub const PGSERR: u8 = 7;
    pub const BSY: u8 = 16;
    pub const ERRORS: [u8; 5] = [OPERR, WRPERR, PGAERR, PGPERR, PGSERR];
}

/// x8 program parallelism
const PSIZE_X8: u32 = 0b00;

/// Flash errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Flash controller is not done yet
    Busy,
    /// Set during erase/program when the flash is locked or misconfigured
    OperationError,
    /// Write protection error
    WriteProtectionError,
    /// Programming alignment error
    AlignmentError,
    /// Programming parallelism does not match the access size
    ParallelismError,
    /// Program or erase issued out of sequence
    SequenceError,
    /// The key sequence did not unlock the controller
    UnableToUnlock,
    /// Sector number past the end of the flash
    InvalidSector,
    /// Address outside of the main flash array
    OutOfBounds,
}

/// The FLASH interface
pub struct Flash<B> {
    regs: Registers<FlashMap, B>,
}

impl<B: RegisterBus> Flash<B> {
    /// Wraps the FLASH interface on `bus`
    pub const fn new(bus: B) -> Self {
        Flash {
            regs: Registers::new(FlashMap, bus),
        }
    }

    /// Writes the field of `reg` starting at `bit`
    pub fn write(&self, bit: u8, reg: FlashRegister, value: u32) {
        self.regs.write(bit, reg, value)
    }

    /// Reads the field of `reg` starting at `bit`
    pub fn read(&self, bit: u8, reg: FlashRegister) -> u32 {
        self.regs.read(bit, reg)
    }

    /// Sets the number of wait states used for reads
    pub fn set_latency(&mut self, wait_states: u8) {
        self.regs
            .write(acr::LATENCY, FlashRegister::Acr, u32::from(wait_states));
    }

    /// Wait states currently configured
    pub fn latency(&self) -> u8 {
        self.regs.read(acr::LATENCY, FlashRegister::Acr) as u8
    }

    /// Whether the control register is locked
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.regs.is_set(cr::LOCK, FlashRegister::Cr)
    }

    /// Unlock the flash registers via KEYR to access the flash programming
    #[inline(always)]
    pub fn unlock(&mut self) -> Result<FlashProgramming<'_, B>, FlashError> {
        if self.is_locked() {
            self.regs.write(0, FlashRegister::Keyr, FLASH_KEY1);
            self.regs.write(0, FlashRegister::Keyr, FLASH_KEY2);

            if self.is_locked() {
                return Err(FlashError::UnableToUnlock);
            }
        }

        let mut prog = FlashProgramming { flash: self };
        prog.clear_errors();
        Ok(prog)
    }
}

/// Flash programming interface
pub struct FlashProgramming<'a, B: RegisterBus> {
    flash: &'a mut Flash<B>,
}

impl<'a, B: RegisterBus> Drop for FlashProgramming<'a, B> {
    #[inline(always)]
    fn drop(&mut self) {
        // Lock on drop
        self.lock();
    }
}

impl<'a, B: RegisterBus> FlashProgramming<'a, B> {
    /// Lock the flash memory controller
    #[inline(always)]
    fn lock(&mut self) {
        self.flash.regs.set(cr::LOCK, FlashRegister::Cr);
    }

    /// Wait till last flash operation is complete
    #[inline(always)]
    fn wait(&mut self) -> Result<(), FlashError> {
        self.flash.regs.spin_until(sr::BSY, FlashRegister::Sr, 0);

        self.status()
    }

    #[inline(always)]
    fn clear_errors(&mut self) {
        let regs = &self.flash.regs;
        let pending = sr::ERRORS.map(|bit| regs.is_set(bit, FlashRegister::Sr));
        for (bit, set) in sr::ERRORS.into_iter().zip(pending) {
            if set {
                regs.write(bit, FlashRegister::Sr, 1);
            }
        }
    }

    /// Check flash status
    #[inline(always)]
    pub fn status(&self) -> Result<(), FlashError> {
        let regs = &self.flash.regs;

        if regs.is_set(sr::BSY, FlashRegister::Sr) {
            Err(FlashError::Busy)
        } else if regs.is_set(sr::PGSERR, FlashRegister::Sr) {
            Err(FlashError::SequenceError)
        } else if regs.is_set(sr::PGPERR, FlashRegister::Sr) {
            Err(FlashError::ParallelismError)
        } else if regs.is_set(sr::PGAERR, FlashRegister::Sr) {
            Err(FlashError::AlignmentError)
        } else if regs.is_set(sr::WRPERR, FlashRegister::Sr) {
            Err(FlashError::WriteProtectionError)
        } else if regs.is_set(sr::OPERR, FlashRegister::Sr) {
            Err(FlashError::OperationError)
        } else {
            Ok(())
        }
    }

    /// Erase one flash sector
    ///
    /// The erase is not started while a previous operation is still running.
    #[inline(always)]
    pub fn erase_sector(&mut self, sector: u8) -> Result<(), FlashError> {
        if usize::from(sector) >= SECTOR_ADDRESSES.len() {
            return Err(FlashError::InvalidSector);
        }

        self.flash.regs.spin_until(sr::BSY, FlashRegister::Sr, 0);

        let regs = &self.flash.regs;
        regs.write(cr::PSIZE, FlashRegister::Cr, PSIZE_X8);
        regs.set(cr::SER, FlashRegister::Cr);
        regs.write(cr::SNB, FlashRegister::Cr, u32::from(sector));
        regs.set(cr::STRT, FlashRegister::Cr);

        let result = self.wait();
        self.flash.regs.clear(cr::SER, FlashRegister::Cr);
        result
    }

    /// Program a single byte
    #[inline(always)]
    pub fn program_byte(&mut self, addr: usize, byte: u8) -> Result<(), FlashError> {
        if addr < map::FLASH_MEMORY || addr >= FLASH_END as usize {
            return Err(FlashError::OutOfBounds);
        }

        self.flash.regs.spin_until(sr::BSY, FlashRegister::Sr, 0);

        let regs = &self.flash.regs;
        regs.write(cr::PSIZE, FlashRegister::Cr, PSIZE_X8);
        regs.set(cr::PG, FlashRegister::Cr);
        regs.bus().write_byte(addr, byte);

        let result = self.wait();
        self.flash.regs.clear(cr::PG, FlashRegister::Cr);
        result
    }

    /// Program `data` byte by byte starting at `addr`
    #[inline(always)]
    pub fn program(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        match addr.checked_add(data.len()) {
            Some(end) if end <= FLASH_END as usize => {}
            _ => return Err(FlashError::OutOfBounds),
        }

        let bytes = data.as_ptr();
        let mut offset = 0;
        while offset < data.len() {
            // NOTE(unsafe) `offset < data.len()`
            let byte = unsafe { bytes.add(offset).read() };
            self.program_byte(addr + offset, byte)?;
            offset += 1;
        }

        Ok(())
    }
}

/// Size in bytes of `sector`
#[inline(always)]
pub const fn sector_size(sector: usize) -> u32 {
    let end = if sector + 1 < SECTOR_ADDRESSES.len() {
        SECTOR_ADDRESSES[sector + 1]
    } else {
        FLASH_END
    };
    end - SECTOR_ADDRESSES[sector]
}

/// Sectors that must be erased to hold `len` bytes starting at sector `first`
///
/// Returns `None` if the payload would run past the end of the flash.
#[inline(always)]
pub fn sectors_for(first: u8, len: usize) -> Option<Range<u8>> {
    let mut last = usize::from(first);
    if last >= SECTOR_ADDRESSES.len() {
        return None;
    }

    let mut covered = sector_size(last) as usize;
    while covered < len {
        last += 1;
        if last >= SECTOR_ADDRESSES.len() {
            return None;
        }
        covered += sector_size(last) as usize;
    }

    Some(first..last as u8 + 1)
}

/// Erases the sectors needed for `payload` from sector `first` on, then
/// programs it byte by byte
///
/// The controller is locked again before this returns, whether or not the
/// write succeeded.
#[inline(always)]
pub fn write_image<B: RegisterBus>(
    flash: &mut Flash<B>,
    first: u8,
    payload: &[u8],
) -> Result<(), FlashError> {
    let sectors = sectors_for(first, payload.len()).ok_or(FlashError::OutOfBounds)?;
    // indexed before the first erase; `sectors_for` checked `first`
    let base = SECTOR_ADDRESSES[usize::from(first)] as usize;
    let mut prog = flash.unlock()?;

    // after the first erase nothing may be fetched from flash, so no
    // iterator adaptors or out-of-line helpers below this point
    let mut sector = sectors.start;
    while sector < sectors.end {
        prog.erase_sector(sector)?;
        sector += 1;
    }

    prog.program(base, payload)
}

/// Replaces the running firmware with `payload` and resets the device
///
/// The routine lives in RAM, since the flash bank it rewrites cannot be
/// fetched from while it is being erased. Everything it calls after the
/// first erase is `#[inline(always)]` for the same reason, and the loops are
/// plain index loops. Core helpers that are only `#[inline]` rely on the
/// `opt-level = "s"` set for both profiles. Interrupts stay masked until the
/// reset.
///
/// There is no integrity check of `payload` and no fallback image. Losing
/// power between the first erase and the reset leaves the device without
/// firmware.
#[inline(never)]
#[cfg_attr(target_arch = "arm", link_section = ".data.update_firmware")]
pub fn update_firmware(payload: &[u8]) -> ! {
    // NOTE(unsafe) never released; the reset restores the interrupt state
    let _masked = unsafe { critical_section::acquire() };

    // NOTE(unsafe) interrupts are masked and nothing else touches FLASH
    let bus = unsafe { Mmio::steal() };
    let mut flash = Flash::new(bus);
    let _ = write_image(&mut flash, 0, payload);

    scb::system_reset(&bus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBus, Op};

    const SR: usize = map::FLASH + 0x0C;
    const CR: usize = map::FLASH + 0x10;
    const KEYR: usize = map::FLASH + 0x04;
    const ACR: usize = map::FLASH;
    const BSY: u32 = 1 << 16;
    const STRT: u32 = 1 << 16;
    const LOCK: u32 = 1 << 31;

    #[test]
    fn latency() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);

        flash.set_latency(3);

        assert_eq!(bus.get(ACR), 3);
        assert_eq!(flash.latency(), 3);
    }

    #[test]
    fn latency_rejects_reserved_prefetch_gap() {
        let bus = MockBus::new();
        let flash = Flash::new(&bus);

        // bits 4..=7 of ACR are reserved
        flash.write(4, FlashRegister::Acr, 1);

        assert_eq!(bus.writes(ACR), 0);
    }

    #[test]
    fn unlock_writes_keys_in_order() {
        let bus = MockBus::new();
        // LOCK reads set once, then the key sequence has cleared it
        bus.hold(CR, LOCK, 1);
        let mut flash = Flash::new(&bus);

        {
            let prog = flash.unlock();
            assert!(prog.is_ok());
        }

        assert_eq!(bus.written(KEYR), vec![FLASH_KEY1, FLASH_KEY2]);
        // dropped, so locked again
        assert_eq!(bus.get(CR) & LOCK, LOCK);
    }

    #[test]
    fn unlock_fails_when_lock_sticks() {
        let bus = MockBus::new();
        bus.set(CR, LOCK);
        let mut flash = Flash::new(&bus);

        assert_eq!(flash.unlock().err(), Some(FlashError::UnableToUnlock));
    }

    #[test]
    fn unlock_clears_stale_errors() {
        let bus = MockBus::new();
        bus.set(SR, (1 << 7) | (1 << 4));
        let mut flash = Flash::new(&bus);

        drop(flash.unlock());

        let cleared = bus.written(SR);
        assert!(cleared.contains(&(1 << 4)));
        assert!(cleared.contains(&(1 << 7)));
    }

    #[test]
    fn erase_waits_for_busy_before_start() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let mut prog = flash.unlock().unwrap();
        bus.hold(SR, BSY, 5);

        assert_eq!(prog.erase_sector(2), Ok(()));

        let log = bus.log();
        let start = bus.first_write_with(CR, STRT).unwrap();
        let busy_before = log[..start]
            .iter()
            .filter(|op| matches!(op, Op::Read(SR, v) if v & BSY != 0))
            .count();
        let busy_after = log[start..]
            .iter()
            .filter(|op| matches!(op, Op::Read(SR, v) if v & BSY != 0))
            .count();
        assert_eq!(busy_before, 5);
        assert_eq!(busy_after, 0);

        // SER with sector 2 in SNB went out together with STRT
        let cr = bus.written(CR)[..].iter().copied().find(|v| v & STRT != 0).unwrap();
        assert_eq!(cr & (1 << 1), 1 << 1);
        assert_eq!((cr >> 3) & 0xF, 2);
    }

    #[test]
    fn erase_rejects_missing_sector() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let mut prog = flash.unlock().unwrap();

        assert_eq!(prog.erase_sector(8), Err(FlashError::InvalidSector));
        assert_eq!(bus.first_write_with(CR, STRT), None);
    }

    #[test]
    fn program_byte_sets_pg_first() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let mut prog = flash.unlock().unwrap();

        assert_eq!(prog.program_byte(0x0800_0010, 0xA5), Ok(()));

        let log = bus.log();
        let pg = bus.first_write_with(CR, 1).unwrap();
        let store = log
            .iter()
            .position(|op| *op == Op::WriteByte(0x0800_0010, 0xA5))
            .unwrap();
        assert!(pg < store);
        // x8 parallelism
        assert_eq!(bus.get(CR) & (0b11 << 8), 0);
        // PG cleared afterwards
        assert_eq!(bus.get(CR) & 1, 0);
    }

    #[test]
    fn program_rejects_outside_flash() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let mut prog = flash.unlock().unwrap();

        assert_eq!(prog.program_byte(0x2000_0000, 1), Err(FlashError::OutOfBounds));
        assert_eq!(
            prog.program(FLASH_END as usize - 1, &[1, 2]),
            Err(FlashError::OutOfBounds)
        );
        assert_eq!(bus.byte(0x2000_0000), None);
    }

    #[test]
    fn status_reports_errors() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let prog = flash.unlock().unwrap();

        bus.set(SR, 1 << 4);
        assert_eq!(prog.status(), Err(FlashError::WriteProtectionError));
        bus.set(SR, 1 << 5);
        assert_eq!(prog.status(), Err(FlashError::AlignmentError));
        bus.set(SR, 0);
        assert_eq!(prog.status(), Ok(()));
    }

    #[test]
    fn sector_coverage() {
        assert_eq!(sector_size(0), 0x4000);
        assert_eq!(sector_size(4), 0x1_0000);
        assert_eq!(sector_size(7), 0x2_0000);

        assert_eq!(sectors_for(0, 0), Some(0..1));
        assert_eq!(sectors_for(0, 0x4000), Some(0..1));
        assert_eq!(sectors_for(0, 0x4001), Some(0..2));
        assert_eq!(sectors_for(0, 0x2_0000), Some(0..5));
        assert_eq!(sectors_for(0, 0x8_0000), Some(0..8));
        assert_eq!(sectors_for(0, 0x8_0001), None);
        assert_eq!(sectors_for(5, 0x2_0001), Some(5..7));
        assert_eq!(sectors_for(8, 1), None);
    }

    #[test]
    fn image_is_erased_then_programmed() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];

        assert_eq!(write_image(&mut flash, 0, &payload), Ok(()));

        for (i, byte) in payload.iter().enumerate() {
            assert_eq!(bus.byte(0x0800_0000 + i), Some(*byte));
        }
        let log = bus.log();
        let erase = bus.first_write_with(CR, STRT).unwrap();
        let first_byte = log
            .iter()
            .position(|op| matches!(op, Op::WriteByte(..)))
            .unwrap();
        assert!(erase < first_byte);
        assert_eq!(bus.get(CR) & LOCK, LOCK);
    }

    #[test]
    fn image_spanning_two_sectors() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let mut payload = vec![0x5A; 0x4001];
        payload[0x4000] = 0xC3;

        assert_eq!(write_image(&mut flash, 0, &payload), Ok(()));

        // both sectors erased, in order, before any byte is programmed
        const SER: u32 = 1 << 1;
        let log = bus.log();
        let mut erased: Vec<u32> = log
            .iter()
            .filter_map(|op| match op {
                Op::Write(CR, v) if v & SER != 0 => Some((v >> 3) & 0xF),
                _ => None,
            })
            .collect();
        erased.dedup();
        assert_eq!(erased, vec![0, 1]);
        let last_erase = log
            .iter()
            .rposition(|op| matches!(op, Op::Write(CR, v) if v & SER != 0))
            .unwrap();
        let first_byte = log
            .iter()
            .position(|op| matches!(op, Op::WriteByte(..)))
            .unwrap();
        assert!(last_erase < first_byte);

        assert_eq!(bus.byte(0x0800_0000), Some(0x5A));
        assert_eq!(bus.byte(0x0800_3FFF), Some(0x5A));
        assert_eq!(bus.byte(0x0800_4000), Some(0xC3));
        assert_eq!(bus.byte(0x0800_4001), None);
        assert_eq!(bus.get(CR) & LOCK, LOCK);
    }

    #[test]
    fn program_rejects_overrun_before_writing() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);

        let start = SECTOR_ADDRESSES[7] as usize;
        let mut prog = flash.unlock().unwrap();
        assert_eq!(prog.program(start, &[1, 2, 3]), Ok(()));
        // runs one byte past the end of the flash
        assert_eq!(
            prog.program(FLASH_END as usize - 2, &[7, 8, 9]),
            Err(FlashError::OutOfBounds)
        );
        drop(prog);

        assert_eq!(bus.byte(start + 2), Some(3));
        assert_eq!(bus.byte(FLASH_END as usize - 2), None);
        assert_eq!(bus.get(CR) & LOCK, LOCK);
    }

    #[test]
    fn image_in_last_sector() {
        let bus = MockBus::new();
        let mut flash = Flash::new(&bus);
        let payload = [0u8; 16];

        assert_eq!(
            write_image(&mut flash, 7, &payload[..]),
            Ok(())
        );
        assert_eq!(bus.byte(0x0806_0000), Some(0));
        assert_eq!(sectors_for(7, 0x2_0001), None);
    }
}
