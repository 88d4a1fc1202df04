//! RAM-backed register bus for host tests

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::vec::Vec;

use crate::bus::RegisterBus;

/// One bus transaction, in the order it happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read(usize, u32),
    Write(usize, u32),
    WriteByte(usize, u8),
}

#[derive(Default)]
struct State {
    words: BTreeMap<usize, u32>,
    bytes: BTreeMap<usize, u8>,
    // addr -> (mask, reads left)
    held: BTreeMap<usize, (u32, u32)>,
    // set/reset register -> output register it drives
    set_reset: BTreeMap<usize, usize>,
    log: Vec<Op>,
}

/// Sparse register memory that records every access
///
/// Unwritten words read as zero. [`MockBus::hold`] makes status flags stay
/// set for a number of polls, which is how busy and ready bits are modelled.
#[derive(Default)]
pub struct MockBus {
    state: RefCell<State>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presets a word without logging an access
    pub fn set(&self, addr: usize, value: u32) {
        self.state.borrow_mut().words.insert(addr, value);
    }

    /// Current stored word, without logging an access
    pub fn get(&self, addr: usize) -> u32 {
        self.state.borrow().words.get(&addr).copied().unwrap_or(0)
    }

    /// Stored byte from a byte write
    pub fn byte(&self, addr: usize) -> Option<u8> {
        self.state.borrow().bytes.get(&addr).copied()
    }

    /// Forces `mask` to read as set for the next `reads` loads of `addr`
    pub fn hold(&self, addr: usize, mask: u32, reads: u32) {
        self.state.borrow_mut().held.insert(addr, (mask, reads));
    }

    /// Makes stores to `bsrr` set and reset bits of `odr` the way GPIO does
    pub fn set_reset(&self, bsrr: usize, odr: usize) {
        self.state.borrow_mut().set_reset.insert(bsrr, odr);
    }

    pub fn log(&self) -> Vec<Op> {
        self.state.borrow().log.clone()
    }

    pub fn reads(&self, addr: usize) -> usize {
        self.count(|op| matches!(op, Op::Read(a, _) if *a == addr))
    }

    pub fn writes(&self, addr: usize) -> usize {
        self.count(|op| matches!(op, Op::Write(a, _) if *a == addr))
    }

    pub fn total_writes(&self) -> usize {
        self.count(|op| matches!(op, Op::Write(..) | Op::WriteByte(..)))
    }

    /// Values stored to `addr`, oldest first
    pub fn written(&self, addr: usize) -> Vec<u32> {
        self.state
            .borrow()
            .log
            .iter()
            .filter_map(|op| match op {
                Op::Write(a, v) if *a == addr => Some(*v),
                _ => None,
            })
            .collect()
    }

    pub fn last_write(&self, addr: usize) -> Option<u32> {
        self.written(addr).last().copied()
    }

    /// Position in the log of the first store to `addr` with all of `bits` set
    pub fn first_write_with(&self, addr: usize, bits: u32) -> Option<usize> {
        self.state
            .borrow()
            .log
            .iter()
            .position(|op| matches!(op, Op::Write(a, v) if *a == addr && v & bits == bits))
    }

    fn count(&self, f: impl Fn(&Op) -> bool) -> usize {
        self.state.borrow().log.iter().filter(|op| f(op)).count()
    }
}

impl RegisterBus for MockBus {
    fn read(&self, addr: usize) -> u32 {
        let mut state = self.state.borrow_mut();
        let mut value = state.words.get(&addr).copied().unwrap_or(0);
        if let Some((mask, left)) = state.held.get_mut(&addr) {
            if *left > 0 {
                *left -= 1;
                value |= *mask;
            }
        }
        state.log.push(Op::Read(addr, value));
        value
    }

    fn write(&self, addr: usize, value: u32) {
        let mut state = self.state.borrow_mut();
        state.words.insert(addr, value);
        if let Some(odr) = state.set_reset.get(&addr).copied() {
            let current = state.words.get(&odr).copied().unwrap_or(0);
            // set wins over reset
            let next = (current & !(value >> 16)) | (value & 0xFFFF);
            state.words.insert(odr, next);
        }
        state.log.push(Op::Write(addr, value));
    }

    fn write_byte(&self, addr: usize, value: u8) {
        let mut state = self.state.borrow_mut();
        state.bytes.insert(addr, value);
        state.log.push(Op::WriteByte(addr, value));
    }
}
