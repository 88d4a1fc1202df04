//! STM32F411 Hardware abstraction layer
//!
//! Every peripheral register is reached through one validated bit-field
//! accessor ([`field`]). A driver describes its registers once, as a
//! [`field::RegisterMap`], and the accessor refuses anything that would touch
//! a reserved bit, spill past bit 31 or overflow the field. Invalid writes
//! are dropped and invalid reads return [`field::INVALID`].
//!
//! Drivers are generic over the [`bus::RegisterBus`] they run on. On the
//! device that is [`bus::Mmio`]; the unit tests run the same drivers against
//! a RAM-backed bus.

#![cfg_attr(not(test), no_std)]

#[cfg(target_arch = "arm")]
use cortex_m as _;

pub use embedded_hal as hal;

pub mod adc;
pub mod board;
pub mod bus;
pub mod command;
pub mod delay;
pub mod dma;
pub mod exti;
pub mod field;
pub mod flash;
pub mod gpio;
pub mod map;
pub mod nvic;
pub mod prelude;
pub mod rcc;
pub mod scb;
pub mod serial;
pub mod time;
pub mod timer;

#[cfg(test)]
mod mock;
