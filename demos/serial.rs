//! Echoes every byte received on USART2 (PA2/PA3) back to the sender
#![no_main]
#![no_std]

use core::fmt::Write as _;

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use nb::block;
use panic_probe as _;
use stm32f411_hal::{
    bus::Mmio,
    gpio::Port,
    hal::serial::{Read, Write},
    prelude::*,
    rcc::Clocks,
    serial::{self, Serial},
};

#[entry]
fn main() -> ! {
    let bus = unsafe { Mmio::steal() };
    let clocks = Clocks::hsi();

    let config = serial::Config::default().baudrate(9_600_u32.bps());
    let mut serial = Serial::init(bus, serial::Instance::Usart2, config, (Port::A, 2, 3), &clocks);

    let _ = writeln!(serial, "echo\r");
    loop {
        match block!(Read::read(&mut serial)) {
            Ok(byte) => {
                let _ = block!(Write::write(&mut serial, byte));
            }
            Err(err) => println!("receive error: {}", err),
        }
    }
}
