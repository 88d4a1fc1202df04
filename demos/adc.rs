//! Prints the die temperature once a second
#![no_main]
#![no_std]

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;
use stm32f411_hal::{
    adc::{self, Adc, AdcIn, VTemp},
    bus::Mmio,
    hal::adc::OneShot,
};

#[entry]
fn main() -> ! {
    let bus = unsafe { Mmio::steal() };
    let mut adc = Adc::init_temperature_sensor(bus);
    let mut sensor: VTemp = AdcIn;

    loop {
        match OneShot::read(&mut adc, &mut sensor) {
            Ok(raw) => println!("raw {} -> {} C", raw, adc::to_celsius(raw)),
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(())) => println!("conversion failed"),
        }
        cortex_m::asm::delay(16_000_000);
    }
}
