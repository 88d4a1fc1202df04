//! Toggles the green LED from the TIM2 update interrupt at 2 Hz
#![no_main]
#![no_std]

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;
use stm32f411_hal::{
    board::{self, Led, Leds},
    bus::Mmio,
    prelude::*,
    rcc::Clocks,
    scb::VectorTable,
    timer::{self, Timer},
};

static VECTORS: VectorTable = VectorTable::new();

extern "C" fn tim2() {
    let bus = unsafe { Mmio::steal() };
    Timer::new(bus, timer::Instance::Tim2, 0_u32.hz()).clear_update();
    Leds::new(bus).toggle(Led::Green);
}

#[entry]
fn main() -> ! {
    let bus = unsafe { Mmio::steal() };
    let clocks = Clocks::hsi();

    board::led_init(bus);
    VECTORS.relocate(&bus);
    VECTORS.install(timer::Instance::Tim2.update_irq().nr(), tim2);

    match Timer::tick(bus, timer::Instance::Tim2, &clocks, 2_u32.hz()) {
        Ok(timer) => println!("running: {}", timer.timing()),
        Err(err) => println!("no timer: {}", err),
    }

    loop {
        cortex_m::asm::wfi();
    }
}
