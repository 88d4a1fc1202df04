//! Blinks the four user LEDs in turn
#![no_main]
#![no_std]

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;
use stm32f411_hal::{
    board::{self, Led},
    bus::Mmio,
    delay::{self, Delay},
    nvic::Interrupt,
    prelude::*,
    rcc::Clocks,
    scb::VectorTable,
    timer::{self, Timer},
};

static VECTORS: VectorTable = VectorTable::new();

extern "C" fn tick() {
    delay::on_tick();
    let bus = unsafe { Mmio::steal() };
    Timer::new(bus, timer::Instance::Tim1, 0_u32.hz()).clear_update();
}

#[entry]
fn main() -> ! {
    let bus = unsafe { Mmio::steal() };
    VECTORS.relocate(&bus);
    VECTORS.install(Interrupt::TIM1_UP_TIM10.nr(), tick);

    let clocks = Clocks::hsi();
    if let Err(err) = Timer::tick(bus, timer::Instance::Tim1, &clocks, 1_u32.khz().into()) {
        println!("no tick: {}", err);
    }

    let leds = board::led_init(bus);
    let mut delay = Delay::new();

    println!("blinking");
    loop {
        for led in Led::ALL {
            leds.on(led);
            delay.delay_ms(250_u32);
            leds.off(led);
        }
    }
}
