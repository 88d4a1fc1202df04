//! Toggles the orange LED from the user button (PA0) interrupt
#![no_main]
#![no_std]

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;
use stm32f411_hal::{
    board::{self, Led, Leds},
    bus::Mmio,
    exti::{self, Edge, Exti},
    gpio::{Gpio, Port},
    nvic::Nvic,
    rcc::{Peripheral, Rcc},
    scb::VectorTable,
};

static VECTORS: VectorTable = VectorTable::new();

const BUTTON: u8 = 0;

extern "C" fn button() {
    let bus = unsafe { Mmio::steal() };
    let exti = Exti::new(bus);
    if exti.is_pending(BUTTON) {
        exti.clear_pending(BUTTON);
        Leds::new(bus).toggle(Led::Orange);
    }
}

#[entry]
fn main() -> ! {
    let bus = unsafe { Mmio::steal() };
    let Some(irq) = exti::irq_for_line(BUTTON) else {
        panic!("no interrupt for line {}", BUTTON);
    };
    VECTORS.relocate(&bus);
    VECTORS.install(irq, button);

    let rcc = Rcc::new(bus);
    rcc.enable(Port::A.peripheral());
    rcc.enable(Peripheral::Syscfg);
    Gpio::new(bus, Port::A).into_input(BUTTON);

    board::led_init(bus);

    let exti = Exti::new(bus);
    exti.route(Port::A, BUTTON);
    exti.configure(BUTTON, Edge::Rising);
    Nvic::new(bus).enable(irq);

    println!("press the button");
    loop {
        cortex_m::asm::wfi();
    }
}
