//! Command-driven firmware for the STM32F411E-DISCO
//!
//! Blinks the blue LED once a second and listens on USART1 (PA9/PA10,
//! 115200 8N1). Commands arrive as fixed frames of `FRAME` bytes through
//! DMA2 Stream 2; see `stm32f411_hal::command` for what they may contain.
//!
//! "Update firmware" stops the command stream, then acknowledges over DMA2
//! Stream 7. Once the acknowledgement has been sent, the image is read from
//! the same port as a little-endian `u32` length followed by the image bytes,
//! written over flash sector 0 onwards and the device resets into it.
#![no_main]
#![no_std]

use core::fmt::Write as _;
use core::hint;
use core::slice;
use core::sync::atomic::Ordering;

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;
use stm32f411_hal::{
    adc::Adc,
    board::{self, DmaBuffer, Led, RX_READY, UPDATE_FIRMWARE},
    bus::Mmio,
    command::{self, Command},
    delay::{self, Delay},
    dma::{Controller, Stream, StreamId},
    flash::{self, Flash},
    gpio::Port,
    nvic::Interrupt,
    prelude::*,
    rcc::{Clocks, Rcc, CFGR},
    scb::VectorTable,
    serial::{self, DmaConfig, Serial},
    timer::{self, Timer},
};

/// Bytes per command frame
const FRAME: usize = 32;

/// Largest image accepted by the updater
const IMAGE_MAX: usize = 64 * 1024;

const ACK: &[u8] = b"UPDATE MODE\r\n";

static VECTORS: VectorTable = VectorTable::new();
static COMMAND: DmaBuffer<FRAME> = DmaBuffer::new();
static IMAGE: DmaBuffer<IMAGE_MAX> = DmaBuffer::new();

extern "C" fn tim1_up_tim10() {
    delay::on_tick();
    // NOTE(unsafe) only the TIM1 status register is touched
    let bus = unsafe { Mmio::steal() };
    Timer::new(bus, timer::Instance::Tim1, 0_u32.hz()).clear_update();
}

extern "C" fn dma2_stream2() {
    // NOTE(unsafe) only the stream 2 flags are touched
    let bus = unsafe { Mmio::steal() };
    Stream::new(bus, Controller::Dma2, StreamId::S2).clear_flags();
    RX_READY.store(true, Ordering::Release);
}

extern "C" fn dma2_stream7() {
    // NOTE(unsafe) only the stream 7 flags are touched
    let bus = unsafe { Mmio::steal() };
    Stream::new(bus, Controller::Dma2, StreamId::S7).clear_flags();
    UPDATE_FIRMWARE.store(true, Ordering::Release);
}

/// Reads a length-prefixed image into `IMAGE`
fn receive_image(serial: &mut Serial<Mmio>) -> Option<usize> {
    let mut header = [0u8; 4];
    for byte in header.iter_mut() {
        *byte = serial.receive().ok()? as u8;
    }
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 || len > IMAGE_MAX {
        return None;
    }

    for i in 0..len {
        IMAGE.store(i, serial.receive().ok()? as u8);
    }
    Some(len)
}

#[entry]
fn main() -> ! {
    // NOTE(unsafe) the only owner of the peripherals from here on
    let bus = unsafe { Mmio::steal() };

    VECTORS.relocate(&bus);
    VECTORS.install(Interrupt::TIM1_UP_TIM10.nr(), tim1_up_tim10);
    VECTORS.install(Interrupt::DMA2_STREAM2.nr(), dma2_stream2);
    VECTORS.install(Interrupt::DMA2_STREAM7.nr(), dma2_stream7);

    let rcc = Rcc::new(bus);
    let mut flash = Flash::new(bus);
    let clocks = CFGR::default()
        .freeze(&rcc, &mut flash)
        .unwrap_or_else(|err| {
            println!("clock bring-up failed: {}", err);
            Clocks::hsi()
        });
    println!("sysclk {} Hz", clocks.sysclk().raw());

    if let Err(err) = Timer::tick(bus, timer::Instance::Tim1, &clocks, 1_u32.khz().into()) {
        println!("no tick: {}", err);
    }

    let leds = board::led_init(bus);
    let mut adc = Adc::init_temperature_sensor(bus);
    let mut delay = Delay::new();

    let config = serial::Config::default()
        .baudrate(115_200_u32.bps())
        .dma(DmaConfig::TxRx);
    let mut serial = Serial::init(bus, serial::Instance::Usart1, config, (Port::A, 9, 10), &clocks);
    let mut rx = match board::listen_for_commands(&mut serial, &COMMAND) {
        Ok(stream) => stream,
        Err(err) => defmt::panic!("command stream: {}", err),
    };
    let _ = write!(serial, "READY\r\n");

    loop {
        if RX_READY.swap(false, Ordering::AcqRel) {
            let frame = COMMAND.snapshot();
            match command::parse(&frame) {
                Command::Led { led, on } => {
                    if on {
                        leds.on(led);
                    } else {
                        leds.off(led);
                    }
                    let _ = write!(serial, "OK\r\n");
                }
                Command::Temperature => {
                    let celsius = adc.read_temperature();
                    let _ = write!(serial, "TEMPERATURE ");
                    let _ = command::format_float(celsius, 2, &mut serial);
                    let _ = write!(serial, " C\r\n");
                }
                Command::UpdateFirmware => {
                    leds.on(Led::Red);
                    match board::begin_update(&mut serial, &mut rx, ACK) {
                        // the image follows the acknowledgement; no blink
                        // delay until it has been taken in
                        Ok(_tx) => {
                            while !UPDATE_FIRMWARE.load(Ordering::Acquire) {
                                hint::spin_loop();
                            }
                        }
                        Err(err) => {
                            println!("acknowledge failed: {}", err);
                            leds.off(Led::Red);
                            match board::listen_for_commands(&mut serial, &COMMAND) {
                                Ok(stream) => rx = stream,
                                Err(err) => println!("command stream: {}", err),
                            }
                        }
                    }
                }
                Command::Unknown => {
                    let _ = write!(serial, "{}\r\n", command::NOT_FOUND);
                }
            }
        }

        if UPDATE_FIRMWARE.swap(false, Ordering::AcqRel) {
            match receive_image(&mut serial) {
                Some(len) => {
                    // NOTE(unsafe) the receive stream is stopped and the
                    // image is never written again
                    let image = unsafe { slice::from_raw_parts(IMAGE.as_mut_ptr(), len) };
                    flash::update_firmware(image)
                }
                None => {
                    let _ = write!(serial, "UPDATE ABORTED\r\n");
                    leds.off(Led::Red);
                    match board::listen_for_commands(&mut serial, &COMMAND) {
                        Ok(stream) => rx = stream,
                        Err(err) => println!("command stream: {}", err),
                    }
                }
            }
        }

        leds.toggle(Led::Blue);
        delay.delay_ms(1_000);
    }
}
