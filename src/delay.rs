//! Delays
//!
//! A millisecond counter advanced by a periodic timer interrupt. The ISR of
//! the tick timer (TIM1_UP_TIM10 in the firmware) calls [`on_tick`] and
//! clears its update flag; [`Delay`] busy-waits on the count.

use core::hint;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal::blocking::delay::DelayMs;

/// Milliseconds elapsed since the last reset by [`Delay`]
pub static MS_TICKS: AtomicU32 = AtomicU32::new(0);

/// Advances the millisecond counter; call once per tick interrupt
#[inline(always)]
pub fn on_tick() {
    MS_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Tick-driven delay provider
///
/// Not reentrant: a delay restarts the shared counter, and waiting from the
/// tick ISR itself never returns because the counter cannot advance.
#[derive(Default)]
pub struct Delay {
    _0: (),
}

impl Delay {
    /// Requires the tick timer to be running, see `Timer::tick`
    pub const fn new() -> Self {
        Delay { _0: () }
    }

    /// Busy-waits for `ms` ticks
    pub fn delay_ms(&mut self, ms: u32) {
        MS_TICKS.store(0, Ordering::Relaxed);
        while MS_TICKS.load(Ordering::Relaxed) < ms {
            hint::spin_loop();
        }
    }
}

impl DelayMs<u32> for Delay {
    fn delay_ms(&mut self, ms: u32) {
        Delay::delay_ms(self, ms)
    }
}

impl DelayMs<u16> for Delay {
    fn delay_ms(&mut self, ms: u16) {
        Delay::delay_ms(self, u32::from(ms))
    }
}

impl DelayMs<u8> for Delay {
    fn delay_ms(&mut self, ms: u8) {
        Delay::delay_ms(self, u32::from(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waits_for_ticks() {
        let done = Arc::new(AtomicBool::new(false));
        let ticker = {
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    on_tick();
                    thread::yield_now();
                }
            })
        };

        let mut delay = Delay::new();
        delay.delay_ms(5u32);
        DelayMs::<u8>::delay_ms(&mut delay, 3);

        done.store(true, Ordering::Relaxed);
        ticker.join().unwrap();
    }

    #[test]
    fn zero_returns_immediately() {
        Delay::new().delay_ms(0);
    }
}
