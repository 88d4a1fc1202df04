//! Line commands accepted over the serial port
//!
//! Matching is by substring, ignoring ASCII case, so a line may carry
//! prompts, line endings or DMA padding around the command itself.

use core::fmt;

use crate::board::Led;

/// Reply to a line that matched nothing
pub const NOT_FOUND: &str = "COMMAND NOT FOUND";

/// Most decimals `format_float` prints
pub const MAX_DECIMALS: u8 = 9;

/// A parsed command line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Switch one LED
    Led { led: Led, on: bool },
    /// Report the die temperature
    Temperature,
    /// Stop normal operation and accept a firmware image
    UpdateFirmware,
    Unknown,
}

const LEDS: [(&[u8], Led); 4] = [
    (b"red", Led::Red),
    (b"green", Led::Green),
    (b"orange", Led::Orange),
    (b"blue", Led::Blue),
];

fn contains(line: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && line
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}

fn starts_with(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

// "<colour> led on" / "<colour> led off", at any occurrence of the colour
fn led_command(line: &[u8], colour: &[u8]) -> Option<bool> {
    let at = line
        .windows(colour.len())
        .position(|window| window.eq_ignore_ascii_case(colour))?;
    let rest = &line[at + colour.len()..];
    if starts_with(rest, b" led on") {
        Some(true)
    } else if starts_with(rest, b" led off") {
        Some(false)
    } else {
        led_command(rest, colour)
    }
}

/// Parses one received line
pub fn parse(line: &[u8]) -> Command {
    if contains(line, b"update firmware") {
        return Command::UpdateFirmware;
    }
    if contains(line, b"temperature") {
        return Command::Temperature;
    }
    for (colour, led) in LEDS {
        if let Some(on) = led_command(line, colour) {
            return Command::Led { led, on };
        }
    }
    Command::Unknown
}

/// Writes `value` with `decimals` digits after the point, like `%.Nf`
///
/// `decimals` above [`MAX_DECIMALS`] is clamped.
pub fn format_float<W: fmt::Write>(value: f32, decimals: u8, out: &mut W) -> fmt::Result {
    let precision = usize::from(decimals.min(MAX_DECIMALS));
    write!(out, "{:.*}", precision, value)
}
