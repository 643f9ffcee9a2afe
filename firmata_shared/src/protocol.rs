//! Firmata command bytes, pin modes and the 7-bit value codec.
//!
//! Every value wider than 7 bits travels as LSB-first groups of 7 bits so that
//! only the framing and command bytes ever have the high bit set. All encoders
//! in the host go through [`split_7bit`] / [`join_7bit`]; nothing re-derives
//! the shifts by hand.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ########################################
// Message command bytes (0x80-0xFF)

/// Send data for a digital port (collection of 8 pins), low nibble is the port
pub const DIGITAL_MESSAGE: u8 = 0x90;
/// Send data for an analog channel (or PWM), low nibble is the channel
pub const ANALOG_MESSAGE: u8 = 0xE0;
/// Enable analog input by channel
pub const REPORT_ANALOG: u8 = 0xC0;
/// Enable digital input by port
pub const REPORT_DIGITAL: u8 = 0xD0;
/// Set a pin to INPUT/OUTPUT/PWM/etc
pub const SET_PIN_MODE: u8 = 0xF4;
/// Set value of an individual digital pin
pub const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
/// Report protocol version
pub const REPORT_VERSION: u8 = 0xF9;
/// Reset the board firmware
pub const SYSTEM_RESET: u8 = 0xFF;
/// Start a SysEx message
pub const START_SYSEX: u8 = 0xF0;
/// End a SysEx message
pub const END_SYSEX: u8 = 0xF7;

// ########################################
// Extended command set using SysEx (0x00-0x7F)

/// Ask for the analog channel of every pin
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
/// Reply with the analog channel of every pin
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
/// Ask for supported modes and resolution of all pins
pub const CAPABILITY_QUERY: u8 = 0x6B;
/// Reply with supported modes and resolution
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
/// Ask for a pin's current mode and state
pub const PIN_STATE_QUERY: u8 = 0x6D;
/// Reply with a pin's current mode and state
pub const PIN_STATE_RESPONSE: u8 = 0x6E;
/// Analog write to any pin, including PWM and servo
pub const EXTENDED_ANALOG: u8 = 0x6F;
/// String message with 14 bits per char
pub const STRING_DATA: u8 = 0x71;
/// Send an I2C read/write request
pub const I2C_REQUEST: u8 = 0x76;
/// Reply to an I2C read request
pub const I2C_REPLY: u8 = 0x77;
/// Config I2C settings such as delay times
pub const I2C_CONFIG: u8 = 0x78;
/// Report name and version of the firmware
pub const REPORT_FIRMWARE: u8 = 0x79;
/// Set the poll rate of the main loop
pub const SAMPLING_INTERVAL: u8 = 0x7A;

/// Capability and analog-mapping separator / "not analog" marker.
pub const PIN_TERMINATOR: u8 = 0x7F;
pub const NOT_ANALOG: u8 = 0x7F;

/// Number of 8-pin ports addressable by a digital message.
pub const PORT_COUNT: usize = 16;
/// Pins beyond this cannot be addressed by a 7-bit pin byte or a port message.
pub const MAX_PINS: usize = PORT_COUNT * 8;

pub const MIN_SAMPLING_INTERVAL: u32 = 10;
pub const MAX_SAMPLING_INTERVAL: u32 = 0x3FFF;

/// I2C request read/write mode, placed in bits 3..4 of the mode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cMode {
    Write = 0,
    ReadOnce = 1,
    ReadContinuously = 2,
    StopReading = 3,
}

impl I2cMode {
    pub fn request_bits(self) -> u8 {
        (self as u8) << 3
    }
}

/// A pin mode as reported by the capability response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
    Shift,
    I2c,
    OneWire,
    Stepper,
    Encoder,
    Serial,
    Pullup,
    Ignore,
    Other(u8),
}

impl PinMode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PinMode::Input,
            0x01 => PinMode::Output,
            0x02 => PinMode::Analog,
            0x03 => PinMode::Pwm,
            0x04 => PinMode::Servo,
            0x05 => PinMode::Shift,
            0x06 => PinMode::I2c,
            0x07 => PinMode::OneWire,
            0x08 => PinMode::Stepper,
            0x09 => PinMode::Encoder,
            0x0A => PinMode::Serial,
            0x0B => PinMode::Pullup,
            0x7F => PinMode::Ignore,
            other => PinMode::Other(other & 0x7F),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PinMode::Input => 0x00,
            PinMode::Output => 0x01,
            PinMode::Analog => 0x02,
            PinMode::Pwm => 0x03,
            PinMode::Servo => 0x04,
            PinMode::Shift => 0x05,
            PinMode::I2c => 0x06,
            PinMode::OneWire => 0x07,
            PinMode::Stepper => 0x08,
            PinMode::Encoder => 0x09,
            PinMode::Serial => 0x0A,
            PinMode::Pullup => 0x0B,
            PinMode::Ignore => 0x7F,
            PinMode::Other(byte) => byte & 0x7F,
        }
    }

    /// Digital input modes whose bits are reported through digital messages.
    pub fn is_digital_input(self) -> bool {
        matches!(self, PinMode::Input | PinMode::Pullup)
    }

    /// Modes whose value is mirrored in the port bitmask.
    pub fn is_digital(self) -> bool {
        matches!(self, PinMode::Input | PinMode::Pullup | PinMode::Output)
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinMode::Other(byte) => write!(f, "mode(0x{:02X})", byte),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Set of modes a pin supports, one bit per mode byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModeSet(u128);

impl Serialize for ModeSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl ModeSet {
    pub const fn empty() -> Self {
        ModeSet(0)
    }

    pub fn insert(&mut self, mode: PinMode) {
        self.0 |= 1u128 << mode.as_byte();
    }

    pub fn contains(&self, mode: PinMode) -> bool {
        self.0 & (1u128 << mode.as_byte()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PinMode> + '_ {
        (0u8..128)
            .filter(|bit| self.0 & (1u128 << bit) != 0)
            .map(PinMode::from_byte)
    }
}

impl FromIterator<PinMode> for ModeSet {
    fn from_iter<I: IntoIterator<Item = PinMode>>(iter: I) -> Self {
        let mut set = ModeSet::empty();
        for mode in iter {
            set.insert(mode);
        }
        set
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("7-bit payload has odd length {0}")]
    OddLength(usize),
    #[error("byte 0x{byte:02X} at offset {offset} does not fit in 7 bits")]
    NotSevenBit { offset: usize, byte: u8 },
}

/// Split `value` into exactly `groups` LSB-first 7-bit bytes.
pub fn split_7bit(value: u32, groups: usize) -> Vec<u8> {
    (0..groups)
        .map(|i| {
            let shift = 7 * i as u32;
            if shift >= 32 { 0 } else { ((value >> shift) & 0x7F) as u8 }
        })
        .collect()
}

/// Split `value` into as many 7-bit groups as it needs, never fewer than
/// `min_groups`.
pub fn split_7bit_min(value: u32, min_groups: usize) -> Vec<u8> {
    let mut needed = 1;
    while needed < 5 && (value >> (7 * needed)) != 0 {
        needed += 1;
    }
    split_7bit(value, needed.max(min_groups))
}

/// Reassemble LSB-first 7-bit groups. Bits above bit 6 of each byte are ignored.
pub fn join_7bit(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(5)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (((b & 0x7F) as u32) << (7 * i)))
}

pub fn encode_14bit(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

pub fn decode_14bit(lsb: u8, msb: u8) -> u16 {
    (lsb & 0x7F) as u16 | (((msb & 0x7F) as u16) << 7)
}

/// Encode arbitrary 8-bit data as pairs of 7-bit bytes.
pub fn encode_7bit(data: &[u8]) -> Vec<u8> {
    data.iter().flat_map(|&b| [b & 0x7F, (b >> 7) & 0x01]).collect()
}

/// Decode pairs of 7-bit bytes back to 8-bit data.
pub fn decode_7bit(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() % 2 != 0 {
        return Err(CodecError::OddLength(data.len()));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| (decode_14bit(pair[0], pair[1]) & 0xFF) as u8)
        .collect())
}

/// Reject payloads that would collide with command bytes.
pub fn check_7bit(data: &[u8]) -> Result<(), CodecError> {
    match data.iter().position(|&b| b > 0x7F) {
        Some(offset) => Err(CodecError::NotSevenBit { offset, byte: data[offset] }),
        None => Ok(()),
    }
}

/// Wrap a payload (command byte first) in START_SYSEX / END_SYSEX.
pub fn frame_sysex(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_SYSEX);
    frame.push(command);
    frame.extend_from_slice(payload);
    frame.push(END_SYSEX);
    frame
}
