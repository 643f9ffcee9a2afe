//! Outbound message encoders. Pure functions from arguments to wire bytes;
//! multi-bit values always go through the shared 7-bit splitter.

use crate::error::FirmataError;
use firmata_shared::protocol::{
    check_7bit, encode_14bit, encode_7bit, frame_sysex, split_7bit, split_7bit_min, I2cMode,
    PinMode, ANALOG_MAPPING_QUERY, ANALOG_MESSAGE, CAPABILITY_QUERY, DIGITAL_MESSAGE,
    EXTENDED_ANALOG, I2C_CONFIG, I2C_REQUEST, MAX_SAMPLING_INTERVAL, MIN_SAMPLING_INTERVAL,
    PIN_STATE_QUERY, REPORT_ANALOG, REPORT_DIGITAL, REPORT_FIRMWARE, REPORT_VERSION,
    SAMPLING_INTERVAL, SET_PIN_MODE, STRING_DATA, SYSTEM_RESET,
};

/// Register value the firmware echoes back when a read named no register.
pub const I2C_REGISTER_NOT_SPECIFIED: u16 = 0x3FFF;

pub fn report_version() -> Vec<u8> {
    vec![REPORT_VERSION]
}

pub fn query_firmware() -> Vec<u8> {
    frame_sysex(REPORT_FIRMWARE, &[])
}

pub fn query_capabilities() -> Vec<u8> {
    frame_sysex(CAPABILITY_QUERY, &[])
}

pub fn query_analog_mapping() -> Vec<u8> {
    frame_sysex(ANALOG_MAPPING_QUERY, &[])
}

pub fn query_pin_state(pin: u8) -> Vec<u8> {
    frame_sysex(PIN_STATE_QUERY, &[pin & 0x7F])
}

pub fn system_reset() -> Vec<u8> {
    vec![SYSTEM_RESET]
}

pub fn set_pin_mode(pin: u8, mode: PinMode) -> Vec<u8> {
    vec![SET_PIN_MODE, pin & 0x7F, mode.as_byte()]
}

pub fn digital_port(port: usize, mask: u8) -> Vec<u8> {
    let [lsb, msb] = encode_14bit(mask as u16);
    vec![DIGITAL_MESSAGE | (port as u8 & 0x0F), lsb, msb]
}

pub fn report_digital(port: usize, enable: bool) -> Vec<u8> {
    vec![REPORT_DIGITAL | (port as u8 & 0x0F), enable as u8]
}

pub fn report_analog(channel: u8, enable: bool) -> Vec<u8> {
    vec![REPORT_ANALOG | (channel & 0x0F), enable as u8]
}

/// Short ANALOG_MESSAGE when pin and value fit, EXTENDED_ANALOG otherwise.
pub fn analog_write(pin: u8, value: u32) -> Vec<u8> {
    if pin <= 0x0F && value <= 0x3FFF {
        let [lsb, msb] = encode_14bit(value as u16);
        return vec![ANALOG_MESSAGE | pin, lsb, msb];
    }
    let mut payload = vec![pin & 0x7F];
    payload.extend(split_7bit_min(value, 2));
    frame_sysex(EXTENDED_ANALOG, &payload)
}

/// Interval in milliseconds, clamped to what the firmware accepts.
pub fn sampling_interval(interval_ms: u32) -> Vec<u8> {
    let interval = interval_ms.clamp(MIN_SAMPLING_INTERVAL, MAX_SAMPLING_INTERVAL);
    frame_sysex(SAMPLING_INTERVAL, &split_7bit(interval, 2))
}

pub fn i2c_config(delay_us: u16) -> Vec<u8> {
    frame_sysex(I2C_CONFIG, &split_7bit(delay_us as u32, 2))
}

fn i2c_header(address: u16, mode: I2cMode) -> Vec<u8> {
    let mut mode_byte = mode.request_bits();
    if address > 0x7F {
        // 10-bit addressing: upper address bits ride in the mode byte
        mode_byte |= 0x20 | ((address >> 7) & 0x07) as u8;
    }
    vec![(address & 0x7F) as u8, mode_byte]
}

pub fn i2c_write(address: u16, register: Option<u16>, data: &[u8]) -> Vec<u8> {
    let mut payload = i2c_header(address, I2cMode::Write);
    if let Some(register) = register {
        payload.extend(split_7bit(register as u32, 2));
    }
    for &byte in data {
        payload.extend(split_7bit(byte as u32, 2));
    }
    frame_sysex(I2C_REQUEST, &payload)
}

pub fn i2c_read(address: u16, register: Option<u16>, len: u16, continuous: bool) -> Vec<u8> {
    let mode = if continuous { I2cMode::ReadContinuously } else { I2cMode::ReadOnce };
    let mut payload = i2c_header(address, mode);
    if let Some(register) = register {
        payload.extend(split_7bit(register as u32, 2));
    }
    payload.extend(split_7bit(len as u32, 2));
    frame_sysex(I2C_REQUEST, &payload)
}

pub fn i2c_stop_reading(address: u16) -> Vec<u8> {
    frame_sysex(I2C_REQUEST, &i2c_header(address, I2cMode::StopReading))
}

/// UTF-8 text, NUL terminated, each byte as a 7-bit pair.
pub fn string_data(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    frame_sysex(STRING_DATA, &encode_7bit(&bytes))
}

/// User SysEx. The payload must already be 7-bit clean.
pub fn sysex(command: u8, payload: &[u8]) -> Result<Vec<u8>, FirmataError> {
    check_7bit(&[command])?;
    check_7bit(payload)?;
    Ok(frame_sysex(command, payload))
}
