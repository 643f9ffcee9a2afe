//! Caller facing error taxonomy
use crate::communication::event_system::EventKey;
use crate::communication::serializer::SerializerError;
use crate::protocol::messages::RegistryError;
use firmata_shared::protocol::{CodecError, PinMode};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirmataError {
    #[error("Pin {pin} is out of range ({count} pins known)")]
    PinOutOfRange { pin: u8, count: usize },
    #[error("Pin {pin} does not support mode {mode}")]
    UnsupportedMode { pin: u8, mode: PinMode },
    #[error("Board handshake has not completed")]
    NotReady,
    #[error("No pin is mapped to analog channel {0}")]
    NoAnalogChannel(u8),
    #[error("{what} {value} exceeds maximum {max}")]
    ValueOutOfRange { what: &'static str, value: u32, max: u32 },
    #[error("I2C has not been configured")]
    I2cNotConfigured,
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Timed out after {waited:?} waiting for {key}")]
    Timeout { key: EventKey, waited: Duration },
    #[error("Write failed: {0}")]
    Write(#[from] SerializerError),
    #[error("SysEx registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Connection closed while waiting for a reply")]
    Disconnected,
}

impl FirmataError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FirmataError::Timeout { .. })
    }
}
