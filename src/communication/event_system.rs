//! Typed board events and the broadcast bus collaborators subscribe to.

use crate::board::{Firmware, PinEdge, Version};
use firmata_shared::protocol::PinMode;
use std::fmt;
use tokio::sync::broadcast;

/// Everything the engine raises on its boundary: transport lifecycle,
/// handshake progress and every decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    Open,
    Close,
    Disconnect,
    Error(String),
    /// The version handshake did not complete in time. The connection stays open.
    Timeout,
    Ready,
    Version(Version),
    Firmware(Firmware),
    Capabilities { pin_count: usize },
    AnalogMapping { analog_pins: Vec<u8> },
    PinState { pin: u8, mode: PinMode, state: u32 },
    AnalogRead { channel: u8, pin: Option<u8>, value: u16 },
    DigitalRead { pin: u8, value: u8, edge: PinEdge },
    I2cReply { address: u16, register: u16, data: Vec<u16> },
    StringData(String),
    Sysex { command: u8, payload: Vec<u8> },
}

/// What a pending request waits for. Per-pin and per-address events get their
/// own key so a caller only wakes for the reply that answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Open,
    Close,
    Disconnect,
    Error,
    Timeout,
    Ready,
    Version,
    Firmware,
    Capabilities,
    AnalogMapping,
    PinState(u8),
    AnalogRead(u8),
    DigitalRead(u8),
    I2cReply { address: u16, register: u16 },
    StringData,
    Sysex(u8),
}

impl BoardEvent {
    pub fn key(&self) -> EventKey {
        match self {
            BoardEvent::Open => EventKey::Open,
            BoardEvent::Close => EventKey::Close,
            BoardEvent::Disconnect => EventKey::Disconnect,
            BoardEvent::Error(_) => EventKey::Error,
            BoardEvent::Timeout => EventKey::Timeout,
            BoardEvent::Ready => EventKey::Ready,
            BoardEvent::Version(_) => EventKey::Version,
            BoardEvent::Firmware(_) => EventKey::Firmware,
            BoardEvent::Capabilities { .. } => EventKey::Capabilities,
            BoardEvent::AnalogMapping { .. } => EventKey::AnalogMapping,
            BoardEvent::PinState { pin, .. } => EventKey::PinState(*pin),
            BoardEvent::AnalogRead { channel, .. } => EventKey::AnalogRead(*channel),
            BoardEvent::DigitalRead { pin, .. } => EventKey::DigitalRead(*pin),
            BoardEvent::I2cReply { address, register, .. } => EventKey::I2cReply {
                address: *address,
                register: *register,
            },
            BoardEvent::StringData(_) => EventKey::StringData,
            BoardEvent::Sysex { command, .. } => EventKey::Sysex(*command),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::PinState(pin) => write!(f, "pin-state-{}", pin),
            EventKey::AnalogRead(channel) => write!(f, "analog-read-{}", channel),
            EventKey::DigitalRead(pin) => write!(f, "digital-read-{}", pin),
            EventKey::I2cReply { address, register } => {
                write!(f, "I2C-reply-{}-{}", address, register)
            }
            EventKey::Sysex(command) => write!(f, "sysex-0x{:02X}", command),
            other => write!(f, "{}", format!("{:?}", other).to_lowercase()),
        }
    }
}

/// Tokio broadcast bus. Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BoardEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: BoardEvent) {
        tracing::trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
