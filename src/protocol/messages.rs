//! Message registry: typed decoding of completed frames.
//!
//! Built-in opcodes dispatch through an exhaustive match on [`ShortMessage`]
//! and [`SysexCommand`]. User-registered SysEx handlers live in one map and are
//! checked for collisions when they are registered, never on first use.

use crate::board::{Board, Firmware, PinCapability, Version};
use crate::communication::event_system::BoardEvent;
use crate::protocol::parser::{short_opcode, FrameSink};
use firmata_shared::protocol::{
    decode_14bit, join_7bit, PinMode, ANALOG_MAPPING_RESPONSE, ANALOG_MESSAGE,
    CAPABILITY_RESPONSE, DIGITAL_MESSAGE, I2C_REPLY, NOT_ANALOG, PIN_STATE_RESPONSE,
    PIN_TERMINATOR, REPORT_FIRMWARE, REPORT_VERSION, STRING_DATA,
};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("SysEx command 0x{0:02X} already has a handler")]
    DuplicateHandler(u8),
    #[error("SysEx command 0x{0:02X} is reserved")]
    ReservedCommand(u8),
    #[error("SysEx command 0x{0:02X} has no registered handler")]
    NotRegistered(u8),
}

/// Kinds of 3-byte messages the host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortMessage {
    ReportVersion,
    Analog { channel: u8 },
    Digital { port: u8 },
}

impl ShortMessage {
    pub fn classify(first: u8) -> Option<Self> {
        match short_opcode(first) {
            REPORT_VERSION => Some(ShortMessage::ReportVersion),
            ANALOG_MESSAGE => Some(ShortMessage::Analog { channel: first & 0x0F }),
            DIGITAL_MESSAGE => Some(ShortMessage::Digital { port: first & 0x0F }),
            _ => None,
        }
    }
}

/// Kinds of SysEx replies, keyed by the byte after START_SYSEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysexCommand {
    Firmware,
    Capability,
    AnalogMapping,
    PinState,
    I2cReply,
    StringData,
    Custom(u8),
}

impl SysexCommand {
    pub fn builtin(command: u8) -> Option<Self> {
        match command {
            REPORT_FIRMWARE => Some(SysexCommand::Firmware),
            CAPABILITY_RESPONSE => Some(SysexCommand::Capability),
            ANALOG_MAPPING_RESPONSE => Some(SysexCommand::AnalogMapping),
            PIN_STATE_RESPONSE => Some(SysexCommand::PinState),
            I2C_REPLY => Some(SysexCommand::I2cReply),
            STRING_DATA => Some(SysexCommand::StringData),
            _ => None,
        }
    }
}

/// Handler for a user-registered SysEx command. Receives the payload without
/// START_SYSEX, the command byte and END_SYSEX.
pub type SysexHandler = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Default)]
pub struct MessageRegistry {
    custom: HashMap<u8, SysexHandler>,
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.custom.keys().collect();
        commands.sort();
        f.debug_struct("MessageRegistry").field("custom", &commands).finish()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify_sysex(&self, command: u8) -> Option<SysexCommand> {
        SysexCommand::builtin(command).or_else(|| {
            self.custom
                .contains_key(&command)
                .then_some(SysexCommand::Custom(command))
        })
    }

    pub fn register(&mut self, command: u8, handler: SysexHandler) -> Result<(), RegistryError> {
        if command > 0x7F || SysexCommand::builtin(command).is_some() {
            return Err(RegistryError::ReservedCommand(command));
        }
        if self.custom.contains_key(&command) {
            return Err(RegistryError::DuplicateHandler(command));
        }
        tracing::debug!("registered SysEx handler for 0x{:02X}", command);
        self.custom.insert(command, handler);
        Ok(())
    }

    pub fn unregister(&mut self, command: u8) -> Result<(), RegistryError> {
        self.custom
            .remove(&command)
            .map(|_| ())
            .ok_or(RegistryError::NotRegistered(command))
    }

    pub fn is_registered(&self, command: u8) -> bool {
        self.custom.contains_key(&command)
    }

    pub fn decode_short(&mut self, frame: [u8; 3], board: &mut Board, events: &mut Vec<BoardEvent>) {
        let Some(kind) = ShortMessage::classify(frame[0]) else {
            return;
        };
        let value = decode_14bit(frame[1], frame[2]);
        match kind {
            ShortMessage::ReportVersion => {
                let version = Version { major: frame[1], minor: frame[2] };
                tracing::debug!("protocol version {}.{}", version.major, version.minor);
                board.set_protocol_version(version);
                events.push(BoardEvent::Version(version));
            }
            ShortMessage::Analog { channel } => {
                let pin = board.apply_analog_value(channel, value);
                events.push(BoardEvent::AnalogRead { channel, pin, value });
            }
            ShortMessage::Digital { port } => {
                for (pin, value, edge) in board.apply_digital_port(port as usize, value) {
                    events.push(BoardEvent::DigitalRead { pin, value, edge });
                }
            }
        }
    }

    pub fn decode_sysex(&mut self, frame: &[u8], board: &mut Board, events: &mut Vec<BoardEvent>) {
        if frame.len() < 3 {
            return;
        }
        let command = frame[1];
        let payload = &frame[2..frame.len() - 1];
        let Some(kind) = self.classify_sysex(command) else {
            tracing::trace!("no handler for SysEx 0x{:02X}, {} byte payload", command, payload.len());
            return;
        };
        match kind {
            SysexCommand::Firmware => decode_firmware(payload, board, events),
            SysexCommand::Capability => decode_capabilities(payload, board, events),
            SysexCommand::AnalogMapping => decode_analog_mapping(payload, board, events),
            SysexCommand::PinState => decode_pin_state(payload, board, events),
            SysexCommand::I2cReply => decode_i2c_reply(payload, board, events),
            SysexCommand::StringData => {
                events.push(BoardEvent::StringData(decode_string(payload)));
            }
            SysexCommand::Custom(command) => {
                if let Some(handler) = self.custom.get_mut(&command) {
                    handler(payload);
                }
                events.push(BoardEvent::Sysex { command, payload: payload.to_vec() });
            }
        }
    }
}

/// Text carried as 7-bit pairs; NUL padding is stripped.
fn decode_string(payload: &[u8]) -> String {
    let bytes: Vec<u8> = payload
        .chunks(2)
        .map(|pair| (decode_14bit(pair[0], pair.get(1).copied().unwrap_or(0)) & 0xFF) as u8)
        .filter(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn decode_firmware(payload: &[u8], board: &mut Board, events: &mut Vec<BoardEvent>) {
    let [major, minor, name @ ..] = payload else {
        tracing::debug!("firmware reply too short ({} bytes)", payload.len());
        return;
    };
    let firmware = Firmware {
        name: decode_string(name),
        version: Version { major: *major, minor: *minor },
    };
    tracing::debug!("firmware {} {}.{}", firmware.name, major, minor);
    board.set_firmware(firmware.clone());
    events.push(BoardEvent::Firmware(firmware));
}

fn decode_capabilities(payload: &[u8], board: &mut Board, events: &mut Vec<BoardEvent>) {
    let mut capabilities = Vec::new();
    let mut current = PinCapability::default();
    let mut i = 0;
    while i < payload.len() {
        if payload[i] == PIN_TERMINATOR {
            capabilities.push(std::mem::take(&mut current));
            i += 1;
            continue;
        }
        if let Some(&resolution) = payload.get(i + 1) {
            current.modes.push((PinMode::from_byte(payload[i]), resolution));
        }
        i += 2;
    }
    let pin_count = capabilities.len();
    if board.apply_capabilities(capabilities) {
        tracing::debug!("capability response: {} pins", pin_count);
    }
    events.push(BoardEvent::Capabilities { pin_count: board.pins().len() });
}

fn decode_analog_mapping(payload: &[u8], board: &mut Board, events: &mut Vec<BoardEvent>) {
    let channels: Vec<Option<u8>> = payload
        .iter()
        .map(|&channel| (channel != NOT_ANALOG).then_some(channel))
        .collect();
    board.apply_analog_mapping(&channels);
    events.push(BoardEvent::AnalogMapping { analog_pins: board.analog_pins().to_vec() });
}

fn decode_pin_state(payload: &[u8], board: &mut Board, events: &mut Vec<BoardEvent>) {
    let [pin, mode, state @ ..] = payload else {
        return;
    };
    let mode = PinMode::from_byte(*mode);
    // up to 21 bits in three 7-bit groups
    let state = join_7bit(&state[..state.len().min(3)]);
    if board.apply_pin_state(*pin, mode, state) {
        events.push(BoardEvent::PinState { pin: *pin, mode, state });
    } else {
        tracing::debug!("pin state reply for unknown pin {}", pin);
    }
}

fn decode_i2c_reply(payload: &[u8], board: &mut Board, events: &mut Vec<BoardEvent>) {
    if payload.len() < 4 {
        return;
    }
    let address = decode_14bit(payload[0], payload[1]);
    let register = decode_14bit(payload[2], payload[3]);
    let data: Vec<u16> = payload[4..]
        .chunks_exact(2)
        .map(|pair| decode_14bit(pair[0], pair[1]))
        .collect();
    board.store_i2c_reply(address, register, data.clone());
    events.push(BoardEvent::I2cReply { address, register, data });
}

/// [`FrameSink`] that decodes into a board and collects raised events.
pub struct Dispatcher<'a> {
    pub board: &'a mut Board,
    pub registry: &'a mut MessageRegistry,
    pub events: Vec<BoardEvent>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(board: &'a mut Board, registry: &'a mut MessageRegistry) -> Self {
        Self { board, registry, events: Vec::new() }
    }
}

impl FrameSink for Dispatcher<'_> {
    fn short_message(&mut self, frame: [u8; 3]) {
        self.registry.decode_short(frame, self.board, &mut self.events);
    }

    fn sysex_message(&mut self, frame: &[u8]) {
        self.registry.decode_sysex(frame, self.board, &mut self.events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::PinEdge;
    use std::sync::{Arc, Mutex};

    fn decode(registry: &mut MessageRegistry, board: &mut Board, frame: &[u8]) -> Vec<BoardEvent> {
        let mut events = Vec::new();
        if frame[0] == 0xF0 {
            registry.decode_sysex(frame, board, &mut events);
        } else {
            registry.decode_short([frame[0], frame[1], frame[2]], board, &mut events);
        }
        events
    }

    #[test]
    fn test_firmware_name_decodes_pairs() {
        let mut registry = MessageRegistry::new();
        let mut board = Board::new();
        let frame = [0xF0, 0x79, 0x02, 0x05, b'A', 0x00, b'b', 0x00, 0xF7];
        let events = decode(&mut registry, &mut board, &frame);
        let expected = Firmware { name: "Ab".to_string(), version: Version { major: 2, minor: 5 } };
        assert_eq!(events, vec![BoardEvent::Firmware(expected.clone())]);
        assert_eq!(board.firmware(), Some(&expected));
    }

    #[test]
    fn test_pin_state_accumulates_21_bits() {
        let mut registry = MessageRegistry::new();
        let mut board = Board::new();
        decode(&mut registry, &mut board, &[0xF0, 0x6C, 0x01, 0x01, 0x03, 0x08, 0x7F, 0xF7]);
        let events = decode(&mut registry, &mut board, &[0xF0, 0x6E, 0x00, 0x03, 0x7F, 0x7F, 0x01, 0xF7]);
        assert_eq!(
            events,
            vec![BoardEvent::PinState { pin: 0, mode: PinMode::Pwm, state: 0x7FFF }]
        );
        assert_eq!(board.pin(0).unwrap().state, Some(0x7FFF));
    }

    #[test]
    fn test_i2c_reply_is_cached() {
        let mut registry = MessageRegistry::new();
        let mut board = Board::new();
        let frame = [0xF0, 0x77, 0x48, 0x00, 0x01, 0x00, 0x7F, 0x01, 0x02, 0x00, 0xF7];
        let events = decode(&mut registry, &mut board, &frame);
        assert_eq!(
            events,
            vec![BoardEvent::I2cReply { address: 0x48, register: 1, data: vec![0xFF, 0x02] }]
        );
        assert_eq!(board.i2c_reply(0x48, 1), Some(&[0xFF, 0x02][..]));
    }

    #[test]
    fn test_digital_message_events_per_input_pin() {
        let mut registry = MessageRegistry::new();
        let mut board = Board::new();
        decode(&mut registry, &mut board, &[0xF0, 0x6C, 0x00, 0x01, 0x7F, 0x00, 0x01, 0x7F, 0xF7]);
        board.set_mode(0, PinMode::Input).unwrap();
        let events = decode(&mut registry, &mut board, &[0x90, 0x03, 0x00]);
        assert_eq!(events, vec![BoardEvent::DigitalRead { pin: 0, value: 1, edge: PinEdge::Idle }]);
    }

    #[test]
    fn test_custom_handler_receives_payload() {
        let mut registry = MessageRegistry::new();
        let mut board = Board::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .register(0x01, Box::new(move |payload| sink.lock().unwrap().extend_from_slice(payload)))
            .unwrap();
        let events = decode(&mut registry, &mut board, &[0xF0, 0x01, 0x0A, 0x0B, 0xF7]);
        assert_eq!(*seen.lock().unwrap(), vec![0x0A, 0x0B]);
        assert_eq!(events, vec![BoardEvent::Sysex { command: 0x01, payload: vec![0x0A, 0x0B] }]);
    }

    #[test]
    fn test_registration_conflicts() {
        let mut registry = MessageRegistry::new();
        registry.register(0x01, Box::new(|_| {})).unwrap();
        assert_eq!(
            registry.register(0x01, Box::new(|_| {})),
            Err(RegistryError::DuplicateHandler(0x01))
        );
        assert_eq!(
            registry.register(STRING_DATA, Box::new(|_| {})),
            Err(RegistryError::ReservedCommand(STRING_DATA))
        );
        registry.unregister(0x01).unwrap();
        assert_eq!(registry.unregister(0x01), Err(RegistryError::NotRegistered(0x01)));
    }

    #[test]
    fn test_unknown_sysex_is_ignored() {
        let mut registry = MessageRegistry::new();
        let mut board = Board::new();
        assert!(decode(&mut registry, &mut board, &[0xF0, 0x02, 0x01, 0xF7]).is_empty());
    }
}
