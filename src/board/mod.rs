//! Board state and capability model
//!
//! The Board owns everything the protocol tells us about the microcontroller:
//! pins, port bitmasks, identity, resolutions and sensor caches. Decoders mutate
//! it from the inbound path; caller-side mutators validate before any byte is
//! written and return a snapshot so a failed write can be rolled back.

use crate::error::FirmataError;
use firmata_shared::protocol::{ModeSet, PinMode, MAX_PINS, PORT_COUNT};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Firmware {
    pub name: String,
    pub version: Version,
}

/// Last edge seen on a digital input. 0→1 is `Released`, 1→0 is `Pressed`:
/// inputs are wired active-low, so a line going high means the key let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinEdge {
    #[default]
    Idle,
    Pressed,
    Released,
}

/// Explicit handshake phase; replaces "is the pin array empty" checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HandshakePhase {
    #[default]
    AwaitingHandshake,
    CapabilitiesKnown,
    Ready,
}

/// One pin's entry in a capability response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinCapability {
    pub modes: Vec<(PinMode, u8)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pin {
    pub index: u8,
    pub supported_modes: ModeSet,
    /// Bit resolution per supported mode, as declared by the capability response.
    #[serde(skip)]
    pub resolutions: BTreeMap<PinMode, u8>,
    pub mode: Option<PinMode>,
    pub value: Option<u32>,
    pub edge: PinEdge,
    pub report: bool,
    pub analog_channel: Option<u8>,
    pub state: Option<u32>,
}

impl Pin {
    pub fn new(index: u8, capability: &PinCapability) -> Self {
        Self {
            index,
            supported_modes: capability.modes.iter().map(|(mode, _)| *mode).collect(),
            resolutions: capability.modes.iter().copied().collect(),
            mode: None,
            value: None,
            edge: PinEdge::Idle,
            report: false,
            analog_channel: None,
            state: None,
        }
    }

    pub fn supports(&self, mode: PinMode) -> bool {
        self.supported_modes.contains(mode)
    }

    pub fn port(&self) -> usize {
        self.index as usize >> 3
    }

    fn bit(&self) -> u8 {
        1 << (self.index & 0x07)
    }
}

/// First resolution declared for each mode. Immutable until the next handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolutions {
    bits: BTreeMap<PinMode, u8>,
}

impl Resolutions {
    fn record(&mut self, mode: PinMode, bits: u8) {
        self.bits.entry(mode).or_insert(bits);
    }

    pub fn bits(&self, mode: PinMode) -> Option<u8> {
        self.bits.get(&mode).copied()
    }

    pub fn adc(&self) -> Option<u8> {
        self.bits(PinMode::Analog)
    }

    pub fn pwm(&self) -> Option<u8> {
        self.bits(PinMode::Pwm)
    }

    /// Largest value representable at the mode's resolution.
    pub fn max_value(&self, mode: PinMode) -> Option<u32> {
        self.bits(mode)
            .map(|bits| if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 })
    }
}

/// State needed to undo a caller-side mutation whose write failed.
#[derive(Debug, Clone)]
pub struct PinSnapshot {
    pin: Pin,
    port_mask: u8,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Board {
    phase: HandshakePhase,
    pins: Vec<Pin>,
    ports: [u8; PORT_COUNT],
    analog_pins: Vec<u8>,
    protocol_version: Option<Version>,
    firmware: Option<Firmware>,
    #[serde(skip)]
    resolutions: Resolutions,
    #[serde(skip)]
    i2c_replies: HashMap<(u16, u16), Vec<u16>>,
    i2c_configured: bool,
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    // --- read accessors ---

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == HandshakePhase::Ready
    }

    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    pub fn pin(&self, index: u8) -> Result<&Pin, FirmataError> {
        self.pins.get(index as usize).ok_or(FirmataError::PinOutOfRange {
            pin: index,
            count: self.pins.len(),
        })
    }

    pub fn port(&self, port: usize) -> u8 {
        self.ports.get(port).copied().unwrap_or(0)
    }

    pub fn analog_pins(&self) -> &[u8] {
        &self.analog_pins
    }

    /// Physical pin carrying `channel`, if the analog mapping is known.
    pub fn analog_pin(&self, channel: u8) -> Option<u8> {
        self.pins
            .iter()
            .find(|pin| pin.analog_channel == Some(channel))
            .map(|pin| pin.index)
    }

    pub fn protocol_version(&self) -> Option<Version> {
        self.protocol_version
    }

    pub fn firmware(&self) -> Option<&Firmware> {
        self.firmware.as_ref()
    }

    pub fn resolutions(&self) -> &Resolutions {
        &self.resolutions
    }

    pub fn i2c_reply(&self, address: u16, register: u16) -> Option<&[u16]> {
        self.i2c_replies.get(&(address, register)).map(Vec::as_slice)
    }

    pub fn i2c_configured(&self) -> bool {
        self.i2c_configured
    }

    // --- lifecycle ---

    /// Back to the pre-handshake state. Used on reconnect, disconnect and
    /// system reset.
    pub fn reset(&mut self) {
        *self = Board::default();
    }

    pub fn mark_ready(&mut self) {
        self.phase = HandshakePhase::Ready;
    }

    pub fn require_ready(&self) -> Result<(), FirmataError> {
        if self.is_ready() { Ok(()) } else { Err(FirmataError::NotReady) }
    }

    // --- decode-side mutators ---

    pub fn set_protocol_version(&mut self, version: Version) {
        self.protocol_version = Some(version);
    }

    pub fn set_firmware(&mut self, firmware: Firmware) {
        self.firmware = Some(firmware);
    }

    /// Build the pin array. Only the first capability response of a connection
    /// builds pins; returns false when a replay was ignored.
    pub fn apply_capabilities(&mut self, mut capabilities: Vec<PinCapability>) -> bool {
        if self.phase != HandshakePhase::AwaitingHandshake {
            tracing::warn!(
                "Ignoring capability response in phase {:?}; pins are already known",
                self.phase
            );
            return false;
        }
        if capabilities.len() > MAX_PINS {
            tracing::warn!(
                "Capability response lists {} pins; ignoring all beyond {}",
                capabilities.len(),
                MAX_PINS
            );
            capabilities.truncate(MAX_PINS);
        }
        for capability in &capabilities {
            for &(mode, bits) in &capability.modes {
                self.resolutions.record(mode, bits);
            }
        }
        self.pins = capabilities
            .iter()
            .enumerate()
            .filter_map(|(index, capability)| Some(Pin::new(u8::try_from(index).ok()?, capability)))
            .collect();
        self.ports = [0; PORT_COUNT];
        self.analog_pins.clear();
        self.phase = HandshakePhase::CapabilitiesKnown;
        true
    }

    /// Assign analog channels from an analog mapping response (`None` marks a
    /// pin that is not analog capable) and rebuild the analog pin list.
    pub fn apply_analog_mapping(&mut self, channels: &[Option<u8>]) {
        if channels.len() > self.pins.len() {
            tracing::debug!(
                "Analog mapping lists {} pins, only {} are known",
                channels.len(),
                self.pins.len()
            );
        }
        let mut analog_pins: Vec<(u8, u8)> = Vec::new();
        for (pin, channel) in self.pins.iter_mut().zip(channels) {
            pin.analog_channel = *channel;
            if let Some(channel) = channel {
                analog_pins.push((*channel, pin.index));
            }
        }
        analog_pins.sort_unstable();
        self.analog_pins = analog_pins.into_iter().map(|(_, pin)| pin).collect();
    }

    pub fn apply_pin_state(&mut self, pin: u8, mode: PinMode, state: u32) -> bool {
        match self.pins.get_mut(pin as usize) {
            Some(entry) => {
                entry.mode = Some(mode);
                entry.state = Some(state);
                true
            }
            None => false,
        }
    }

    /// Store an analog report; returns the physical pin it was mapped to.
    pub fn apply_analog_value(&mut self, channel: u8, value: u16) -> Option<u8> {
        let pin = self.analog_pin(channel)?;
        if let Some(entry) = self.pins.get_mut(pin as usize) {
            entry.value = Some(value as u32);
        }
        Some(pin)
    }

    /// Apply a digital port report to every input pin of the port. Returns
    /// (pin, value, edge) for each pin that was updated.
    pub fn apply_digital_port(&mut self, port: usize, value: u16) -> Vec<(u8, u8, PinEdge)> {
        let mut updated = Vec::new();
        if port >= PORT_COUNT {
            return updated;
        }
        for offset in 0..8 {
            let index = port * 8 + offset;
            let Some(pin) = self.pins.get_mut(index) else { break };
            if !pin.mode.is_some_and(PinMode::is_digital_input) {
                continue;
            }
            let bit_value = ((value >> offset) & 0x01) as u8;
            pin.edge = match (pin.value, bit_value) {
                (Some(0), 1) => PinEdge::Released,
                (Some(1), 0) => PinEdge::Pressed,
                _ => PinEdge::Idle,
            };
            pin.value = Some(bit_value as u32);
            if bit_value == 1 {
                self.ports[port] |= pin.bit();
            } else {
                self.ports[port] &= !pin.bit();
            }
            updated.push((pin.index, bit_value, pin.edge));
        }
        updated
    }

    pub fn store_i2c_reply(&mut self, address: u16, register: u16, data: Vec<u16>) {
        self.i2c_replies.insert((address, register), data);
    }

    // --- caller-side mutators ---

    pub fn check_mode(&self, index: u8, mode: PinMode) -> Result<(), FirmataError> {
        let pin = self.pin(index)?;
        if pin.supports(mode) {
            Ok(())
        } else {
            Err(FirmataError::UnsupportedMode { pin: index, mode })
        }
    }

    pub fn snapshot(&self, index: u8) -> Result<PinSnapshot, FirmataError> {
        let pin = self.pin(index)?.clone();
        let port_mask = self.port(pin.port());
        Ok(PinSnapshot { pin, port_mask })
    }

    /// Put one pin back as it was. Only that pin's port bit is restored so
    /// changes other callers committed on the same port survive.
    pub fn restore(&mut self, snapshot: PinSnapshot) {
        let (port, bit) = (snapshot.pin.port(), snapshot.pin.bit());
        let Some(entry) = self.pins.get_mut(snapshot.pin.index as usize) else { return };
        *entry = snapshot.pin;
        if let Some(mask) = self.ports.get_mut(port) {
            *mask = (*mask & !bit) | (snapshot.port_mask & bit);
        }
    }

    /// Commit a mode change. Leaving the digital modes clears the pin's port bit.
    pub fn set_mode(&mut self, index: u8, mode: PinMode) -> Result<(), FirmataError> {
        self.check_mode(index, mode)?;
        let count = self.pins.len();
        let pin = self
            .pins
            .get_mut(index as usize)
            .ok_or(FirmataError::PinOutOfRange { pin: index, count })?;
        pin.mode = Some(mode);
        if !mode.is_digital() {
            let (port, bit) = (pin.port(), pin.bit());
            self.ports[port] &= !bit;
        }
        Ok(())
    }

    /// Set a digital value and its port bit; returns the port index.
    pub fn set_digital_value(&mut self, index: u8, high: bool) -> Result<usize, FirmataError> {
        let count = self.pins.len();
        let pin = self
            .pins
            .get_mut(index as usize)
            .ok_or(FirmataError::PinOutOfRange { pin: index, count })?;
        pin.value = Some(high as u32);
        let (port, bit) = (pin.port(), pin.bit());
        if high {
            self.ports[port] |= bit;
        } else {
            self.ports[port] &= !bit;
        }
        Ok(port)
    }

    pub fn set_value(&mut self, index: u8, value: u32) -> Result<(), FirmataError> {
        let count = self.pins.len();
        let pin = self
            .pins
            .get_mut(index as usize)
            .ok_or(FirmataError::PinOutOfRange { pin: index, count })?;
        pin.value = Some(value);
        Ok(())
    }

    /// Digital reporting is per port; flag every pin of the port.
    pub fn set_port_report(&mut self, port: usize, enable: bool) {
        for pin in self.pins.iter_mut().filter(|pin| pin.port() == port) {
            pin.report = enable;
        }
    }

    pub fn set_pin_report(&mut self, index: u8, enable: bool) {
        if let Some(pin) = self.pins.get_mut(index as usize) {
            pin.report = enable;
        }
    }

    pub fn set_i2c_configured(&mut self, configured: bool) {
        self.i2c_configured = configured;
    }
}
