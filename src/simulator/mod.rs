//! In-process simulated Firmata board.
//!
//! [`SimulatedBoard`] is a [`Transport`]: bytes the host writes are decoded as
//! StandardFirmata would decode them and replies are pushed back through the
//! transport signal channel. Each host write is expected to hold whole
//! messages, which is what the write serializer produces.

use async_trait::async_trait;
use firmata_shared::protocol::{
    encode_14bit, encode_7bit, join_7bit, split_7bit_min, PinMode, ANALOG_MAPPING_QUERY,
    ANALOG_MAPPING_RESPONSE, ANALOG_MESSAGE, CAPABILITY_QUERY, CAPABILITY_RESPONSE,
    DIGITAL_MESSAGE, END_SYSEX, EXTENDED_ANALOG, I2C_CONFIG, I2C_REPLY, I2C_REQUEST, NOT_ANALOG,
    PIN_STATE_QUERY, PIN_STATE_RESPONSE, PIN_TERMINATOR, PORT_COUNT, REPORT_ANALOG,
    REPORT_DIGITAL, REPORT_FIRMWARE, REPORT_VERSION, SAMPLING_INTERVAL, SET_DIGITAL_PIN_VALUE,
    SET_PIN_MODE, START_SYSEX, STRING_DATA, SYSTEM_RESET,
};
use firmata_shared::{Transport, TransportError, TransportEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

pub const SIM_FIRMWARE_NAME: &str = "SimulatedFirmata.ino";
pub const SIM_PROTOCOL_VERSION: (u8, u8) = (2, 5);

/// One pin of the simulated layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPin {
    pub modes: Vec<(PinMode, u8)>,
    pub analog_channel: Option<u8>,
}

/// Arduino Uno style layout: 20 pins, PWM on 3/5/6/9/10/11, analog inputs on
/// 14-19 at 10 bits, I2C on 18/19.
pub fn uno_layout() -> Vec<SimPin> {
    (0u8..20)
        .map(|pin| {
            let mut modes = vec![(PinMode::Input, 1), (PinMode::Output, 1), (PinMode::Pullup, 1)];
            if matches!(pin, 3 | 5 | 6 | 9 | 10 | 11) {
                modes.push((PinMode::Pwm, 8));
            }
            if (2..=13).contains(&pin) {
                modes.push((PinMode::Servo, 14));
            }
            let analog_channel = (pin >= 14).then(|| pin - 14);
            if analog_channel.is_some() {
                modes.push((PinMode::Analog, 10));
            }
            if matches!(pin, 18 | 19) {
                modes.push((PinMode::I2c, 1));
            }
            SimPin { modes, analog_channel }
        })
        .collect()
}

#[derive(Debug, Default)]
struct SimState {
    layout: Vec<SimPin>,
    modes: Vec<PinMode>,
    values: Vec<u32>,
    report_ports: [bool; PORT_COUNT],
    report_channels: [bool; 16],
    sampling_interval: Option<u32>,
    i2c_enabled: bool,
    i2c_memory: HashMap<(u16, u16), Vec<u8>>,
    i2c_continuous: HashMap<u16, (Option<u16>, u16)>,
    strings: Vec<String>,
    written: Vec<Vec<u8>>,
    responsive: bool,
    fail_writes: bool,
    write_delay: Option<Duration>,
}

impl SimState {
    fn new(layout: Vec<SimPin>) -> Self {
        let count = layout.len();
        Self {
            layout,
            modes: vec![PinMode::Output; count],
            values: vec![0; count],
            responsive: true,
            ..Default::default()
        }
    }

    fn system_reset(&mut self) {
        let count = self.layout.len();
        self.modes = vec![PinMode::Output; count];
        self.values = vec![0; count];
        self.report_ports = [false; PORT_COUNT];
        self.report_channels = [false; 16];
        self.i2c_continuous.clear();
    }

    fn supports(&self, pin: usize, mode: PinMode) -> bool {
        self.layout.get(pin).is_some_and(|p| p.modes.iter().any(|(m, _)| *m == mode))
    }

    fn channel_pin(&self, channel: u8) -> Option<usize> {
        self.layout.iter().position(|p| p.analog_channel == Some(channel))
    }

    fn port_message(&self, port: usize) -> Vec<u8> {
        let mut mask = 0u16;
        for offset in 0..8 {
            let pin = port * 8 + offset;
            if pin < self.values.len() && self.modes[pin].is_digital() && self.values[pin] != 0 {
                mask |= 1 << offset;
            }
        }
        let [lsb, msb] = encode_14bit(mask);
        vec![DIGITAL_MESSAGE | port as u8, lsb, msb]
    }

    fn analog_message(&self, channel: u8) -> Option<Vec<u8>> {
        let pin = self.channel_pin(channel)?;
        let [lsb, msb] = encode_14bit(self.values[pin] as u16);
        Some(vec![ANALOG_MESSAGE | channel, lsb, msb])
    }

    fn i2c_reply(&self, address: u16, register: Option<u16>, len: u16) -> Vec<u8> {
        let register_word = register.unwrap_or(0x3FFF);
        let stored = self.i2c_memory.get(&(address, register_word));
        let mut payload = Vec::new();
        payload.extend(encode_14bit(address));
        payload.extend(encode_14bit(register_word));
        for i in 0..len as usize {
            let byte = stored.and_then(|data| data.get(i)).copied().unwrap_or(0);
            payload.extend(encode_7bit(&[byte]));
        }
        sysex(I2C_REPLY, &payload)
    }

    /// Decode one host message and append the board's replies.
    fn handle(&mut self, message: &[u8], replies: &mut Vec<u8>) {
        let first = message[0];
        match first {
            REPORT_VERSION => {
                replies.extend([REPORT_VERSION, SIM_PROTOCOL_VERSION.0, SIM_PROTOCOL_VERSION.1]);
            }
            SYSTEM_RESET => self.system_reset(),
            SET_PIN_MODE => {
                let (pin, mode) = (message[1] as usize, PinMode::from_byte(message[2]));
                if self.supports(pin, mode) {
                    self.modes[pin] = mode;
                } else {
                    tracing::debug!("simulated board: pin {} does not support {}", pin, mode);
                }
            }
            SET_DIGITAL_PIN_VALUE => {
                if let Some(value) = self.values.get_mut(message[1] as usize) {
                    *value = (message[2] != 0) as u32;
                }
            }
            START_SYSEX => self.handle_sysex(message[1], &message[2..message.len() - 1], replies),
            _ => match first & 0xF0 {
                DIGITAL_MESSAGE => {
                    let port = (first & 0x0F) as usize;
                    let mask = join_7bit(&message[1..3]);
                    for offset in 0..8 {
                        let pin = port * 8 + offset;
                        if pin < self.values.len() && self.modes[pin] == PinMode::Output {
                            self.values[pin] = (mask >> offset) & 1;
                        }
                    }
                }
                ANALOG_MESSAGE => {
                    let pin = (first & 0x0F) as usize;
                    if let Some(value) = self.values.get_mut(pin) {
                        *value = join_7bit(&message[1..3]);
                    }
                }
                REPORT_DIGITAL => {
                    let port = (first & 0x0F) as usize;
                    self.report_ports[port] = message[1] != 0;
                    if message[1] != 0 {
                        replies.extend(self.port_message(port));
                    }
                }
                REPORT_ANALOG => {
                    let channel = first & 0x0F;
                    self.report_channels[channel as usize] = message[1] != 0;
                    if message[1] != 0 {
                        if let Some(reply) = self.analog_message(channel) {
                            replies.extend(reply);
                        }
                    }
                }
                _ => tracing::trace!("simulated board ignoring 0x{:02X}", first),
            },
        }
    }

    fn handle_sysex(&mut self, command: u8, payload: &[u8], replies: &mut Vec<u8>) {
        match command {
            REPORT_FIRMWARE => {
                let mut body = vec![SIM_PROTOCOL_VERSION.0, SIM_PROTOCOL_VERSION.1];
                body.extend(encode_7bit(SIM_FIRMWARE_NAME.as_bytes()));
                replies.extend(sysex(REPORT_FIRMWARE, &body));
            }
            CAPABILITY_QUERY => {
                let mut body = Vec::new();
                for pin in &self.layout {
                    for &(mode, bits) in &pin.modes {
                        body.extend([mode.as_byte(), bits]);
                    }
                    body.push(PIN_TERMINATOR);
                }
                replies.extend(sysex(CAPABILITY_RESPONSE, &body));
            }
            ANALOG_MAPPING_QUERY => {
                let body: Vec<u8> = self
                    .layout
                    .iter()
                    .map(|pin| pin.analog_channel.unwrap_or(NOT_ANALOG))
                    .collect();
                replies.extend(sysex(ANALOG_MAPPING_RESPONSE, &body));
            }
            PIN_STATE_QUERY => {
                let Some(&pin) = payload.first() else { return };
                if let (Some(mode), Some(value)) = (self.modes.get(pin as usize), self.values.get(pin as usize)) {
                    let mut body = vec![pin, mode.as_byte()];
                    body.extend(split_7bit_min(*value, 1));
                    replies.extend(sysex(PIN_STATE_RESPONSE, &body));
                }
            }
            EXTENDED_ANALOG => {
                if let [pin, value @ ..] = payload {
                    if let Some(slot) = self.values.get_mut(*pin as usize) {
                        *slot = join_7bit(value);
                    }
                }
            }
            SAMPLING_INTERVAL => self.sampling_interval = Some(join_7bit(payload)),
            I2C_CONFIG => self.i2c_enabled = true,
            I2C_REQUEST => self.handle_i2c(payload, replies),
            STRING_DATA => {
                let bytes: Vec<u8> = payload
                    .chunks_exact(2)
                    .map(|pair| pair[0] | (pair[1] << 7))
                    .take_while(|&b| b != 0)
                    .collect();
                self.strings.push(String::from_utf8_lossy(&bytes).into_owned());
            }
            // unknown commands are acknowledged by echoing them back
            _ => replies.extend(sysex(command, payload)),
        }
    }

    fn handle_i2c(&mut self, payload: &[u8], replies: &mut Vec<u8>) {
        let [address_lsb, mode_byte, rest @ ..] = payload else { return };
        let mut address = *address_lsb as u16;
        if mode_byte & 0x20 != 0 {
            address |= ((mode_byte & 0x07) as u16) << 7;
        }
        let words: Vec<u16> = rest.chunks_exact(2).map(|pair| join_7bit(pair) as u16).collect();
        match (mode_byte >> 3) & 0x03 {
            0 => {
                if let [register, data @ ..] = words.as_slice() {
                    let bytes = data.iter().map(|&w| w as u8).collect();
                    self.i2c_memory.insert((address, *register), bytes);
                }
            }
            mode @ (1 | 2) => {
                let (register, len) = match words.as_slice() {
                    [register, len] => (Some(*register), *len),
                    [len] => (None, *len),
                    _ => return,
                };
                replies.extend(self.i2c_reply(address, register, len));
                if mode == 2 {
                    self.i2c_continuous.insert(address, (register, len));
                }
            }
            _ => {
                self.i2c_continuous.remove(&address);
            }
        }
    }
}

fn sysex(command: u8, payload: &[u8]) -> Vec<u8> {
    firmata_shared::protocol::frame_sysex(command, payload)
}

/// Length of the host message starting at `bytes[0]`.
fn message_len(bytes: &[u8]) -> usize {
    match bytes[0] {
        START_SYSEX => bytes.iter().position(|&b| b == END_SYSEX).map_or(bytes.len(), |end| end + 1),
        REPORT_VERSION | SYSTEM_RESET => 1,
        SET_PIN_MODE | SET_DIGITAL_PIN_VALUE => 3,
        b => match b & 0xF0 {
            DIGITAL_MESSAGE | ANALOG_MESSAGE => 3,
            REPORT_ANALOG | REPORT_DIGITAL => 2,
            _ => 1,
        },
    }
}

pub struct SimulatedBoard {
    state: Mutex<SimState>,
    signals: mpsc::Sender<TransportEvent>,
}

impl SimulatedBoard {
    /// Uno layout. The receiver already holds the `Open` signal.
    pub fn open() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        Self::with_layout(uno_layout())
    }

    pub fn with_layout(layout: Vec<SimPin>) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (signals, rx) = mpsc::channel(1024);
        let board = Arc::new(Self { state: Mutex::new(SimState::new(layout)), signals });
        board.signal(TransportEvent::Open);
        (board, rx)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn signal(&self, event: TransportEvent) {
        if let Err(e) = self.signals.try_send(event) {
            tracing::warn!("simulated board dropped a signal: {}", e);
        }
    }

    fn send(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.signal(TransportEvent::Data(bytes));
        }
    }

    /// Push raw bytes to the host as if the board had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.send(bytes.to_vec());
    }

    /// Drive a digital input. Reported immediately when its port reports.
    pub fn set_digital_input(&self, pin: u8, high: bool) {
        let reply = {
            let mut state = self.state();
            let pin = pin as usize;
            if pin >= state.values.len() {
                return;
            }
            state.values[pin] = high as u32;
            let port = pin / 8;
            (state.report_ports[port] && state.modes[pin].is_digital_input()).then(|| state.port_message(port))
        };
        if let Some(reply) = reply {
            self.send(reply);
        }
    }

    /// Set the sample of an analog channel. Reported immediately when the
    /// channel reports.
    pub fn set_analog_input(&self, channel: u8, value: u16) {
        let reply = {
            let mut state = self.state();
            let Some(pin) = state.channel_pin(channel) else { return };
            state.values[pin] = value as u32;
            if state.report_channels.get(channel as usize).copied().unwrap_or(false) {
                state.analog_message(channel)
            } else {
                None
            }
        };
        if let Some(reply) = reply {
            self.send(reply);
        }
    }

    pub fn set_i2c_register(&self, address: u16, register: u16, data: Vec<u8>) {
        self.state().i2c_memory.insert((address, register), data);
    }

    /// Emit one reply for every continuous I2C read, like a sampling tick.
    pub fn tick_i2c(&self) {
        let replies: Vec<u8> = {
            let state = self.state();
            state
                .i2c_continuous
                .iter()
                .flat_map(|(&address, &(register, len))| state.i2c_reply(address, register, len))
                .collect()
        };
        self.send(replies);
    }

    /// When false the board accepts writes but never answers.
    pub fn set_responsive(&self, responsive: bool) {
        self.state().responsive = responsive;
    }

    /// When true every write fails with [`TransportError::Closed`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Hold every following host write for `delay` before it is accepted.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state().write_delay = delay;
    }

    pub fn disconnect(&self) {
        self.signal(TransportEvent::Disconnect);
    }

    pub fn close(&self) {
        self.signal(TransportEvent::Close);
    }

    pub fn raise_error(&self, message: &str) {
        self.signal(TransportEvent::Error(message.to_string()));
    }

    /// Signal a fresh connection; the engine reruns its handshake.
    pub fn reconnect(&self) {
        self.signal(TransportEvent::Open);
    }

    /// Every successful host write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.state().modes.get(pin as usize).copied()
    }

    pub fn pin_value(&self, pin: u8) -> Option<u32> {
        self.state().values.get(pin as usize).copied()
    }

    pub fn sampling_interval(&self) -> Option<u32> {
        self.state().sampling_interval
    }

    pub fn i2c_enabled(&self) -> bool {
        self.state().i2c_enabled
    }

    pub fn strings(&self) -> Vec<String> {
        self.state().strings.clone()
    }
}

#[async_trait]
impl Transport for SimulatedBoard {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let replies = {
            let mut state = self.state();
            if state.fail_writes {
                return Err(TransportError::Closed);
            }
            state.written.push(bytes.to_vec());
            let mut replies = Vec::new();
            let mut offset = 0;
            while offset < bytes.len() {
                let len = message_len(&bytes[offset..]);
                let message = &bytes[offset..offset + len];
                let complete = match message[0] {
                    START_SYSEX => message.len() >= 3 && message[len - 1] == END_SYSEX,
                    _ => message.len() == len,
                };
                if complete && (message[0] >= 0x80) {
                    state.handle(message, &mut replies);
                }
                offset += len;
            }
            if state.responsive { replies } else { Vec::new() }
        };
        self.send(replies);
        Ok(())
    }

    fn name(&self) -> String {
        "simulator".to_string()
    }
}
