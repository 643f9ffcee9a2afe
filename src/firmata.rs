//! Protocol engine facade
//!
//! One inbound context (the run loop) feeds transport bytes through the frame
//! parser into the registry, which mutates the Board and yields events. Events
//! resolve correlated waiters and go out on the broadcast bus. Outbound
//! commands are encoded, committed to the Board optimistically, and written
//! through the serializer; a failed write rolls the Board back. Pin
//! mutators hold their port's lock from commit until the write resolves.

use crate::board::{Board, Firmware, PinSnapshot, Version};
use crate::communication::correlator::Correlator;
use crate::communication::event_system::{BoardEvent, EventBus, EventKey};
use crate::communication::serializer::{SerializerError, WriteSerializer, WriteStats};
use crate::error::FirmataError;
use crate::protocol::encoder::{self, I2C_REGISTER_NOT_SPECIFIED};
use crate::protocol::messages::{Dispatcher, MessageRegistry};
use crate::protocol::parser::FrameParser;
use firmata_shared::protocol::{PinMode, PORT_COUNT};
use firmata_shared::{FirmataConfig, Transport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;

/// Highest analog channel a REPORT_ANALOG / ANALOG_MESSAGE can address.
const MAX_REPORT_CHANNEL: u8 = 0x0F;

struct Inbound {
    parser: FrameParser,
    registry: MessageRegistry,
}

struct Engine {
    config: FirmataConfig,
    board: RwLock<Board>,
    inbound: Mutex<Inbound>,
    serializer: WriteSerializer,
    correlator: Correlator,
    events: EventBus,
    handshake: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Held by a pin mutator from commit until its write resolves.
    port_locks: [Mutex<()>; PORT_COUNT],
}

/// Handle to a Firmata board. Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Firmata {
    inner: Arc<Engine>,
}

impl std::fmt::Debug for Firmata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmata")
            .field("serializer", &self.inner.serializer)
            .field("pending", &self.inner.correlator.pending())
            .finish()
    }
}

impl Firmata {
    pub fn new(transport: Arc<dyn Transport>, config: FirmataConfig) -> Self {
        let serializer = WriteSerializer::new(
            transport,
            config.serializer.acquire_timeout(),
            config.serializer.max_pending,
        );
        let inbound = Inbound {
            parser: FrameParser::new(config.parser.max_sysex_len),
            registry: MessageRegistry::new(),
        };
        Self {
            inner: Arc::new(Engine {
                config,
                board: RwLock::new(Board::new()),
                inbound: Mutex::new(inbound),
                serializer,
                correlator: Correlator::new(),
                events: EventBus::default(),
                handshake: std::sync::Mutex::new(None),
                port_locks: std::array::from_fn(|_| Mutex::new(())),
            }),
        }
    }

    /// Create the engine and spawn its inbound loop over `signals`.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        signals: mpsc::Receiver<TransportEvent>,
        config: FirmataConfig,
    ) -> (Self, JoinHandle<()>) {
        let firmata = Self::new(transport, config);
        let runner = firmata.clone();
        let handle = tokio::spawn(async move { runner.run(signals).await });
        (firmata, handle)
    }

    /// Process transport signals until the transport drops its sender.
    pub async fn run(&self, mut signals: mpsc::Receiver<TransportEvent>) {
        while let Some(signal) = signals.recv().await {
            self.handle_transport_event(signal).await;
        }
        tracing::info!("transport signal channel closed");
        self.abort_handshake();
        self.inner.correlator.cancel_all();
    }

    pub async fn handle_transport_event(&self, signal: TransportEvent) {
        match signal {
            TransportEvent::Open => {
                tracing::info!("transport open, starting handshake");
                self.reset_connection().await;
                self.publish(BoardEvent::Open);
                self.start_handshake();
            }
            TransportEvent::Data(chunk) => self.receive(&chunk).await,
            TransportEvent::Close => {
                tracing::info!("transport closed");
                self.abort_handshake();
                self.reset_connection().await;
                self.inner.correlator.cancel_all();
                self.publish(BoardEvent::Close);
            }
            TransportEvent::Disconnect => {
                tracing::warn!("transport disconnected");
                self.abort_handshake();
                self.reset_connection().await;
                self.inner.correlator.cancel_all();
                self.publish(BoardEvent::Disconnect);
            }
            TransportEvent::Error(message) => {
                tracing::error!("transport error: {}", message);
                self.abort_handshake();
                self.reset_connection().await;
                self.inner.correlator.cancel_all();
                self.publish(BoardEvent::Error(message));
            }
        }
    }

    /// Feed one inbound chunk through the parser and publish what it decodes.
    pub async fn receive(&self, chunk: &[u8]) {
        let events = {
            let mut inbound = self.inner.inbound.lock().await;
            let mut board = self.inner.board.write().await;
            let Inbound { parser, registry } = &mut *inbound;
            let mut dispatcher = Dispatcher::new(&mut board, registry);
            parser.feed(chunk, &mut dispatcher);
            dispatcher.events
        };
        for event in events {
            self.publish(event);
        }
    }

    fn publish(&self, event: BoardEvent) {
        self.inner.correlator.resolve(&event);
        self.inner.events.emit(event);
    }

    /// Forget the parser state and the board model. Pending requests are
    /// left to the caller.
    async fn reset_connection(&self) {
        let mut inbound = self.inner.inbound.lock().await;
        inbound.parser.reset();
        self.inner.board.write().await.reset();
    }

    // --- handshake ---

    fn start_handshake(&self) {
        let runner = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = runner.handshake().await {
                tracing::warn!("handshake did not complete: {}", e);
            }
        });
        let mut slot = self.inner.handshake.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn abort_handshake(&self) {
        let mut slot = self.inner.handshake.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    async fn version_received(&self) -> bool {
        self.inner.inbound.lock().await.parser.version_received()
    }

    async fn handshake(&self) -> Result<(), FirmataError> {
        let settings = &self.inner.config.handshake;
        let correlator = &self.inner.correlator;
        tokio::time::sleep(settings.grace_period()).await;

        let attempts = settings.retries + 1;
        let mut firmware_wait = None;
        let mut received = false;
        for attempt in 1..=attempts {
            let version = correlator.register(EventKey::Version);
            let firmware = correlator.register(EventKey::Firmware);
            if self.version_received().await {
                received = true;
                break;
            }
            let mut bytes = encoder::report_version();
            bytes.extend(encoder::query_firmware());
            self.write(&bytes).await?;
            match version.wait(settings.report_version_timeout()).await {
                Ok(_) => {
                    received = true;
                    firmware_wait = Some(firmware);
                    break;
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!("no version report (attempt {}/{})", attempt, attempts);
                }
                Err(e) => return Err(e),
            }
        }
        if !received {
            self.publish(BoardEvent::Timeout);
            return Err(FirmataError::Timeout {
                key: EventKey::Version,
                waited: settings.report_version_timeout(),
            });
        }

        if self.inner.board.read().await.firmware().is_none() {
            let timeout = self.inner.config.requests.timeout();
            let result = match firmware_wait {
                Some(pending) => pending.wait(timeout).await,
                None => self.request(EventKey::Firmware, encoder::query_firmware()).await,
            };
            match result {
                Ok(_) => {}
                Err(e) if e.is_timeout() => tracing::warn!("board did not report its firmware"),
                Err(e) => return Err(e),
            }
        }

        if let Some(interval) = settings.sampling_interval_ms {
            self.set_sampling_interval(interval).await?;
        }

        self.request(EventKey::Capabilities, encoder::query_capabilities()).await?;
        self.request(EventKey::AnalogMapping, encoder::query_analog_mapping()).await?;

        {
            let mut board = self.inner.board.write().await;
            board.mark_ready();
            let firmware = board.firmware().map(|f| f.name.clone()).unwrap_or_default();
            tracing::info!("board ready: {} pins, firmware '{}'", board.pins().len(), firmware);
        }
        self.publish(BoardEvent::Ready);
        Ok(())
    }

    // --- plumbing ---

    async fn write(&self, bytes: &[u8]) -> Result<(), FirmataError> {
        match self.inner.serializer.write(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.write_failed(e).await),
        }
    }

    /// Write, undoing the optimistic Board changes if the write fails.
    async fn write_or_restore(&self, bytes: &[u8], snapshots: Vec<PinSnapshot>) -> Result<(), FirmataError> {
        if let Err(e) = self.inner.serializer.write(bytes).await {
            {
                let mut board = self.inner.board.write().await;
                for snapshot in snapshots.into_iter().rev() {
                    board.restore(snapshot);
                }
            }
            return Err(self.write_failed(e).await);
        }
        Ok(())
    }

    /// A write the transport itself rejected takes the connection down the
    /// same way a reader-side error does. Lane timeouts and a full queue only
    /// fail the calling operation.
    async fn write_failed(&self, error: SerializerError) -> FirmataError {
        if let SerializerError::Transport(e) = &error {
            let message = e.to_string();
            tracing::error!("transport write failed: {}", message);
            self.reset_connection().await;
            self.inner.correlator.cancel_all();
            self.publish(BoardEvent::Error(message));
            self.abort_handshake();
        }
        error.into()
    }

    async fn lock_port(&self, pin: u8) -> Result<MutexGuard<'_, ()>, FirmataError> {
        match self.inner.port_locks.get(pin as usize >> 3) {
            Some(lock) => Ok(lock.lock().await),
            None => {
                let count = self.inner.board.read().await.pins().len();
                Err(FirmataError::PinOutOfRange { pin, count })
            }
        }
    }

    async fn request(&self, key: EventKey, bytes: Vec<u8>) -> Result<BoardEvent, FirmataError> {
        let timeout = self.inner.config.requests.timeout();
        self.inner.correlator.issue(key, timeout, self.write(&bytes)).await
    }

    fn unexpected(event: BoardEvent) -> FirmataError {
        FirmataError::InvalidPayload(format!("unexpected reply {:?}", event))
    }

    // --- observation ---

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the board model.
    pub async fn board(&self) -> Board {
        self.inner.board.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.board.read().await.is_ready()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), FirmataError> {
        let ready = self.inner.correlator.register(EventKey::Ready);
        if self.is_ready().await {
            return Ok(());
        }
        ready.wait(timeout).await.map(|_| ())
    }

    pub fn is_clean(&self) -> bool {
        self.inner.serializer.is_clean()
    }

    pub async fn write_stats(&self) -> WriteStats {
        self.inner.serializer.stats().await
    }

    // --- queries ---

    pub async fn report_version(&self) -> Result<Version, FirmataError> {
        match self.request(EventKey::Version, encoder::report_version()).await? {
            BoardEvent::Version(version) => Ok(version),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn query_firmware(&self) -> Result<Firmware, FirmataError> {
        match self.request(EventKey::Firmware, encoder::query_firmware()).await? {
            BoardEvent::Firmware(firmware) => Ok(firmware),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Returns the pin count. Once pins are known a replayed response leaves
    /// them untouched.
    pub async fn query_capabilities(&self) -> Result<usize, FirmataError> {
        match self.request(EventKey::Capabilities, encoder::query_capabilities()).await? {
            BoardEvent::Capabilities { pin_count } => Ok(pin_count),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn query_analog_mapping(&self) -> Result<Vec<u8>, FirmataError> {
        match self.request(EventKey::AnalogMapping, encoder::query_analog_mapping()).await? {
            BoardEvent::AnalogMapping { analog_pins } => Ok(analog_pins),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn query_pin_state(&self, pin: u8) -> Result<(PinMode, u32), FirmataError> {
        self.inner.board.read().await.pin(pin)?;
        match self.request(EventKey::PinState(pin), encoder::query_pin_state(pin)).await? {
            BoardEvent::PinState { mode, state, .. } => Ok((mode, state)),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- commands ---

    pub async fn set_sampling_interval(&self, interval_ms: u32) -> Result<(), FirmataError> {
        tracing::debug!("sampling interval {} ms", interval_ms);
        self.write(&encoder::sampling_interval(interval_ms)).await
    }

    pub async fn set_pin_mode(&self, pin: u8, mode: PinMode) -> Result<(), FirmataError> {
        let _port = self.lock_port(pin).await?;
        let snapshot = {
            let mut board = self.inner.board.write().await;
            board.require_ready()?;
            let snapshot = board.snapshot(pin)?;
            board.set_mode(pin, mode)?;
            snapshot
        };
        tracing::debug!("pin {} -> {}", pin, mode);
        self.write_or_restore(&encoder::set_pin_mode(pin, mode), vec![snapshot]).await
    }

    /// Drive a pin high or low, switching it to OUTPUT first if needed. The
    /// mode change and the port write go out as one submission.
    pub async fn digital_write(&self, pin: u8, high: bool) -> Result<(), FirmataError> {
        let _port = self.lock_port(pin).await?;
        let (bytes, snapshot) = {
            let mut board = self.inner.board.write().await;
            board.require_ready()?;
            board.check_mode(pin, PinMode::Output)?;
            let snapshot = board.snapshot(pin)?;
            let mut bytes = Vec::with_capacity(6);
            if board.pin(pin)?.mode != Some(PinMode::Output) {
                bytes.extend(encoder::set_pin_mode(pin, PinMode::Output));
                board.set_mode(pin, PinMode::Output)?;
            }
            let port = board.set_digital_value(pin, high)?;
            bytes.extend(encoder::digital_port(port, board.port(port)));
            (bytes, snapshot)
        };
        self.write_or_restore(&bytes, vec![snapshot]).await
    }

    /// Current level of a digital input. Served from the cache when the pin
    /// is already an input with reporting on; otherwise enables reporting and
    /// waits for the first report.
    pub async fn digital_read(&self, pin: u8) -> Result<u8, FirmataError> {
        let port_guard = self.lock_port(pin).await?;
        let (bytes, snapshots) = {
            let mut board = self.inner.board.write().await;
            board.require_ready()?;
            let entry = board.pin(pin)?;
            let is_input = entry.mode.is_some_and(PinMode::is_digital_input);
            if is_input && entry.report {
                if let Some(value) = entry.value {
                    return Ok(value as u8);
                }
            }
            if !is_input {
                board.check_mode(pin, PinMode::Input)?;
            }
            let port = entry.port();
            let report = entry.report;
            let snapshots = (port * 8..port * 8 + 8)
                .filter_map(|index| board.snapshot(index as u8).ok())
                .collect::<Vec<_>>();
            let mut bytes = Vec::with_capacity(5);
            if !is_input {
                bytes.extend(encoder::set_pin_mode(pin, PinMode::Input));
                board.set_mode(pin, PinMode::Input)?;
            }
            if !report {
                bytes.extend(encoder::report_digital(port, true));
                board.set_port_report(port, true);
            }
            (bytes, snapshots)
        };
        let timeout = self.inner.config.requests.timeout();
        let send = async move {
            // reporting already on: only the first report is missing
            let sent = if bytes.is_empty() { Ok(()) } else { self.write_or_restore(&bytes, snapshots).await };
            drop(port_guard);
            sent
        };
        match self.inner.correlator.issue(EventKey::DigitalRead(pin), timeout, send).await? {
            BoardEvent::DigitalRead { value, .. } => Ok(value),
            other => Err(Self::unexpected(other)),
        }
    }

    /// PWM write, switching the pin to PWM first if needed. Values above the
    /// pin's declared resolution are rejected.
    pub async fn analog_write(&self, pin: u8, value: u32) -> Result<(), FirmataError> {
        let _port = self.lock_port(pin).await?;
        let (bytes, snapshot) = {
            let mut board = self.inner.board.write().await;
            board.require_ready()?;
            board.check_mode(pin, PinMode::Pwm)?;
            let entry = board.pin(pin)?;
            let max = entry
                .resolutions
                .get(&PinMode::Pwm)
                .map(|&bits| if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 })
                .or_else(|| board.resolutions().max_value(PinMode::Pwm));
            if let Some(max) = max {
                if value > max {
                    return Err(FirmataError::ValueOutOfRange { what: "PWM value", value, max });
                }
            }
            let switch = entry.mode != Some(PinMode::Pwm);
            let snapshot = board.snapshot(pin)?;
            let mut bytes = Vec::with_capacity(10);
            if switch {
                bytes.extend(encoder::set_pin_mode(pin, PinMode::Pwm));
                board.set_mode(pin, PinMode::Pwm)?;
            }
            board.set_value(pin, value)?;
            bytes.extend(encoder::analog_write(pin, value));
            (bytes, snapshot)
        };
        self.write_or_restore(&bytes, vec![snapshot]).await
    }

    /// Latest sample on an analog channel, enabling reporting on first use.
    pub async fn analog_read(&self, channel: u8) -> Result<u16, FirmataError> {
        if channel > MAX_REPORT_CHANNEL {
            return Err(FirmataError::ValueOutOfRange {
                what: "analog channel",
                value: channel as u32,
                max: MAX_REPORT_CHANNEL as u32,
            });
        }
        let pin = {
            let board = self.inner.board.read().await;
            board.require_ready()?;
            board.analog_pin(channel).ok_or(FirmataError::NoAnalogChannel(channel))?
        };
        let port_guard = self.lock_port(pin).await?;
        let (bytes, snapshot) = {
            let mut board = self.inner.board.write().await;
            board.require_ready()?;
            let entry = board.pin(pin)?;
            let is_analog = entry.mode == Some(PinMode::Analog);
            if is_analog && entry.report {
                if let Some(value) = entry.value {
                    return Ok(value as u16);
                }
            }
            let report = entry.report;
            board.check_mode(pin, PinMode::Analog)?;
            let snapshot = board.snapshot(pin)?;
            let mut bytes = Vec::with_capacity(5);
            if !is_analog {
                bytes.extend(encoder::set_pin_mode(pin, PinMode::Analog));
                board.set_mode(pin, PinMode::Analog)?;
            }
            if !report {
                bytes.extend(encoder::report_analog(channel, true));
                board.set_pin_report(pin, true);
            }
            (bytes, snapshot)
        };
        let timeout = self.inner.config.requests.timeout();
        let send = async move {
            let sent = if bytes.is_empty() { Ok(()) } else { self.write_or_restore(&bytes, vec![snapshot]).await };
            drop(port_guard);
            sent
        };
        match self.inner.correlator.issue(EventKey::AnalogRead(channel), timeout, send).await? {
            BoardEvent::AnalogRead { value, .. } => Ok(value),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn report_digital_port(&self, port: usize, enable: bool) -> Result<(), FirmataError> {
        if port >= PORT_COUNT {
            return Err(FirmataError::ValueOutOfRange {
                what: "port",
                value: port as u32,
                max: PORT_COUNT as u32 - 1,
            });
        }
        self.write(&encoder::report_digital(port, enable)).await?;
        self.inner.board.write().await.set_port_report(port, enable);
        Ok(())
    }

    pub async fn report_analog_channel(&self, channel: u8, enable: bool) -> Result<(), FirmataError> {
        if channel > MAX_REPORT_CHANNEL {
            return Err(FirmataError::ValueOutOfRange {
                what: "analog channel",
                value: channel as u32,
                max: MAX_REPORT_CHANNEL as u32,
            });
        }
        self.write(&encoder::report_analog(channel, enable)).await?;
        let mut board = self.inner.board.write().await;
        if let Some(pin) = board.analog_pin(channel) {
            board.set_pin_report(pin, enable);
        }
        Ok(())
    }

    // --- I2C ---

    pub async fn i2c_config(&self, delay_us: u16) -> Result<(), FirmataError> {
        self.write(&encoder::i2c_config(delay_us)).await?;
        self.inner.board.write().await.set_i2c_configured(true);
        Ok(())
    }

    async fn require_i2c(&self) -> Result<(), FirmataError> {
        if self.inner.board.read().await.i2c_configured() {
            Ok(())
        } else {
            Err(FirmataError::I2cNotConfigured)
        }
    }

    pub async fn i2c_write(&self, address: u16, register: Option<u16>, data: &[u8]) -> Result<(), FirmataError> {
        self.require_i2c().await?;
        self.write(&encoder::i2c_write(address, register, data)).await
    }

    /// One-shot read. Resolves with the 14-bit words of the matching reply.
    pub async fn i2c_read_once(&self, address: u16, register: Option<u16>, len: u16) -> Result<Vec<u16>, FirmataError> {
        self.require_i2c().await?;
        let key = EventKey::I2cReply {
            address,
            register: register.unwrap_or(I2C_REGISTER_NOT_SPECIFIED),
        };
        match self.request(key, encoder::i2c_read(address, register, len, false)).await? {
            BoardEvent::I2cReply { data, .. } => Ok(data),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Start continuous reads; replies arrive as events and in the reply cache.
    pub async fn i2c_read_continuous(&self, address: u16, register: Option<u16>, len: u16) -> Result<(), FirmataError> {
        self.require_i2c().await?;
        self.write(&encoder::i2c_read(address, register, len, true)).await
    }

    pub async fn i2c_stop_reading(&self, address: u16) -> Result<(), FirmataError> {
        self.require_i2c().await?;
        self.write(&encoder::i2c_stop_reading(address)).await
    }

    // --- strings and user SysEx ---

    pub async fn send_string(&self, text: &str) -> Result<(), FirmataError> {
        self.write(&encoder::string_data(text)).await
    }

    /// Route inbound SysEx `command` to `handler`. Built-in commands and
    /// commands that already have a handler are rejected.
    pub async fn register_sysex_handler<F>(&self, command: u8, handler: F) -> Result<(), FirmataError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let mut inbound = self.inner.inbound.lock().await;
        Ok(inbound.registry.register(command, Box::new(handler))?)
    }

    pub async fn clear_sysex_handler(&self, command: u8) -> Result<(), FirmataError> {
        let mut inbound = self.inner.inbound.lock().await;
        Ok(inbound.registry.unregister(command)?)
    }

    pub async fn sysex_command(&self, command: u8, payload: &[u8]) -> Result<(), FirmataError> {
        self.write(&encoder::sysex(command, payload)?).await
    }

    /// Send a user SysEx and wait for the board to answer with the same
    /// command byte. The command must have a registered handler.
    pub async fn sysex_request(&self, command: u8, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, FirmataError> {
        if !self.inner.inbound.lock().await.registry.is_registered(command) {
            return Err(crate::protocol::RegistryError::NotRegistered(command).into());
        }
        let bytes = encoder::sysex(command, payload)?;
        match self.inner.correlator.issue(EventKey::Sysex(command), timeout, self.write(&bytes)).await? {
            BoardEvent::Sysex { payload, .. } => Ok(payload),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- reset and shutdown ---

    /// Reset the firmware, forget everything known about the board and run
    /// the handshake again.
    pub async fn system_reset(&self) -> Result<(), FirmataError> {
        self.abort_handshake();
        self.write(&encoder::system_reset()).await?;
        self.inner.serializer.mark_clean();
        tracing::info!("system reset sent");
        self.reset_connection().await;
        self.inner.correlator.cancel_all();
        self.start_handshake();
        Ok(())
    }

    /// Stop the handshake and leave the board in its reset state. The reset
    /// is only sent when something was written since the last one.
    pub async fn shutdown(&self) -> Result<(), FirmataError> {
        self.abort_handshake();
        if !self.inner.serializer.is_clean() {
            self.write(&encoder::system_reset()).await?;
            self.inner.serializer.mark_clean();
        }
        self.inner.correlator.cancel_all();
        tracing::info!("shutdown complete");
        Ok(())
    }
}
