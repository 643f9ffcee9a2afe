//! End-to-end engine behaviour against the simulated board

mod common;

use common::{fast_config, ready_simulated, ready_simulated_with, MockTransport};
use firmata_rs::communication::serializer::SerializerError;
use firmata_rs::protocol::RegistryError;
use firmata_rs::simulator::SimPin;
use firmata_rs::{BoardEvent, Firmata, FirmataError, HandshakePhase, PinEdge, PinMode, SimulatedBoard};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn next_matching<F>(events: &mut tokio::sync::broadcast::Receiver<BoardEvent>, pred: F) -> BoardEvent
where
    F: Fn(&BoardEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive")
}

#[tokio::test]
async fn test_handshake_populates_board() {
    let (firmata, board) = ready_simulated().await;
    let model = firmata.board().await;

    assert_eq!(model.phase(), HandshakePhase::Ready);
    assert_eq!(model.pins().len(), 20);
    assert_eq!(model.analog_pins(), &[14, 15, 16, 17, 18, 19]);
    assert_eq!(model.firmware().unwrap().name, "SimulatedFirmata.ino");
    assert_eq!(model.protocol_version().unwrap().major, 2);
    assert_eq!(model.resolutions().pwm(), Some(8));
    assert_eq!(model.resolutions().adc(), Some(10));
    assert!(board.written().is_empty());
}

#[tokio::test]
async fn test_sampling_interval_sent_during_handshake() {
    let mut config = fast_config();
    config.handshake.sampling_interval_ms = Some(19);
    let (board, signals) = SimulatedBoard::open();
    let (firmata, _runner) = Firmata::spawn(board.clone(), signals, config);
    assert_ok!(firmata.wait_ready(Duration::from_secs(2)).await);
    assert_eq!(board.sampling_interval(), Some(19));
}

#[tokio::test]
async fn test_handshake_times_out_after_retry() {
    let (board, signals) = SimulatedBoard::open();
    board.set_responsive(false);
    let (firmata, _runner) = Firmata::spawn(board.clone(), signals, fast_config());
    let mut events = firmata.subscribe();

    next_matching(&mut events, |e| *e == BoardEvent::Timeout).await;
    let version_requests = board.written().iter().filter(|w| w.first() == Some(&0xF9)).count();
    assert_eq!(version_requests, 2);
    assert!(!firmata.is_ready().await);

    // the connection stays open: a late reply is still parsed
    board.inject(&[0xF9, 0x02, 0x05]);
    next_matching(&mut events, |e| matches!(e, BoardEvent::Version(_))).await;
}

#[tokio::test]
async fn test_commands_rejected_before_ready() {
    let firmata = Firmata::new(MockTransport::new(), fast_config());
    assert!(matches!(firmata.digital_write(13, true).await, Err(FirmataError::NotReady)));
    assert!(matches!(firmata.set_pin_mode(2, PinMode::Input).await, Err(FirmataError::NotReady)));
}

#[tokio::test]
async fn test_digital_write_sends_mode_once() {
    let (firmata, board) = ready_simulated().await;

    assert_ok!(firmata.digital_write(13, true).await);
    assert_ok!(firmata.digital_write(13, false).await);
    assert_ok!(firmata.digital_write(13, true).await);

    let written = board.written();
    assert_eq!(written[0], vec![0xF4, 0x0D, 0x01, 0x91, 0x20, 0x00]);
    assert_eq!(written[1], vec![0x91, 0x00, 0x00]);
    assert_eq!(written[2], vec![0x91, 0x20, 0x00]);
    assert_eq!(board.pin_value(13), Some(1));
    assert_eq!(firmata.board().await.port(1), 0x20);
}

#[tokio::test]
async fn test_unsupported_mode_and_range() {
    let (firmata, board) = ready_simulated().await;
    assert!(matches!(
        firmata.analog_write(4, 10).await,
        Err(FirmataError::UnsupportedMode { pin: 4, mode: PinMode::Pwm })
    ));
    assert!(matches!(
        firmata.digital_write(40, true).await,
        Err(FirmataError::PinOutOfRange { pin: 40, count: 20 })
    ));
    assert!(matches!(
        firmata.analog_write(3, 256).await,
        Err(FirmataError::ValueOutOfRange { max: 255, .. })
    ));
    assert!(board.written().is_empty());

    assert_ok!(firmata.analog_write(3, 128).await);
    assert_eq!(board.pin_mode(3), Some(PinMode::Pwm));
    assert_eq!(board.pin_value(3), Some(128));
}

#[tokio::test]
async fn test_digital_read_caches_after_first_report() {
    let (firmata, board) = ready_simulated().await;
    board.set_digital_input(2, true);

    assert_eq!(assert_ok!(firmata.digital_read(2).await), 1);
    assert_eq!(board.written(), vec![vec![0xF4, 0x02, 0x00, 0xD0, 0x01]]);

    board.clear_written();
    assert_eq!(assert_ok!(firmata.digital_read(2).await), 1);
    assert!(board.written().is_empty());

    let mut events = firmata.subscribe();
    board.set_digital_input(2, false);
    let event = next_matching(&mut events, |e| matches!(e, BoardEvent::DigitalRead { pin: 2, .. })).await;
    assert_eq!(event, BoardEvent::DigitalRead { pin: 2, value: 0, edge: PinEdge::Pressed });
    assert_eq!(assert_ok!(firmata.digital_read(2).await), 0);
}

#[tokio::test]
async fn test_analog_read_by_channel() {
    let (firmata, board) = ready_simulated().await;
    board.set_analog_input(0, 512);

    assert_eq!(assert_ok!(firmata.analog_read(0).await), 512);
    assert_eq!(board.written(), vec![vec![0xF4, 0x0E, 0x02, 0xC0, 0x01]]);
    assert_eq!(firmata.board().await.pin(14).unwrap().value, Some(512));

    assert!(matches!(firmata.analog_read(9).await, Err(FirmataError::NoAnalogChannel(9))));
    assert!(matches!(firmata.analog_read(16).await, Err(FirmataError::ValueOutOfRange { .. })));
}

#[tokio::test]
async fn test_pin_state_query() {
    let (firmata, _board) = ready_simulated().await;
    assert_ok!(firmata.analog_write(5, 200).await);
    let (mode, state) = assert_ok!(firmata.query_pin_state(5).await);
    assert_eq!(mode, PinMode::Pwm);
    assert_eq!(state, 200);
    assert_eq!(firmata.board().await.pin(5).unwrap().state, Some(200));
}

#[tokio::test]
async fn test_read_timeout_is_distinguishable() {
    let (firmata, board) = ready_simulated().await;
    board.set_responsive(false);
    let started = tokio::time::Instant::now();
    let err = assert_err!(firmata.query_pin_state(2).await);
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_rolls_back_only_its_own_pin() {
    let mut config = fast_config();
    config.serializer.acquire_timeout_ms = 100;
    let (firmata, board) = ready_simulated_with(config).await;

    // a slow write on port 1 holds the lane past the first caller's acquire timeout
    board.set_write_delay(Some(Duration::from_millis(150)));
    let slow = tokio::spawn({
        let firmata = firmata.clone();
        async move { firmata.digital_write(13, true).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    board.set_write_delay(None);

    let first = tokio::spawn({
        let firmata = firmata.clone();
        async move { firmata.digital_write(2, true).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let firmata = firmata.clone();
        async move { firmata.digital_write(3, true).await }
    });

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, FirmataError::Write(SerializerError::AcquireTimeout(..))));
    assert_ok!(second.await.unwrap());
    assert_ok!(slow.await.unwrap());

    let model = firmata.board().await;
    assert_eq!(model.pin(2).unwrap().mode, None);
    assert_eq!(model.pin(2).unwrap().value, None);
    assert_eq!(model.pin(3).unwrap().value, Some(1));
    assert_eq!(model.port(0), 0b0000_1000);
    assert!(model.is_ready());

    // pin 2 never reaches the wire
    let written = board.written();
    assert_eq!(written.len(), 2);
    assert_eq!(written[1], vec![0xF4, 0x03, 0x01, 0x90, 0x08, 0x00]);
    assert_eq!(board.pin_value(2), Some(0));
}

#[tokio::test]
async fn test_transport_write_failure_raises_error_and_resets() {
    let (firmata, board) = ready_simulated().await;
    let mut events = firmata.subscribe();
    board.set_fail_writes(true);

    let err = assert_err!(firmata.digital_write(13, true).await);
    assert!(matches!(err, FirmataError::Write(SerializerError::Transport(_))));
    next_matching(&mut events, |e| matches!(e, BoardEvent::Error(_))).await;
    let model = firmata.board().await;
    assert!(!model.is_ready());
    assert!(model.pins().is_empty());
    assert!(matches!(firmata.digital_write(13, true).await, Err(FirmataError::NotReady)));

    board.set_fail_writes(false);
    board.reconnect();
    assert_ok!(firmata.wait_ready(Duration::from_secs(2)).await);
    board.clear_written();
    assert_ok!(firmata.digital_write(13, true).await);
    assert_eq!(board.written()[0][..3], [0xF4, 0x0D, 0x01]);
}

#[tokio::test]
async fn test_pins_beyond_port_range_are_dropped() {
    let layout = (0..130)
        .map(|_| SimPin { modes: vec![(PinMode::Input, 1), (PinMode::Output, 1)], analog_channel: None })
        .collect();
    let (board, signals) = SimulatedBoard::with_layout(layout);
    let (firmata, _runner) = Firmata::spawn(board.clone(), signals, fast_config());
    assert_ok!(firmata.wait_ready(Duration::from_secs(2)).await);
    assert_eq!(firmata.board().await.pins().len(), 128);

    assert!(matches!(
        firmata.digital_write(129, true).await,
        Err(FirmataError::PinOutOfRange { pin: 129, count: 128 })
    ));
    assert!(matches!(
        firmata.set_pin_mode(128, PinMode::Input).await,
        Err(FirmataError::PinOutOfRange { pin: 128, count: 128 })
    ));
    assert_ok!(firmata.digital_write(127, true).await);
    assert_eq!(firmata.board().await.port(15), 0b1000_0000);
    assert_eq!(board.pin_value(127), Some(1));
}

#[tokio::test]
async fn test_pending_read_skips_empty_write() {
    let (firmata, board) = ready_simulated().await;
    board.set_responsive(false);
    let err = assert_err!(firmata.digital_read(2).await);
    assert!(err.is_timeout());
    let pin = firmata.board().await.pin(2).unwrap().clone();
    assert_eq!((pin.mode, pin.report, pin.value), (Some(PinMode::Input), true, None));

    board.set_responsive(true);
    board.clear_written();
    let writes = firmata.write_stats().await.writes;
    let read = tokio::spawn({
        let firmata = firmata.clone();
        async move { firmata.digital_read(2).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(board.written().is_empty());
    board.set_digital_input(2, true);
    assert_eq!(assert_ok!(read.await.unwrap()), 1);
    assert_eq!(firmata.write_stats().await.writes, writes);
}

#[tokio::test]
async fn test_i2c_round_trip() {
    let (firmata, board) = ready_simulated().await;
    assert!(matches!(
        firmata.i2c_read_once(0x48, Some(0x10), 2).await,
        Err(FirmataError::I2cNotConfigured)
    ));

    assert_ok!(firmata.i2c_config(0).await);
    assert!(board.i2c_enabled());
    board.set_i2c_register(0x48, 0x10, vec![0xAB, 0xCD]);
    assert_eq!(assert_ok!(firmata.i2c_read_once(0x48, Some(0x10), 2).await), vec![0xAB, 0xCD]);
    assert_eq!(firmata.board().await.i2c_reply(0x48, 0x10), Some(&[0xAB, 0xCD][..]));

    assert_ok!(firmata.i2c_write(0x48, Some(0x20), &[0x01, 0x02]).await);
    assert_eq!(assert_ok!(firmata.i2c_read_once(0x48, Some(0x20), 2).await), vec![0x01, 0x02]);

    let mut events = firmata.subscribe();
    assert_ok!(firmata.i2c_read_continuous(0x48, Some(0x10), 1).await);
    next_matching(&mut events, |e| matches!(e, BoardEvent::I2cReply { register: 0x10, .. })).await;
    board.tick_i2c();
    next_matching(&mut events, |e| matches!(e, BoardEvent::I2cReply { register: 0x10, .. })).await;
    assert_ok!(firmata.i2c_stop_reading(0x48).await);
}

#[tokio::test]
async fn test_sysex_handlers_and_requests() {
    let (firmata, board) = ready_simulated().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    assert_ok!(firmata.register_sysex_handler(0x01, move |payload| sink.lock().unwrap().push(payload.to_vec())).await);

    let duplicate = firmata.register_sysex_handler(0x01, |_| {}).await;
    assert!(matches!(duplicate, Err(FirmataError::Registry(RegistryError::DuplicateHandler(0x01)))));
    let reserved = firmata.register_sysex_handler(0x79, |_| {}).await;
    assert!(matches!(reserved, Err(FirmataError::Registry(RegistryError::ReservedCommand(0x79)))));

    let reply = assert_ok!(firmata.sysex_request(0x01, &[0x0A, 0x0B], Duration::from_millis(500)).await);
    assert_eq!(reply, vec![0x0A, 0x0B]);
    assert_eq!(*seen.lock().unwrap(), vec![vec![0x0A, 0x0B]]);

    assert!(matches!(firmata.sysex_command(0x01, &[0x80]).await, Err(FirmataError::Codec(_))));
    assert_ok!(firmata.clear_sysex_handler(0x01).await);
    assert!(matches!(
        firmata.sysex_request(0x01, &[], Duration::from_millis(50)).await,
        Err(FirmataError::Registry(RegistryError::NotRegistered(0x01)))
    ));

    assert_ok!(firmata.send_string("hello").await);
    assert_eq!(board.strings(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_system_reset_reruns_handshake() {
    let (firmata, board) = ready_simulated().await;
    assert_ok!(firmata.digital_write(13, true).await);

    assert_ok!(firmata.system_reset().await);
    assert!(board.written().iter().any(|w| w == &vec![0xFF]));
    assert_ok!(firmata.wait_ready(Duration::from_secs(2)).await);
    let model = firmata.board().await;
    assert_eq!(model.pins().len(), 20);
    assert_eq!(model.pin(13).unwrap().mode, None);
}

#[tokio::test]
async fn test_shutdown_resets_only_when_dirty() {
    let (firmata, board) = ready_simulated().await;
    assert!(!firmata.is_clean());
    assert_ok!(firmata.shutdown().await);
    assert_eq!(board.written(), vec![vec![0xFF]]);
    assert!(firmata.is_clean());

    assert_ok!(firmata.shutdown().await);
    assert_eq!(board.written().len(), 1);
}

#[tokio::test]
async fn test_disconnect_resets_connection_state() {
    let (firmata, board) = ready_simulated().await;
    let mut events = firmata.subscribe();
    board.disconnect();
    next_matching(&mut events, |e| *e == BoardEvent::Disconnect).await;

    let model = firmata.board().await;
    assert!(!model.is_ready());
    assert!(model.pins().is_empty());
    assert!(matches!(firmata.digital_read(2).await, Err(FirmataError::NotReady)));
}

#[tokio::test]
async fn test_close_resets_connection_state() {
    let (firmata, board) = ready_simulated().await;
    let mut events = firmata.subscribe();
    board.close();
    next_matching(&mut events, |e| *e == BoardEvent::Close).await;

    let model = firmata.board().await;
    assert!(!model.is_ready());
    assert!(model.pins().is_empty());
    assert!(matches!(firmata.digital_write(13, true).await, Err(FirmataError::NotReady)));
}

#[tokio::test]
async fn test_error_signal_resets_connection_state() {
    let (firmata, board) = ready_simulated().await;
    let mut events = firmata.subscribe();
    board.raise_error("framing error");
    let event = next_matching(&mut events, |e| matches!(e, BoardEvent::Error(_))).await;
    assert_eq!(event, BoardEvent::Error("framing error".to_string()));

    assert!(!firmata.is_ready().await);
    board.reconnect();
    assert_ok!(firmata.wait_ready(Duration::from_secs(2)).await);
    assert_eq!(firmata.board().await.pins().len(), 20);
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_read() {
    let (firmata, board) = ready_simulated().await;
    board.set_responsive(false);
    let read = tokio::spawn({
        let firmata = firmata.clone();
        async move { firmata.query_pin_state(2).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    board.disconnect();
    assert!(matches!(read.await.unwrap(), Err(FirmataError::Disconnected)));
}

#[tokio::test]
async fn test_close_cancels_in_flight_digital_read() {
    let (firmata, board) = ready_simulated().await;
    board.set_responsive(false);
    let read = tokio::spawn({
        let firmata = firmata.clone();
        async move { firmata.digital_read(4).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    board.close();
    assert!(matches!(read.await.unwrap(), Err(FirmataError::Disconnected)));
}
