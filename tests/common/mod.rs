//! Shared helpers for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use firmata_rs::{Firmata, FirmataConfig, SimulatedBoard, Transport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every byte in arrival order, yielding between bytes so that
/// overlapping writes would interleave if nothing serialized them.
#[derive(Default)]
pub struct MockTransport {
    stream: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail: AtomicBool,
    byte_delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(byte_delay: Duration) -> Arc<Self> {
        Arc::new(Self { byte_delay: Some(byte_delay), ..Default::default() })
    }

    pub fn stream(&self) -> Vec<u8> {
        self.stream.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Other("injected failure".to_string()));
        }
        for &byte in bytes {
            self.stream.lock().unwrap().push(byte);
            match self.byte_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> FirmataConfig {
    let mut config = FirmataConfig::default();
    config.handshake.grace_period_ms = 0;
    config.handshake.report_version_timeout_ms = 100;
    config.handshake.retries = 1;
    config.requests.timeout_ms = 200;
    config.serializer.acquire_timeout_ms = 200;
    config
}

/// Engine driving a simulated Uno, with the handshake completed.
pub async fn ready_simulated() -> (Firmata, Arc<SimulatedBoard>) {
    ready_simulated_with(fast_config()).await
}

pub async fn ready_simulated_with(config: FirmataConfig) -> (Firmata, Arc<SimulatedBoard>) {
    let (board, signals) = SimulatedBoard::open();
    let (firmata, _runner) = Firmata::spawn(board.clone(), signals, config);
    firmata
        .wait_ready(Duration::from_secs(2))
        .await
        .expect("simulated board should complete the handshake");
    board.clear_written();
    (firmata, board)
}
