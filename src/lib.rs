//! Host-side Firmata protocol engine
pub mod board;
pub mod communication;
pub mod error;
pub mod firmata;
pub mod protocol;
pub mod simulator;

pub use board::{Board, Firmware, HandshakePhase, Pin, PinEdge, Version};
pub use communication::{BoardEvent, EventKey, SerialTransport};
pub use error::FirmataError;
pub use firmata::Firmata;
pub use firmata_shared::{load_config, FirmataConfig, PinMode, Transport, TransportError, TransportEvent};
pub use simulator::SimulatedBoard;
