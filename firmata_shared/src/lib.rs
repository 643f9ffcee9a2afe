//! Protocol constants, codec, transport seam and configuration
//! shared by the host engine, the simulator and tests.

pub mod config;
pub mod protocol;
pub mod transport_interface;

pub use config::{load_config, ConfigError, FirmataConfig};
pub use protocol::{CodecError, ModeSet, PinMode};
pub use transport_interface::{Transport, TransportError, TransportEvent};
