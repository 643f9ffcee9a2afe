//! Wire protocol: inbound framing, typed decode and outbound encoders.

pub mod encoder;
pub mod messages;
pub mod parser;

pub use encoder::I2C_REGISTER_NOT_SPECIFIED;
pub use messages::{Dispatcher, MessageRegistry, RegistryError, SysexHandler};
pub use parser::{FrameParser, FrameSink};
