pub mod correlator;
pub mod event_system;
pub mod serial_linux;
pub mod serializer;

pub use correlator::{Correlator, PendingRequest};
pub use event_system::{BoardEvent, EventBus, EventKey};
pub use serial_linux::SerialTransport;
pub use serializer::{SerializerError, WriteSerializer, WriteStats, DEFAULT_RESOURCE};
