pub mod layout;
pub mod runner;
pub mod transport;

pub use runner::{AdbRunner, CommandOutput, CommandRunner};
pub use transport::{list_devices, DeviceTransport, TransportConfig};
