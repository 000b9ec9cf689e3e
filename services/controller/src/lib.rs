// controller: the hardware side of the control plane.
//
// Owns the live device connection: port discovery, connect/reconnect,
// state validation and corruption recovery, and the request handlers that
// drive channels, voltage, frequency and droplet detection over the bus.

pub mod config;
pub mod detection;
pub mod driver;
pub mod emulated;
pub mod guard;
pub mod scan;
pub mod settings;
pub mod supervisor;

pub use config::ControllerConfig;
pub use guard::{ProxyAccessError, ProxyGuard};
pub use supervisor::DropbotController;
