//! The hardware driver boundary.
//!
//! The control core never speaks the serial wire protocol itself; it drives
//! a `DropbotDriver` object and reacts to the events it emits. A transport
//! crate (or the in-process emulator) supplies the implementation through a
//! `DriverFactory`.

use tokio::sync::mpsc;

/// Active-low pin that reads back whether a chip is seated.
pub const OUTPUT_ENABLE_PIN: u8 = 22;

// Event mask bits for `StateUpdate::event_mask`.
pub const EVENT_CHANNELS_UPDATED: u32 = 1 << 0;
pub const EVENT_SHORTS_DETECTED: u32 = 1 << 1;
pub const EVENT_ENABLE: u32 = 1 << 2;
pub const EVENT_DROPS_DETECTED: u32 = 1 << 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure opening a connection on a discovered port.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// No device answered on the port (unplugged mid-probe, wrong device).
    #[error("no device available: {0}")]
    NoDevice(String),
    /// The device answered but reports a power-supply fault.
    #[error("device has no power")]
    NoPower,
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Failure of an operation on a live driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device fault: {0}")]
    Fault(String),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why the device halted itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    OutputCurrentExceeded,
    ChipLoadSaturated,
    Unknown,
}

impl HaltReason {
    /// Operator-facing phrasing used in the halted signal payload.
    pub fn describe(self) -> &'static str {
        match self {
            HaltReason::OutputCurrentExceeded => "because output current was exceeded",
            HaltReason::ChipLoadSaturated => "because chip load feedback exceeded allowable range",
            HaltReason::Unknown => "",
        }
    }
}

/// Asynchronous notifications from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Halted(HaltReason),
    /// HV output enabled -- a chip is seated.
    OutputEnabled,
    /// HV output disabled -- chip removed.
    OutputDisabled,
    CapacitanceUpdated { picofarads: f64, volts: f64 },
    ShortsDetected(Vec<u32>),
}

// ---------------------------------------------------------------------------
// State updates
// ---------------------------------------------------------------------------

/// Partial device-state write; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateUpdate {
    pub capacitance_update_interval_ms: Option<u32>,
    pub hv_output_selected: Option<bool>,
    pub hv_output_enabled: Option<bool>,
    pub voltage: Option<f64>,
    pub frequency: Option<f64>,
    pub event_mask: Option<u32>,
}

// ---------------------------------------------------------------------------
// Driver traits
// ---------------------------------------------------------------------------

/// The live hardware connection.
///
/// All calls are serialized by the owner's transaction lock; implementations
/// need not lock internally.
pub trait DropbotDriver: Send {
    fn port_name(&self) -> &str;

    fn number_of_channels(&self) -> Result<u32, DriverError>;
    fn state_of_channels(&self) -> Result<Vec<bool>, DriverError>;
    fn set_state_of_channels(&mut self, state: &[bool]) -> Result<(), DriverError>;
    fn turn_off_all_channels(&mut self) -> Result<(), DriverError>;

    fn initialize_switching_boards(&mut self) -> Result<(), DriverError>;
    fn update_state(&mut self, update: &StateUpdate) -> Result<(), DriverError>;

    fn voltage(&self) -> Result<f64, DriverError>;
    fn frequency(&self) -> Result<f64, DriverError>;

    /// Scan for droplets; `channels = None` scans the whole chip. Returns
    /// the channels where droplets sit.
    fn detect_droplets(&mut self, channels: Option<&[u32]>) -> Result<Vec<u32>, DriverError>;
    fn detect_shorts(&mut self) -> Result<Vec<u32>, DriverError>;

    fn digital_read(&mut self, pin: u8) -> Result<bool, DriverError>;

    /// Hand out the device event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DriverEvent>>;

    /// Tear down the connection. Idempotent.
    fn terminate(&mut self);
}

/// Opens driver connections on named ports.
pub trait DriverFactory: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn DropbotDriver>, ConnectError>;
}
