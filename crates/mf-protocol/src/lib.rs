// mf-protocol: wire contract for the microfluidics control plane.
//
// Everything that crosses the message bus is defined here: the timestamped
// message envelope, the topic namespace and its pattern grammar, the device
// viewer message model, and the payload structs for hardware signals.

pub mod message;
pub mod signals;
pub mod topics;
pub mod viewer;

pub use message::TimestampedMessage;
pub use signals::{CapacitanceSignal, DropletResponse, ShortsSignal};
pub use topics::topic_matches;
pub use viewer::{StepInfo, ViewerMessage};
