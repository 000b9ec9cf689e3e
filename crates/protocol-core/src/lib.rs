// protocol-core: the protocol model and its interpreter.
//
// Pure domain logic, no I/O: per-step device state, the nested step/group
// tree with undo and flat import/export, the path-execution planner that
// expands a step into timed phases, and the calibration math used for force
// and volume-threshold estimates.

pub mod calibration;
pub mod device_state;
pub mod flat;
pub mod params;
pub mod plan;
pub mod protocol;
pub mod tree;

pub use device_state::DeviceState;
pub use plan::{ExecutionPlan, Phase, RepetitionInfo};
pub use protocol::{ProtocolElement, ProtocolGroup, ProtocolState, ProtocolStep};
pub use tree::RunEntry;
