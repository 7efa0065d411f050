//! Motion orchestration: the machine state machine and everything that
//! drives it.

pub mod orchestrator;
pub mod poller;
pub mod state;

pub use orchestrator::{MotionOrchestrator, MotionSettings};
pub use poller::StatusPoller;
pub use state::{MachineState, MachineStatus, StateSnapshot};
