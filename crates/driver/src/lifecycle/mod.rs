//! Device lifecycle and data path
//!
//! The [`DeviceStateMachine`] is the single authority over ordering: it owns
//! the device handle, the pipe set and both buffer pools, and it is the only
//! consumer of the completion queue. The [`CompletionDispatcher`] interprets
//! each completion on its behalf.

pub mod dispatcher;
pub(crate) mod inflight;
pub mod machine;
pub mod state;

pub use dispatcher::{CompletionDispatcher, DriverStats};
pub use machine::{DeviceStateMachine, DrainReport, DriverSettings, DriverStatus};
pub use state::{DeviceState, Operation};
