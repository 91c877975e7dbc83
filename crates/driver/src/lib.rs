//! User-space driver core for Realtek RTL8812AU/RTL8821AU/RTL8814AU USB
//! Wi-Fi adapters
//!
//! The core matches a device, configures it, opens its bulk and interrupt
//! pipes, and moves frames between those pipes and a [`NetworkEndpoint`].
//! Radio and MAC programming live above this layer.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod testing;
pub mod usb;
pub mod worker;

pub use error::{DriverError, TransportError};
pub use lifecycle::{
    CompletionDispatcher, DeviceState, DeviceStateMachine, DrainReport, DriverSettings,
    DriverStats, DriverStatus, Operation,
};
pub use net::{NetworkEndpoint, QueuedToken};
pub use usb::{
    BufferPool, BufferState, ChipType, DeviceHandle, DeviceTable, EndpointKind, PipeSet,
    TransferStatus, TransportEvent, UsbTransport,
};

/// Name reported to the host
pub const DRIVER_NAME: &str = "RTL88xxAU";

pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
