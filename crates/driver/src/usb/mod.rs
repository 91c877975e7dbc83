//! USB subsystem
//!
//! Everything between the driver core and the host USB stack:
//!
//! - `ids`: the supported (vendor, product) table and chip families
//! - `transport`: the [`UsbTransport`] seam and the transfer/completion types
//! - `rusb_transport`: a libusb-backed transport with per-endpoint I/O threads
//! - `device`: the [`DeviceHandle`] owning the transport and its identity
//! - `pipes`: the [`PipeSet`] of opened endpoints
//! - `buffer_pool`: recycled transfer buffers

pub mod buffer_pool;
pub mod device;
pub mod ids;
pub mod pipes;
pub mod rusb_transport;
pub mod transport;

pub use buffer_pool::{Buffer, BufferId, BufferPool, BufferState};
pub use device::{DeviceHandle, HandleState};
pub use ids::{ChipType, DeviceTable, REALTEK_VENDOR_ID, is_device_supported};
pub use pipes::{PipeSet, PipeState, SubmitError};
pub use rusb_transport::RusbTransport;
pub use transport::{
    Completion, CompletionSink, CompletionToken, ControlRequest, EndpointInfo, EndpointKind,
    SubmitRejected, TransferRequest, TransferStatus, TransportEvent, TransportIdentity,
    UsbTransport,
};
