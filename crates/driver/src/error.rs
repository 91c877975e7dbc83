//! Driver error taxonomy
//!
//! [`DriverError`] is what the state machine and data path report to the host.
//! [`TransportError`] is what the USB transport reports to the core; it is
//! mapped from `rusb::Error` in exactly one place ([`map_rusb_error`]).

use crate::lifecycle::state::{DeviceState, Operation};
use crate::usb::transport::{EndpointKind, TransferStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("unsupported device {vendor_id:04x}:{product_id:04x}")]
    UnsupportedDevice { vendor_id: u16, product_id: u16 },

    #[error("configuration failed: {0}")]
    ConfigurationError(String),

    #[error("failed to open {endpoint} endpoint: {reason}")]
    PipeOpenError {
        endpoint: EndpointKind,
        reason: TransportError,
    },

    #[error("pipe is closed")]
    PipeClosed,

    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: Operation,
        state: DeviceState,
    },

    #[error("device not ready (state {0})")]
    NotReady(DeviceState),

    #[error("buffer pool exhausted")]
    Exhausted,

    #[error("transmit path busy")]
    Busy,

    #[error("frame of {len} bytes exceeds buffer size {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("transfer failed: {0}")]
    TransferFailed(TransferStatus),

    #[error("device is gone")]
    DeviceGone,
}

impl DriverError {
    /// Errors raised while bringing a device up are surfaced to the host,
    /// which decides whether to retry the attach.
    pub fn is_bring_up_failure(&self) -> bool {
        matches!(
            self,
            DriverError::UnsupportedDevice { .. }
                | DriverError::ConfigurationError(_)
                | DriverError::PipeOpenError { .. }
        )
    }
}

/// Failures reported by a [`UsbTransport`](crate::usb::transport::UsbTransport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Pipe,
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("overflow")]
    Overflow,
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoDevice => DriverError::DeviceGone,
            TransportError::Pipe => DriverError::TransferFailed(TransferStatus::Stall),
            TransportError::Timeout => DriverError::TransferFailed(TransferStatus::Timeout),
            TransportError::Overflow => DriverError::TransferFailed(TransferStatus::Overflow),
            _ => DriverError::TransferFailed(TransferStatus::Error),
        }
    }
}

/// Map rusb errors to transport errors
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        _ => TransportError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), TransportError::NotFound);
        assert!(matches!(
            map_rusb_error(rusb::Error::Other),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn test_transport_error_to_driver_error() {
        assert_eq!(
            DriverError::from(TransportError::NoDevice),
            DriverError::DeviceGone
        );
        assert_eq!(
            DriverError::from(TransportError::Pipe),
            DriverError::TransferFailed(TransferStatus::Stall)
        );
    }

    #[test]
    fn test_bring_up_failures() {
        assert!(
            DriverError::UnsupportedDevice {
                vendor_id: 0x0bda,
                product_id: 0x9999
            }
            .is_bring_up_failure()
        );
        assert!(!DriverError::Exhausted.is_bring_up_failure());
        assert!(!DriverError::NotReady(DeviceState::PipesOpen).is_bring_up_failure());
    }
}
