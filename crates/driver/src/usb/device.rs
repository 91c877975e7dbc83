//! Device handle
//!
//! Owns the transport for one matched adapter together with the identity it
//! was matched on and the configuration selected on it.

use crate::error::DriverError;
use crate::usb::ids::{ChipType, DeviceTable};
use crate::usb::transport::{TransportIdentity, UsbTransport};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Configured,
}

/// A matched USB adapter
pub struct DeviceHandle {
    transport: Arc<dyn UsbTransport>,
    identity: TransportIdentity,
    chip: ChipType,
    configuration: Option<u8>,
    state: HandleState,
    released: bool,
}

impl DeviceHandle {
    /// Check the transport's identity against `table`
    ///
    /// An unsupported identity is terminal for this attach attempt.
    pub fn matched(
        transport: Arc<dyn UsbTransport>,
        table: &DeviceTable,
    ) -> Result<Self, DriverError> {
        let identity = transport.identity().map_err(DriverError::from)?;

        let Some(chip) = table.chip_type(identity.vendor_id, identity.product_id) else {
            warn!(
                "Device not supported: vendor {:#06x}, product {:#06x}",
                identity.vendor_id, identity.product_id
            );
            return Err(DriverError::UnsupportedDevice {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            });
        };

        debug!(
            "Matched {:04x}:{:04x} as {}",
            identity.vendor_id, identity.product_id, chip
        );

        Ok(Self {
            transport,
            identity,
            chip,
            configuration: None,
            state: HandleState::Closed,
            released: false,
        })
    }

    /// Select `configuration` and claim `interface`
    pub fn configure(&mut self, configuration: u8, interface: u8) -> Result<(), DriverError> {
        info!(
            "Configuring device (configuration {}, interface {})",
            configuration, interface
        );
        self.transport
            .set_configuration(configuration, interface)
            .map_err(|e| {
                DriverError::ConfigurationError(format!(
                    "configuration {} rejected: {}",
                    configuration, e
                ))
            })?;

        self.configuration = Some(configuration);
        self.state = HandleState::Configured;
        Ok(())
    }

    pub fn identity(&self) -> TransportIdentity {
        self.identity
    }

    pub fn chip_type(&self) -> ChipType {
        self.chip
    }

    pub fn configuration(&self) -> Option<u8> {
        self.configuration
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn transport(&self) -> &Arc<dyn UsbTransport> {
        &self.transport
    }

    /// Give the device back to the host. Safe to call twice.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.transport.release();
        self.released = true;
        self.state = HandleState::Closed;
        self.configuration = None;
        debug!(
            "Released device {:04x}:{:04x}",
            self.identity.vendor_id, self.identity.product_id
        );
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release();
    }
}
