//! Pipe set
//!
//! The three endpoints the data path needs (bulk-in, bulk-out, interrupt),
//! opened all-or-nothing against a configured [`DeviceHandle`].

use crate::error::{DriverError, TransportError};
use crate::usb::buffer_pool::Buffer;
use crate::usb::device::{DeviceHandle, HandleState};
use crate::usb::transport::{
    CompletionSink, CompletionToken, ControlRequest, EndpointInfo, EndpointKind, TransferRequest,
    UsbTransport,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Open,
    /// No new submissions; in-flight transfers may still complete
    Closing,
    Closed,
}

/// A rejected submission; the buffer goes back to the caller
#[derive(Debug)]
pub struct SubmitError {
    pub error: DriverError,
    pub buffer: Buffer,
}

pub struct PipeSet {
    transport: Arc<dyn UsbTransport>,
    bulk_in: EndpointInfo,
    bulk_out: EndpointInfo,
    interrupt: EndpointInfo,
    state: PipeState,
    next_token: u64,
}

impl PipeSet {
    /// Open bulk-in, bulk-out and interrupt, in that order
    ///
    /// If any endpoint fails to open, the ones already opened are closed
    /// again before the error is returned.
    pub fn open_all(device: &DeviceHandle) -> Result<Self, DriverError> {
        if device.state() != HandleState::Configured {
            return Err(DriverError::PipeOpenError {
                endpoint: EndpointKind::BulkIn,
                reason: TransportError::Other("device is not configured".to_string()),
            });
        }

        info!("Opening USB pipes");
        let transport = device.transport().clone();
        let mut opened = Vec::with_capacity(EndpointKind::OPEN_ORDER.len());

        let bulk_in = open_one(&transport, EndpointKind::BulkIn, &mut opened)?;
        let bulk_out = open_one(&transport, EndpointKind::BulkOut, &mut opened)?;
        let interrupt = open_one(&transport, EndpointKind::Interrupt, &mut opened)?;

        Ok(Self {
            transport,
            bulk_in,
            bulk_out,
            interrupt,
            state: PipeState::Open,
            next_token: 1,
        })
    }

    /// Post `buffer` on bulk-in for its full capacity
    pub fn submit_receive(
        &mut self,
        buffer: Buffer,
        sink: &CompletionSink,
    ) -> Result<CompletionToken, SubmitError> {
        let length = buffer.capacity();
        self.submit(self.bulk_in, buffer, length, sink)
    }

    /// Post the first `length` bytes of `buffer` on bulk-out
    pub fn submit_transmit(
        &mut self,
        buffer: Buffer,
        length: usize,
        sink: &CompletionSink,
    ) -> Result<CompletionToken, SubmitError> {
        self.submit(self.bulk_out, buffer, length, sink)
    }

    /// Synchronous control transfer on the default pipe
    pub fn submit_control(&self, request: &ControlRequest) -> Result<Vec<u8>, DriverError> {
        if self.state != PipeState::Open {
            return Err(DriverError::PipeClosed);
        }
        self.transport.control(request).map_err(DriverError::from)
    }

    fn submit(
        &mut self,
        endpoint: EndpointInfo,
        buffer: Buffer,
        length: usize,
        sink: &CompletionSink,
    ) -> Result<CompletionToken, SubmitError> {
        if self.state != PipeState::Open {
            return Err(SubmitError {
                error: DriverError::PipeClosed,
                buffer,
            });
        }

        let token = CompletionToken(self.next_token);
        self.next_token += 1;

        let request = TransferRequest {
            token,
            endpoint,
            buffer,
            length: endpoint_limit(&endpoint, length),
        };

        self.transport
            .submit(request, sink)
            .map_err(|rejected| SubmitError {
                error: DriverError::from(rejected.error),
                buffer: rejected.request.buffer,
            })?;

        debug!("Submitted {} on {} ({} bytes)", token, endpoint.kind, length);
        Ok(token)
    }

    /// Request early completion of an in-flight transfer
    ///
    /// Works in every state so that a closing pipe set can still be drained.
    pub fn cancel(&self, token: CompletionToken) {
        self.transport.cancel(token);
    }

    /// Stop accepting submissions while in-flight transfers drain
    pub fn begin_close(&mut self) {
        if self.state == PipeState::Open {
            self.state = PipeState::Closing;
        }
    }

    /// Close every endpoint, in reverse open order. Idempotent.
    pub fn close_all(&mut self) {
        if self.state == PipeState::Closed {
            return;
        }
        info!("Closing USB pipes");
        self.transport.close_endpoint(&self.interrupt);
        self.transport.close_endpoint(&self.bulk_out);
        self.transport.close_endpoint(&self.bulk_in);
        self.state = PipeState::Closed;
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == PipeState::Open
    }

    pub fn endpoint(&self, kind: EndpointKind) -> EndpointInfo {
        match kind {
            EndpointKind::BulkIn => self.bulk_in,
            EndpointKind::BulkOut => self.bulk_out,
            EndpointKind::Interrupt => self.interrupt,
        }
    }
}

impl Drop for PipeSet {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Open one endpoint, closing everything in `opened` if it fails
fn open_one(
    transport: &Arc<dyn UsbTransport>,
    kind: EndpointKind,
    opened: &mut Vec<EndpointInfo>,
) -> Result<EndpointInfo, DriverError> {
    match transport.open_endpoint(kind) {
        Ok(info) => {
            debug!(
                "Opened {} endpoint {:#04x} (max packet {})",
                kind, info.address, info.max_packet_size
            );
            opened.push(info);
            Ok(info)
        }
        Err(reason) => {
            warn!("Failed to open {} endpoint: {}", kind, reason);
            for endpoint in opened.drain(..).rev() {
                transport.close_endpoint(&endpoint);
                debug!("Rolled back {} endpoint", endpoint.kind);
            }
            Err(DriverError::PipeOpenError {
                endpoint: kind,
                reason,
            })
        }
    }
}

/// Receives are posted for whole packets only
fn endpoint_limit(endpoint: &EndpointInfo, length: usize) -> usize {
    let mps = endpoint.max_packet_size as usize;
    if endpoint.kind == EndpointKind::BulkIn && mps > 0 && length >= mps {
        length - (length % mps)
    } else {
        length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::usb::buffer_pool::{BufferPool, BufferState};
    use crate::usb::ids::DeviceTable;

    fn configured(mock: &Arc<MockTransport>) -> DeviceHandle {
        let mut handle = DeviceHandle::matched(mock.clone(), &DeviceTable::default()).unwrap();
        handle.configure(1, 0).unwrap();
        handle
    }

    #[test]
    fn test_open_all_in_order() {
        let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
        let handle = configured(&mock);

        let pipes = PipeSet::open_all(&handle).unwrap();
        assert!(pipes.is_open());
        assert_eq!(
            mock.open_endpoints(),
            vec![
                EndpointKind::BulkIn,
                EndpointKind::BulkOut,
                EndpointKind::Interrupt
            ]
        );

        drop(pipes);
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_open_requires_configuration() {
        let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
        let handle = DeviceHandle::matched(mock.clone(), &DeviceTable::default()).unwrap();

        assert!(matches!(
            PipeSet::open_all(&handle),
            Err(DriverError::PipeOpenError { .. })
        ));
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_rollback_on_interrupt_failure() {
        let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
        mock.fail_endpoint(EndpointKind::Interrupt);
        let handle = configured(&mock);

        let err = PipeSet::open_all(&handle).err().unwrap();
        assert!(matches!(
            err,
            DriverError::PipeOpenError {
                endpoint: EndpointKind::Interrupt,
                ..
            }
        ));
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_submit_after_close_returns_buffer() {
        let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
        let handle = configured(&mock);
        let mut pipes = PipeSet::open_all(&handle).unwrap();
        let mut pool = BufferPool::new("rx", 1, 512);
        let (tx, _rx) = async_channel::unbounded();
        let sink = CompletionSink::new(tx);

        pipes.begin_close();
        let buffer = pool.acquire(BufferState::PostedForReceive).unwrap();
        let err = pipes.submit_receive(buffer, &sink).unwrap_err();
        assert_eq!(err.error, DriverError::PipeClosed);
        assert_eq!(mock.submitted_count(), 0);

        pool.release(err.buffer);
        assert!(pool.all_free());
    }

    #[test]
    fn test_receive_length_rounded_to_packets() {
        let bulk_in = EndpointInfo {
            kind: EndpointKind::BulkIn,
            address: 0x81,
            max_packet_size: 512,
        };
        assert_eq!(endpoint_limit(&bulk_in, 2048), 2048);
        assert_eq!(endpoint_limit(&bulk_in, 2000), 1536);
        assert_eq!(endpoint_limit(&bulk_in, 100), 100);

        let bulk_out = EndpointInfo {
            kind: EndpointKind::BulkOut,
            ..bulk_in
        };
        assert_eq!(endpoint_limit(&bulk_out, 2000), 2000);
    }
}
