//! Transport seam between the driver core and the host USB stack
//!
//! A [`UsbTransport`] performs the actual I/O. Transfers are submitted
//! asynchronously: the transport takes ownership of the request (and its
//! buffer) and later pushes exactly one [`Completion`] for it onto the
//! [`CompletionSink`] it was handed. The sink is the only thing the transport's
//! execution context ever touches, so completions never contend with the
//! driver's serialized work context.

use crate::error::TransportError;
use crate::usb::buffer_pool::Buffer;
use async_channel::Sender;
use std::fmt;
use tracing::debug;

/// Endpoints a device must expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    BulkIn,
    BulkOut,
    Interrupt,
}

impl EndpointKind {
    /// Order in which endpoints are opened
    pub const OPEN_ORDER: [EndpointKind; 3] = [
        EndpointKind::BulkIn,
        EndpointKind::BulkOut,
        EndpointKind::Interrupt,
    ];
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::BulkIn => write!(f, "bulk-in"),
            EndpointKind::BulkOut => write!(f, "bulk-out"),
            EndpointKind::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Descriptor-level facts about an opened endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub kind: EndpointKind,
    /// Endpoint address (e.g., 0x81 for IN endpoint 1)
    pub address: u8,
    pub max_packet_size: u16,
}

/// Identifies one in-flight transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionToken(pub u64);

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    /// Fewer bytes moved than requested (transmit only)
    Short,
    Stall,
    Timeout,
    Overflow,
    Error,
    Cancelled,
    DeviceGone,
}

impl TransferStatus {
    /// Errors worth re-posting a receive for
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransferStatus::Stall
                | TransferStatus::Timeout
                | TransferStatus::Overflow
                | TransferStatus::Error
        )
    }

    pub fn from_transport_error(err: &TransportError) -> Self {
        match err {
            TransportError::Pipe => TransferStatus::Stall,
            TransportError::Timeout => TransferStatus::Timeout,
            TransportError::Overflow => TransferStatus::Overflow,
            TransportError::NoDevice => TransferStatus::DeviceGone,
            _ => TransferStatus::Error,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Success => "success",
            TransferStatus::Short => "short transfer",
            TransferStatus::Stall => "stall",
            TransferStatus::Timeout => "timeout",
            TransferStatus::Overflow => "overflow",
            TransferStatus::Error => "i/o error",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::DeviceGone => "device gone",
        };
        f.write_str(s)
    }
}

/// One transfer handed to the transport
///
/// Owns its buffer until the matching [`Completion`] hands it back.
#[derive(Debug)]
pub struct TransferRequest {
    pub token: CompletionToken,
    pub endpoint: EndpointInfo,
    pub buffer: Buffer,
    /// Bytes to read (receive) or write (transmit)
    pub length: usize,
}

impl TransferRequest {
    /// Finish this request, producing its single completion
    pub fn complete(mut self, status: TransferStatus, actual_length: usize) -> Completion {
        let actual_length = actual_length.min(self.length);
        if self.endpoint.kind != EndpointKind::BulkOut {
            self.buffer.set_len(actual_length);
        }
        Completion {
            token: self.token,
            endpoint: self.endpoint.kind,
            status,
            requested_length: self.length,
            actual_length,
            buffer: self.buffer,
        }
    }
}

/// Completion notification for one [`TransferRequest`]
#[derive(Debug)]
pub struct Completion {
    pub token: CompletionToken,
    pub endpoint: EndpointKind,
    pub status: TransferStatus,
    pub requested_length: usize,
    pub actual_length: usize,
    pub buffer: Buffer,
}

/// Producer side of the single-consumer completion queue
#[derive(Debug, Clone)]
pub struct CompletionSink {
    tx: Sender<Completion>,
}

impl CompletionSink {
    pub fn new(tx: Sender<Completion>) -> Self {
        Self { tx }
    }

    /// Push a completion; never blocks
    pub fn deliver(&self, completion: Completion) {
        if let Err(e) = self.tx.try_send(completion) {
            // Only happens once the driver itself has been dropped.
            debug!(
                "Dropping completion {} with no consumer",
                e.into_inner().token
            );
        }
    }
}

/// A standard or vendor control transfer on the default pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Payload for OUT requests; ignored for IN requests
    pub data: Vec<u8>,
    /// Bytes to read for IN requests
    pub read_length: usize,
}

impl ControlRequest {
    /// Direction from request_type bit 7
    pub fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }
}

/// Vendor/product identity read from the device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Out-of-band notifications from the host about the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Device was unplugged or terminated by the host
    DeviceGone,
}

/// A transfer the transport refused to accept; the buffer comes back
#[derive(Debug)]
pub struct SubmitRejected {
    pub error: TransportError,
    pub request: TransferRequest,
}

/// Host USB stack as seen by the driver core
pub trait UsbTransport: Send + Sync {
    fn identity(&self) -> Result<TransportIdentity, TransportError>;

    /// Select `configuration` and claim `interface`
    fn set_configuration(&self, configuration: u8, interface: u8) -> Result<(), TransportError>;

    fn open_endpoint(&self, kind: EndpointKind) -> Result<EndpointInfo, TransportError>;

    fn close_endpoint(&self, endpoint: &EndpointInfo);

    /// Queue a transfer. On `Ok` exactly one completion will later be pushed
    /// onto `sink`; on `Err` none will.
    fn submit(&self, request: TransferRequest, sink: &CompletionSink)
    -> Result<(), SubmitRejected>;

    /// Ask for an in-flight transfer to finish early with
    /// [`TransferStatus::Cancelled`]. Unknown or finished tokens are ignored.
    fn cancel(&self, token: CompletionToken);

    /// Synchronous control transfer; returns bytes read (IN) or an empty
    /// vector (OUT)
    fn control(&self, request: &ControlRequest) -> Result<Vec<u8>, TransportError>;

    /// Give the device back to the host
    fn release(&self);
}
