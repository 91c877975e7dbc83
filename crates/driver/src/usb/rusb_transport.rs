//! libusb-backed transport
//!
//! rusb exposes synchronous transfers only, so each submitting endpoint gets
//! a dedicated I/O thread fed through a job channel. One thread per endpoint
//! keeps completions for that endpoint in submission order. Reads poll with a
//! short timeout so a cancellation request is noticed promptly.

use crate::error::{TransportError, map_rusb_error};
use crate::usb::ids::DeviceTable;
use crate::usb::transport::{
    Completion, CompletionSink, CompletionToken, ControlRequest, EndpointInfo, EndpointKind,
    SubmitRejected, TransferRequest, TransferStatus, TransportIdentity, UsbTransport,
};
use async_channel::{Receiver, Sender};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Bulk-in read timeout between cancellation checks
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on a single bulk-out write
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for control transfers
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// Transfers handed to an I/O thread and not yet finished, and which of
/// them were asked to stop. `cancelled` is always a subset of `live`.
#[derive(Debug, Default)]
struct TransferTokens {
    live: HashSet<CompletionToken>,
    cancelled: HashSet<CompletionToken>,
}

impl TransferTokens {
    fn begin(&mut self, token: CompletionToken) {
        self.live.insert(token);
    }

    /// Returns false for tokens that already finished
    fn cancel(&mut self, token: CompletionToken) -> bool {
        self.live.contains(&token) && self.cancelled.insert(token)
    }

    fn is_cancelled(&self, token: CompletionToken) -> bool {
        self.cancelled.contains(&token)
    }

    fn finish(&mut self, token: CompletionToken) {
        self.live.remove(&token);
        self.cancelled.remove(&token);
    }
}

type SharedTokens = Arc<Mutex<TransferTokens>>;

fn lock_tokens(tokens: &SharedTokens) -> MutexGuard<'_, TransferTokens> {
    tokens.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Job {
    request: TransferRequest,
    sink: CompletionSink,
}

struct EndpointWorker {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

/// State that only exists between configuration and release
struct Io {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    kernel_driver_detached: bool,
    endpoints: Vec<EndpointInfo>,
    workers: HashMap<EndpointKind, EndpointWorker>,
}

pub struct RusbTransport {
    device: Device<Context>,
    identity: TransportIdentity,
    io: Mutex<Option<Io>>,
    tokens: SharedTokens,
}

impl RusbTransport {
    /// Wrap a device; nothing is opened until configuration
    pub fn new(device: Device<Context>) -> Result<Self, TransportError> {
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

        Ok(Self {
            device,
            identity: TransportIdentity {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
            },
            io: Mutex::new(None),
            tokens: SharedTokens::default(),
        })
    }

    /// Bus number and address, for logging
    pub fn location(&self) -> (u8, u8) {
        (self.device.bus_number(), self.device.address())
    }

    fn lock_io(&self) -> MutexGuard<'_, Option<Io>> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select `configuration`, claim `interface` and find its endpoints
    ///
    /// The interface is released again if endpoint discovery fails.
    fn claim(
        &self,
        handle: &DeviceHandle<Context>,
        configuration: u8,
        interface: u8,
    ) -> Result<Vec<EndpointInfo>, TransportError> {
        // Re-selecting the active configuration would reset the device.
        match handle.active_configuration() {
            Ok(active) if active == configuration => {
                debug!("Configuration {} already active", configuration);
            }
            _ => handle
                .set_active_configuration(configuration)
                .map_err(map_rusb_error)?,
        }

        handle.claim_interface(interface).map_err(map_rusb_error)?;
        debug!("Claimed interface {}", interface);

        discover_endpoints(&self.device, interface).inspect_err(|_| {
            if let Err(e) = handle.release_interface(interface) {
                debug!("Failed to release interface {}: {}", interface, e);
            }
        })
    }
}

/// Every connected device the table supports
pub fn find_supported_devices(
    context: &Context,
    table: &DeviceTable,
) -> Result<Vec<Device<Context>>, TransportError> {
    let devices = context.devices().map_err(map_rusb_error)?;

    Ok(devices
        .iter()
        .filter(|device| {
            device
                .device_descriptor()
                .map(|d| table.is_supported(d.vendor_id(), d.product_id()))
                .unwrap_or(false)
        })
        .collect())
}

impl UsbTransport for RusbTransport {
    fn identity(&self) -> Result<TransportIdentity, TransportError> {
        Ok(self.identity)
    }

    fn set_configuration(&self, configuration: u8, interface: u8) -> Result<(), TransportError> {
        let mut io = self.lock_io();
        if io.is_some() {
            return Err(TransportError::Busy);
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        // Detach kernel driver if active
        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle.detach_kernel_driver(interface).map_err(map_rusb_error)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        let endpoints = restore_on_error(
            self.claim(&handle, configuration, interface),
            kernel_driver_detached,
            || {
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    warn!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    );
                }
            },
        )?;

        *io = Some(Io {
            handle: Arc::new(handle),
            interface,
            kernel_driver_detached,
            endpoints,
            workers: HashMap::new(),
        });
        Ok(())
    }

    fn open_endpoint(&self, kind: EndpointKind) -> Result<EndpointInfo, TransportError> {
        let mut guard = self.lock_io();
        let io = guard.as_mut().ok_or(TransportError::InvalidParam)?;

        let info = io
            .endpoints
            .iter()
            .find(|e| e.kind == kind)
            .copied()
            .ok_or(TransportError::NotFound)?;

        if kind != EndpointKind::Interrupt && !io.workers.contains_key(&kind) {
            let (jobs, rx) = async_channel::unbounded();
            let handle = io.handle.clone();
            let tokens = self.tokens.clone();

            let thread = std::thread::Builder::new()
                .name(format!("usb-{}", kind))
                .spawn(move || run_endpoint(handle, info, rx, tokens))
                .map_err(|e| TransportError::Other(format!("failed to spawn I/O thread: {}", e)))?;

            io.workers.insert(kind, EndpointWorker { jobs, thread });
        }

        Ok(info)
    }

    fn close_endpoint(&self, endpoint: &EndpointInfo) {
        let mut guard = self.lock_io();
        if let Some(worker) = guard.as_mut().and_then(|io| io.workers.remove(&endpoint.kind)) {
            // Closing the job channel lets the thread run out.
            worker.jobs.close();
            if worker.thread.join().is_err() {
                warn!("{} I/O thread panicked", endpoint.kind);
            }
        }
        debug!("Closed {} endpoint {:#04x}", endpoint.kind, endpoint.address);
    }

    fn submit(
        &self,
        request: TransferRequest,
        sink: &CompletionSink,
    ) -> Result<(), SubmitRejected> {
        let guard = self.lock_io();
        let Some(worker) = guard
            .as_ref()
            .and_then(|io| io.workers.get(&request.endpoint.kind))
        else {
            return Err(SubmitRejected {
                error: TransportError::NotFound,
                request,
            });
        };

        let token = request.token;
        lock_tokens(&self.tokens).begin(token);

        let job = Job {
            request,
            sink: sink.clone(),
        };
        worker.jobs.try_send(job).map_err(|e| {
            lock_tokens(&self.tokens).finish(token);
            SubmitRejected {
                error: TransportError::Io,
                request: e.into_inner().request,
            }
        })
    }

    fn cancel(&self, token: CompletionToken) {
        if !lock_tokens(&self.tokens).cancel(token) {
            trace!("Cancel for finished transfer {} ignored", token);
        }
    }

    fn control(&self, request: &ControlRequest) -> Result<Vec<u8>, TransportError> {
        let handle = self
            .lock_io()
            .as_ref()
            .map(|io| io.handle.clone())
            .ok_or(TransportError::InvalidParam)?;

        if request.is_in() {
            let mut buffer = vec![0u8; request.read_length];
            let len = handle
                .read_control(
                    request.request_type,
                    request.request,
                    request.value,
                    request.index,
                    &mut buffer,
                    CONTROL_TIMEOUT,
                )
                .map_err(map_rusb_error)?;
            buffer.truncate(len);
            Ok(buffer)
        } else {
            handle
                .write_control(
                    request.request_type,
                    request.request,
                    request.value,
                    request.index,
                    &request.data,
                    CONTROL_TIMEOUT,
                )
                .map_err(map_rusb_error)?;
            Ok(Vec::new())
        }
    }

    fn release(&self) {
        let Some(io) = self.lock_io().take() else {
            return;
        };

        for (kind, worker) in io.workers {
            worker.jobs.close();
            if worker.thread.join().is_err() {
                warn!("{} I/O thread panicked", kind);
            }
        }

        match Arc::try_unwrap(io.handle) {
            Ok(handle) => {
                if let Err(e) = handle.release_interface(io.interface) {
                    warn!("Failed to release interface {}: {}", io.interface, e);
                }
                // Reattach kernel driver to restore device to kernel control
                if io.kernel_driver_detached {
                    if let Err(e) = handle.attach_kernel_driver(io.interface) {
                        debug!(
                            "Could not reattach kernel driver to interface {}: {}",
                            io.interface, e
                        );
                    }
                }
            }
            Err(_) => warn!("Device handle still shared at release; closing without cleanup"),
        }

        let (bus, address) = self.location();
        info!("Released USB device at bus {} address {}", bus, address);
    }
}

/// Hand the interface back to the kernel driver when attaching failed
/// after it was detached
fn restore_on_error<T>(
    result: Result<T, TransportError>,
    kernel_driver_detached: bool,
    reattach: impl FnOnce(),
) -> Result<T, TransportError> {
    if result.is_err() && kernel_driver_detached {
        reattach();
    }
    result
}

/// Find bulk-in, bulk-out and interrupt endpoints on alternate setting 0
fn discover_endpoints(
    device: &Device<Context>,
    interface: u8,
) -> Result<Vec<EndpointInfo>, TransportError> {
    let config = device.active_config_descriptor().map_err(map_rusb_error)?;
    let mut endpoints: Vec<EndpointInfo> = Vec::new();

    let Some(setting) = config
        .interfaces()
        .find(|i| i.number() == interface)
        .and_then(|i| i.descriptors().next())
    else {
        return Err(TransportError::NotFound);
    };

    for ep in setting.endpoint_descriptors() {
        let kind = match (ep.transfer_type(), ep.direction()) {
            (TransferType::Bulk, Direction::In) => EndpointKind::BulkIn,
            (TransferType::Bulk, Direction::Out) => EndpointKind::BulkOut,
            (TransferType::Interrupt, Direction::In) => EndpointKind::Interrupt,
            _ => continue,
        };
        // Chips with several bulk-out queues: the first one carries data.
        if endpoints.iter().any(|e| e.kind == kind) {
            continue;
        }
        trace!("Found {} endpoint {:#04x}", kind, ep.address());
        endpoints.push(EndpointInfo {
            kind,
            address: ep.address(),
            max_packet_size: ep.max_packet_size(),
        });
    }

    Ok(endpoints)
}

/// I/O thread body for one bulk endpoint
fn run_endpoint(
    handle: Arc<DeviceHandle<Context>>,
    endpoint: EndpointInfo,
    jobs: Receiver<Job>,
    tokens: SharedTokens,
) {
    debug!("{} I/O thread started", endpoint.kind);

    while let Ok(Job { request, sink }) = jobs.recv_blocking() {
        let completion = match endpoint.kind {
            EndpointKind::BulkIn => read_one(&handle, &endpoint, request, &tokens),
            _ => write_one(&handle, &endpoint, request, &tokens),
        };
        // Finished before delivery, so later cancels for it are ignored.
        lock_tokens(&tokens).finish(completion.token);
        sink.deliver(completion);
    }

    debug!("{} I/O thread stopped", endpoint.kind);
}

fn read_one(
    handle: &DeviceHandle<Context>,
    endpoint: &EndpointInfo,
    mut request: TransferRequest,
    tokens: &SharedTokens,
) -> Completion {
    let length = request.length.min(request.buffer.capacity());
    loop {
        if lock_tokens(tokens).is_cancelled(request.token) {
            return request.complete(TransferStatus::Cancelled, 0);
        }
        let buf = &mut request.buffer.storage_mut()[..length];
        match handle.read_bulk(endpoint.address, buf, READ_POLL_TIMEOUT) {
            Ok(n) => return request.complete(TransferStatus::Success, n),
            // rusb drops the byte count on timeout, so data a transfer had
            // read when the poll deadline hit is lost. A full buffer moves in
            // well under a millisecond at high speed; only a device stalling
            // mid-transfer for the whole interval is affected.
            Err(rusb::Error::Timeout) => continue,
            Err(rusb::Error::Pipe) => {
                if let Err(e) = handle.clear_halt(endpoint.address) {
                    debug!("clear_halt on {:#04x} failed: {}", endpoint.address, e);
                }
                return request.complete(TransferStatus::Stall, 0);
            }
            Err(e) => {
                let status = TransferStatus::from_transport_error(&map_rusb_error(e));
                return request.complete(status, 0);
            }
        }
    }
}

fn write_one(
    handle: &DeviceHandle<Context>,
    endpoint: &EndpointInfo,
    request: TransferRequest,
    tokens: &SharedTokens,
) -> Completion {
    if lock_tokens(tokens).is_cancelled(request.token) {
        return request.complete(TransferStatus::Cancelled, 0);
    }

    let length = request.length.min(request.buffer.len());
    match handle.write_bulk(
        endpoint.address,
        &request.buffer.as_slice()[..length],
        WRITE_TIMEOUT,
    ) {
        Ok(n) if n < request.length => request.complete(TransferStatus::Short, n),
        Ok(n) => request.complete(TransferStatus::Success, n),
        Err(e) => {
            let status = TransferStatus::from_transport_error(&map_rusb_error(e));
            request.complete(status, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_read_poll_outlasts_largest_buffer_at_full_speed() {
        // 32 KiB at the 12 Mbit/s full-speed signalling rate
        let largest_buffer_bits = 32 * 1024 * 8;
        let fill_time = Duration::from_micros(largest_buffer_bits * 1_000_000 / 12_000_000);

        assert!(READ_POLL_TIMEOUT >= fill_time * 4);
    }

    #[test]
    fn test_failed_configuration_reattaches_kernel_driver() {
        let reattached = Cell::new(0);
        let result: Result<(), _> = restore_on_error(Err(TransportError::Busy), true, || {
            reattached.set(reattached.get() + 1)
        });

        assert_eq!(result, Err(TransportError::Busy));
        assert_eq!(reattached.get(), 1);
    }

    #[test]
    fn test_no_reattach_when_not_detached_or_on_success() {
        let reattached = Cell::new(false);

        let result: Result<(), _> =
            restore_on_error(Err(TransportError::Access), false, || reattached.set(true));
        assert!(result.is_err());

        let result = restore_on_error(Ok(3), true, || reattached.set(true));
        assert_eq!(result, Ok(3));
        assert!(!reattached.get());
    }

    #[test]
    fn test_cancel_after_finish_is_not_retained() {
        let mut tokens = TransferTokens::default();
        tokens.begin(CompletionToken(1));
        tokens.begin(CompletionToken(2));

        assert!(tokens.cancel(CompletionToken(1)));
        assert!(tokens.is_cancelled(CompletionToken(1)));
        tokens.finish(CompletionToken(1));
        tokens.finish(CompletionToken(2));

        // Completion already queued when the cancel arrives
        assert!(!tokens.cancel(CompletionToken(2)));
        assert!(!tokens.cancel(CompletionToken(9)));
        assert!(tokens.live.is_empty());
        assert!(tokens.cancelled.is_empty());
    }
}
