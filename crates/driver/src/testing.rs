//! Test utilities for the driver core
//!
//! [`MockTransport`] is a scripted [`UsbTransport`]: submissions queue up
//! until a test completes them, and cancellation behaviour is selectable.
//! [`RecordingEndpoint`] captures everything the data path reports upward.
//!
//! # Example
//!
//! ```
//! use driver::testing::{MockTransport, RecordingEndpoint};
//! use driver::{DeviceStateMachine, DriverSettings};
//! use std::sync::Arc;
//!
//! let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
//! let (endpoint, log) = RecordingEndpoint::new();
//! let mut machine =
//!     DeviceStateMachine::probe(mock.clone(), DriverSettings::default(), Box::new(endpoint))
//!         .unwrap();
//! machine.bring_up().unwrap();
//!
//! mock.complete_receive(&[1, 2, 3]).unwrap();
//! machine.process_completions();
//! assert_eq!(log.frames(), vec![vec![1, 2, 3]]);
//! ```

use crate::error::TransportError;
use crate::net::{NetworkEndpoint, QueuedToken};
use crate::usb::transport::{
    CompletionSink, CompletionToken, ControlRequest, EndpointInfo, EndpointKind, SubmitRejected,
    TransferRequest, TransferStatus, TransportIdentity, UsbTransport,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What the mock does when asked to cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Push the Cancelled completion from inside `cancel`
    Immediate,
    /// Push it from another thread after a delay
    Deferred(Duration),
    /// Record the request only; the test completes the transfer itself
    Manual,
}

struct Pending {
    request: TransferRequest,
    sink: CompletionSink,
}

struct MockState {
    reject_configuration: bool,
    selected_configuration: Option<u8>,
    fail_endpoint: Option<EndpointKind>,
    open: Vec<EndpointKind>,
    pending: VecDeque<Pending>,
    cancel_policy: CancelPolicy,
    cancel_requests: Vec<CompletionToken>,
    reject_submits: Option<TransportError>,
    /// Submits still accepted before `reject_submits` applies
    submits_before_reject: usize,
    submitted: usize,
    completed: usize,
    releases: usize,
    control_log: Vec<ControlRequest>,
    control_error: Option<TransportError>,
}

/// Scripted in-memory transport
pub struct MockTransport {
    identity: TransportIdentity,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            identity: TransportIdentity {
                vendor_id,
                product_id,
            },
            state: Mutex::new(MockState {
                reject_configuration: false,
                selected_configuration: None,
                fail_endpoint: None,
                open: Vec::new(),
                pending: VecDeque::new(),
                cancel_policy: CancelPolicy::Immediate,
                cancel_requests: Vec::new(),
                reject_submits: None,
                submits_before_reject: 0,
                submitted: 0,
                completed: 0,
                releases: 0,
                control_log: Vec::new(),
                control_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `set_configuration` fail
    pub fn reject_configuration(&self) {
        self.lock().reject_configuration = true;
    }

    /// Make opening `kind` fail
    pub fn fail_endpoint(&self, kind: EndpointKind) {
        self.lock().fail_endpoint = Some(kind);
    }

    pub fn set_cancel_policy(&self, policy: CancelPolicy) {
        self.lock().cancel_policy = policy;
    }

    /// Make every later `submit` fail with `error` (`None` to stop)
    pub fn reject_submits(&self, error: Option<TransportError>) {
        let mut state = self.lock();
        state.reject_submits = error;
        state.submits_before_reject = 0;
    }

    /// Accept the next `accepted` submits, then fail every later one with `error`
    pub fn reject_submits_after(&self, accepted: usize, error: TransportError) {
        let mut state = self.lock();
        state.reject_submits = Some(error);
        state.submits_before_reject = accepted;
    }

    /// Make control transfers fail with `error` (`None` to stop)
    pub fn fail_control(&self, error: Option<TransportError>) {
        self.lock().control_error = error;
    }

    pub fn selected_configuration(&self) -> Option<u8> {
        self.lock().selected_configuration
    }

    /// Endpoints currently open, in open order
    pub fn open_endpoints(&self) -> Vec<EndpointKind> {
        self.lock().open.clone()
    }

    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    pub fn submitted_count(&self) -> usize {
        self.lock().submitted
    }

    /// Completions pushed so far, for any reason
    pub fn completed_count(&self) -> usize {
        self.lock().completed
    }

    pub fn cancel_requests(&self) -> Vec<CompletionToken> {
        self.lock().cancel_requests.clone()
    }

    pub fn pending_count(&self, kind: EndpointKind) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|p| p.request.endpoint.kind == kind)
            .count()
    }

    pub fn pending_tokens(&self, kind: EndpointKind) -> Vec<CompletionToken> {
        self.lock()
            .pending
            .iter()
            .filter(|p| p.request.endpoint.kind == kind)
            .map(|p| p.request.token)
            .collect()
    }

    pub fn control_requests(&self) -> Vec<ControlRequest> {
        self.lock().control_log.clone()
    }

    /// Complete the oldest pending receive with `data`
    pub fn complete_receive(&self, data: &[u8]) -> Option<CompletionToken> {
        let mut state = self.lock();
        let mut pending = take_oldest(&mut state.pending, EndpointKind::BulkIn)?;

        let len = data.len().min(pending.request.length);
        pending.request.buffer.storage_mut()[..len].copy_from_slice(&data[..len]);
        let token = pending.request.token;
        state.completed += 1;
        pending
            .sink
            .deliver(pending.request.complete(TransferStatus::Success, len));
        Some(token)
    }

    /// Complete the oldest pending transmit in full
    pub fn complete_transmit(&self) -> Option<CompletionToken> {
        let mut state = self.lock();
        let pending = take_oldest(&mut state.pending, EndpointKind::BulkOut)?;

        let token = pending.request.token;
        let len = pending.request.length;
        state.completed += 1;
        pending
            .sink
            .deliver(pending.request.complete(TransferStatus::Success, len));
        Some(token)
    }

    /// Finish the oldest pending transfer on `kind` with `status`
    pub fn fail_next(&self, kind: EndpointKind, status: TransferStatus) -> Option<CompletionToken> {
        let mut state = self.lock();
        let pending = take_oldest(&mut state.pending, kind)?;

        let token = pending.request.token;
        state.completed += 1;
        pending.sink.deliver(pending.request.complete(status, 0));
        Some(token)
    }

    /// Finish every pending transfer with `status`; returns how many
    pub fn complete_all(&self, status: TransferStatus) -> usize {
        let mut state = self.lock();
        let drained: Vec<Pending> = state.pending.drain(..).collect();
        state.completed += drained.len();

        let count = drained.len();
        for pending in drained {
            pending.sink.deliver(pending.request.complete(status, 0));
        }
        count
    }
}

fn take_oldest(pending: &mut VecDeque<Pending>, kind: EndpointKind) -> Option<Pending> {
    let index = pending
        .iter()
        .position(|p| p.request.endpoint.kind == kind)?;
    pending.remove(index)
}

impl UsbTransport for MockTransport {
    fn identity(&self) -> Result<TransportIdentity, TransportError> {
        Ok(self.identity)
    }

    fn set_configuration(&self, configuration: u8, _interface: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.reject_configuration {
            return Err(TransportError::InvalidParam);
        }
        state.selected_configuration = Some(configuration);
        Ok(())
    }

    fn open_endpoint(&self, kind: EndpointKind) -> Result<EndpointInfo, TransportError> {
        let mut state = self.lock();
        if state.fail_endpoint == Some(kind) {
            return Err(TransportError::NotFound);
        }
        state.open.push(kind);

        let (address, max_packet_size) = match kind {
            EndpointKind::BulkIn => (0x81, 512),
            EndpointKind::BulkOut => (0x02, 512),
            EndpointKind::Interrupt => (0x83, 64),
        };
        Ok(EndpointInfo {
            kind,
            address,
            max_packet_size,
        })
    }

    fn close_endpoint(&self, endpoint: &EndpointInfo) {
        self.lock().open.retain(|k| *k != endpoint.kind);
    }

    fn submit(
        &self,
        request: TransferRequest,
        sink: &CompletionSink,
    ) -> Result<(), SubmitRejected> {
        let mut state = self.lock();
        if let Some(error) = state.reject_submits.clone() {
            if state.submits_before_reject == 0 {
                return Err(SubmitRejected { error, request });
            }
            state.submits_before_reject -= 1;
        }
        state.submitted += 1;
        state.pending.push_back(Pending {
            request,
            sink: sink.clone(),
        });
        Ok(())
    }

    fn cancel(&self, token: CompletionToken) {
        let mut state = self.lock();
        state.cancel_requests.push(token);

        let policy = state.cancel_policy;
        if policy == CancelPolicy::Manual {
            return;
        }
        let Some(index) = state.pending.iter().position(|p| p.request.token == token) else {
            return;
        };
        let Some(pending) = state.pending.remove(index) else {
            return;
        };
        state.completed += 1;

        let completion = pending.request.complete(TransferStatus::Cancelled, 0);
        match policy {
            CancelPolicy::Deferred(delay) => {
                let sink = pending.sink;
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    sink.deliver(completion);
                });
            }
            _ => pending.sink.deliver(completion),
        }
    }

    fn control(&self, request: &ControlRequest) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if let Some(error) = state.control_error.clone() {
            return Err(error);
        }
        state.control_log.push(request.clone());
        if request.is_in() {
            Ok(vec![0u8; request.read_length])
        } else {
            Ok(Vec::new())
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.releases += 1;
        state.open.clear();
    }
}

#[derive(Debug, Default)]
struct Recorded {
    frames: Vec<Vec<u8>>,
    tx_complete: Vec<QueuedToken>,
    tx_failed: Vec<(QueuedToken, TransferStatus)>,
    link_down: usize,
}

/// [`NetworkEndpoint`] that records every callback
pub struct RecordingEndpoint {
    log: EndpointLog,
}

impl RecordingEndpoint {
    /// Returns the endpoint to hand to the driver and a log to inspect
    pub fn new() -> (Self, EndpointLog) {
        let log = EndpointLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl NetworkEndpoint for RecordingEndpoint {
    fn on_frame_received(&mut self, frame: &[u8]) {
        self.log.lock().frames.push(frame.to_vec());
    }

    fn on_transmit_complete(&mut self, token: QueuedToken) {
        self.log.lock().tx_complete.push(token);
    }

    fn on_transmit_failed(&mut self, token: QueuedToken, status: TransferStatus) {
        self.log.lock().tx_failed.push((token, status));
    }

    fn on_link_down(&mut self) {
        self.log.lock().link_down += 1;
    }
}

/// Shared view of what a [`RecordingEndpoint`] saw
#[derive(Clone, Default)]
pub struct EndpointLog {
    inner: Arc<Mutex<Recorded>>,
}

impl EndpointLog {
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    pub fn transmit_completed(&self) -> Vec<QueuedToken> {
        self.lock().tx_complete.clone()
    }

    pub fn transmit_failed(&self) -> Vec<(QueuedToken, TransferStatus)> {
        self.lock().tx_failed.clone()
    }

    pub fn link_down_count(&self) -> usize {
        self.lock().link_down
    }
}
