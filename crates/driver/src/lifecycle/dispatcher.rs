//! Completion dispatcher
//!
//! The one place where transfer outcomes are interpreted. Completions are
//! handled strictly in the order they were queued, so per-endpoint delivery
//! order from the transport is preserved.
//!
//! | direction | status              | action                                   |
//! |-----------|---------------------|------------------------------------------|
//! | receive   | success             | deliver, release, replenish receives     |
//! | receive   | transient error     | release, replenish if enabled            |
//! | receive   | cancelled           | release                                  |
//! | receive   | device gone         | release, report device gone              |
//! | receive   | anything else       | release                                  |
//! | transmit  | success             | release, report completion               |
//! | transmit  | anything else       | release, report failure (no retry)       |

use crate::error::DriverError;
use crate::lifecycle::inflight::InFlightTable;
use crate::lifecycle::state::DeviceState;
use crate::net::{NetworkEndpoint, QueuedToken};
use crate::usb::buffer_pool::{BufferPool, BufferState};
use crate::usb::pipes::{PipeSet, SubmitError};
use crate::usb::transport::{
    Completion, CompletionSink, CompletionToken, EndpointKind, TransferStatus,
};
use tracing::{debug, trace, warn};

/// Counters kept by the data path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Receives that failed with a transient error and were re-posted
    pub rx_transient_errors: u64,
    /// Times re-posting a receive was skipped because the pool was empty
    pub rx_resubmit_skipped: u64,
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub tx_failed: u64,
    /// Transfers that missed a drain deadline
    pub leaked_transfers: u64,
    /// Completions for tokens the driver no longer tracked
    pub unknown_completions: u64,
}

/// Everything the submission and completion paths share
pub(crate) struct DataPath {
    pub pipes: Option<PipeSet>,
    pub rx_pool: BufferPool,
    pub tx_pool: BufferPool,
    pub in_flight: InFlightTable,
    pub endpoint: Box<dyn NetworkEndpoint>,
    pub sink: CompletionSink,
    /// Receives to keep posted while enabled
    pub rx_target: usize,
}

impl DataPath {
    fn pool_for(&mut self, kind: EndpointKind) -> &mut BufferPool {
        match kind {
            EndpointKind::BulkOut => &mut self.tx_pool,
            EndpointKind::BulkIn | EndpointKind::Interrupt => &mut self.rx_pool,
        }
    }

    /// Post one receive buffer on bulk-in
    pub fn post_receive(&mut self) -> Result<CompletionToken, DriverError> {
        let Some(pipes) = self.pipes.as_mut() else {
            return Err(DriverError::PipeClosed);
        };
        let buffer = self.rx_pool.acquire(BufferState::PostedForReceive)?;

        match pipes.submit_receive(buffer, &self.sink) {
            Ok(token) => {
                self.in_flight.insert(token, EndpointKind::BulkIn);
                Ok(token)
            }
            Err(SubmitError { error, buffer }) => {
                self.rx_pool.release(buffer);
                Err(error)
            }
        }
    }

    /// Post receives until `rx_target` are live
    ///
    /// Pool exhaustion ends the cycle early with a warning; it is not an error.
    pub fn replenish_receives(&mut self, stats: &mut DriverStats) -> Result<usize, DriverError> {
        let mut posted = 0;
        while self.in_flight.live_receives() < self.rx_target {
            match self.post_receive() {
                Ok(_) => posted += 1,
                Err(DriverError::Exhausted) => {
                    stats.rx_resubmit_skipped += 1;
                    warn!(
                        "Receive pool exhausted, {} of {} receives posted",
                        self.in_flight.live_receives(),
                        self.rx_target
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(posted)
    }

    /// Copy `frame` into a transmit buffer and post it on bulk-out
    pub fn post_transmit(&mut self, frame: &[u8]) -> Result<CompletionToken, DriverError> {
        let Some(pipes) = self.pipes.as_mut() else {
            return Err(DriverError::PipeClosed);
        };
        if frame.len() > self.tx_pool.buffer_size() {
            return Err(DriverError::FrameTooLarge {
                len: frame.len(),
                max: self.tx_pool.buffer_size(),
            });
        }

        let mut buffer = match self.tx_pool.acquire(BufferState::PostedForTransmit) {
            Ok(buffer) => buffer,
            Err(DriverError::Exhausted) => return Err(DriverError::Busy),
            Err(e) => return Err(e),
        };
        if let Err(e) = buffer.fill(frame) {
            self.tx_pool.release(buffer);
            return Err(e);
        }

        match pipes.submit_transmit(buffer, frame.len(), &self.sink) {
            Ok(token) => {
                self.in_flight.insert(token, EndpointKind::BulkOut);
                Ok(token)
            }
            Err(SubmitError { error, buffer }) => {
                self.tx_pool.release(buffer);
                Err(error)
            }
        }
    }

    /// Request cancellation of every transfer not already cancelled
    pub fn cancel_all(&mut self) -> usize {
        let tokens = self.in_flight.take_uncancelled();
        if let Some(pipes) = self.pipes.as_ref() {
            for token in &tokens {
                pipes.cancel(*token);
            }
        }
        if !tokens.is_empty() {
            debug!("Requested cancellation of {} transfers", tokens.len());
        }
        tokens.len()
    }
}

/// What the state machine has to do after a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Handled,
    /// The transport says the device is gone
    DeviceGone,
    /// Token was not tracked; buffer reclaimed anyway
    Unknown,
}

#[derive(Debug, Default)]
pub struct CompletionDispatcher {
    stats: DriverStats,
}

impl CompletionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut DriverStats {
        &mut self.stats
    }

    /// Interpret one completion under the current device `state`
    pub(crate) fn dispatch(
        &mut self,
        completion: Completion,
        state: DeviceState,
        data: &mut DataPath,
    ) -> Dispatched {
        let Some(entry) = data.in_flight.remove(completion.token) else {
            warn!(
                "Completion for unknown transfer {} on {}",
                completion.token, completion.endpoint
            );
            self.stats.unknown_completions += 1;
            data.pool_for(completion.endpoint).release(completion.buffer);
            return Dispatched::Unknown;
        };

        trace!(
            "Completion {} on {}: {} ({} of {} bytes)",
            completion.token,
            entry.kind,
            completion.status,
            completion.actual_length,
            completion.requested_length
        );

        match entry.kind {
            EndpointKind::BulkOut => self.transmit_done(completion, data),
            EndpointKind::BulkIn | EndpointKind::Interrupt => {
                self.receive_done(completion, entry.leaked, state, data)
            }
        }
    }

    fn receive_done(
        &mut self,
        completion: Completion,
        was_leaked: bool,
        state: DeviceState,
        data: &mut DataPath,
    ) -> Dispatched {
        let Completion {
            token,
            status,
            buffer,
            ..
        } = completion;

        let replenish = match status {
            TransferStatus::Success | TransferStatus::Short => {
                if state == DeviceState::Enabled && !buffer.is_empty() {
                    data.rx_pool.mark(&buffer, BufferState::ReadyForDelivery);
                    self.stats.rx_frames += 1;
                    self.stats.rx_bytes += buffer.len() as u64;
                    data.endpoint.on_frame_received(buffer.as_slice());
                }
                data.rx_pool.release(buffer);
                true
            }
            TransferStatus::DeviceGone => {
                data.rx_pool.release(buffer);
                return Dispatched::DeviceGone;
            }
            TransferStatus::Cancelled => {
                data.rx_pool.release(buffer);
                // A leaked buffer coming home frees capacity for a new post.
                was_leaked
            }
            transient if transient.is_transient() => {
                debug!("Receive {} failed: {}", token, transient);
                self.stats.rx_transient_errors += 1;
                data.rx_pool.release(buffer);
                true
            }
            other => {
                warn!("Receive {} ended with {}; not re-posting", token, other);
                data.rx_pool.release(buffer);
                false
            }
        };

        if replenish && state == DeviceState::Enabled {
            match data.replenish_receives(&mut self.stats) {
                Ok(_) => {}
                Err(DriverError::DeviceGone) => return Dispatched::DeviceGone,
                Err(e) => warn!("Failed to re-post receive: {}", e),
            }
        }

        Dispatched::Handled
    }

    fn transmit_done(&mut self, completion: Completion, data: &mut DataPath) -> Dispatched {
        let Completion {
            token,
            status,
            requested_length,
            actual_length,
            buffer,
            ..
        } = completion;
        data.tx_pool.release(buffer);

        let token = QueuedToken::from(token);
        match status {
            TransferStatus::Success if actual_length >= requested_length => {
                self.stats.tx_frames += 1;
                self.stats.tx_bytes += actual_length as u64;
                data.endpoint.on_transmit_complete(token);
                Dispatched::Handled
            }
            TransferStatus::Success | TransferStatus::Short => {
                self.stats.tx_failed += 1;
                data.endpoint.on_transmit_failed(token, TransferStatus::Short);
                Dispatched::Handled
            }
            TransferStatus::DeviceGone => {
                self.stats.tx_failed += 1;
                data.endpoint.on_transmit_failed(token, status);
                Dispatched::DeviceGone
            }
            _ => {
                debug!("Transmit {} failed: {}", token, status);
                self.stats.tx_failed += 1;
                data.endpoint.on_transmit_failed(token, status);
                Dispatched::Handled
            }
        }
    }
}
