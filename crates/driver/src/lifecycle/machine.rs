//! Device state machine
//!
//! Sequences bring-up (match, configure, open pipes), interface up/down and
//! teardown, and owns the single completion queue. All methods take
//! `&mut self`: whoever holds the machine is the serialized work context, and
//! transports only ever touch the queue's producer side.

use crate::error::DriverError;
use crate::lifecycle::dispatcher::{CompletionDispatcher, DataPath, Dispatched, DriverStats};
use crate::lifecycle::inflight::InFlightTable;
use crate::lifecycle::state::{DeviceState, Operation, check};
use crate::net::{NetworkEndpoint, QueuedToken};
use crate::usb::buffer_pool::BufferPool;
use crate::usb::device::DeviceHandle;
use crate::usb::ids::{ChipType, DeviceTable};
use crate::usb::pipes::PipeSet;
use crate::usb::transport::{
    Completion, CompletionSink, ControlRequest, EndpointKind, TransportEvent, TransportIdentity,
    UsbTransport,
};
use async_channel::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sleep between polls of the completion queue while waiting
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed parameters of one driver instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    /// USB configuration value to select
    pub configuration: u8,
    pub interface: u8,
    /// Receive buffers, all of which are posted while enabled
    pub rx_buffers: usize,
    pub tx_buffers: usize,
    /// Size of every receive and transmit buffer
    pub buffer_size: usize,
    /// How long bring-down and detach wait for cancelled transfers
    pub drain_timeout: Duration,
    pub devices: DeviceTable,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            configuration: 1,
            interface: 0,
            rx_buffers: 8,
            tx_buffers: 8,
            buffer_size: 2048,
            drain_timeout: Duration::from_secs(1),
            devices: DeviceTable::default(),
        }
    }
}

/// Result of waiting for cancelled transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Completions processed while draining
    pub completed: usize,
    /// Transfers given up on at the deadline
    pub leaked: usize,
}

/// Point-in-time view for status queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub state: DeviceState,
    pub identity: Option<TransportIdentity>,
    pub chip: Option<ChipType>,
    pub rx_outstanding: usize,
    pub tx_outstanding: usize,
    pub stats: DriverStats,
}

pub struct DeviceStateMachine {
    state: DeviceState,
    settings: DriverSettings,
    device: Option<DeviceHandle>,
    data: DataPath,
    dispatcher: CompletionDispatcher,
    completions: Receiver<Completion>,
}

impl DeviceStateMachine {
    /// Create an unattached driver instance
    pub fn new(settings: DriverSettings, endpoint: Box<dyn NetworkEndpoint>) -> Self {
        let (tx, completions) = async_channel::unbounded();

        let data = DataPath {
            pipes: None,
            rx_pool: BufferPool::new("rx", settings.rx_buffers, settings.buffer_size),
            tx_pool: BufferPool::new("tx", settings.tx_buffers, settings.buffer_size),
            in_flight: InFlightTable::default(),
            endpoint,
            sink: CompletionSink::new(tx),
            rx_target: settings.rx_buffers,
        };

        Self {
            state: DeviceState::Uninitialized,
            settings,
            device: None,
            data,
            dispatcher: CompletionDispatcher::new(),
            completions,
        }
    }

    /// Attach and open pipes in one go
    ///
    /// Returns a machine in `PipesOpen`, ready for [`bring_up`](Self::bring_up).
    pub fn probe(
        transport: Arc<dyn UsbTransport>,
        settings: DriverSettings,
        endpoint: Box<dyn NetworkEndpoint>,
    ) -> Result<Self, DriverError> {
        let mut machine = Self::new(settings, endpoint);
        machine.attach(transport)?;
        machine.open_pipes()?;
        Ok(machine)
    }

    /// Uninitialized → Matched → Configured
    pub fn attach(&mut self, transport: Arc<dyn UsbTransport>) -> Result<(), DriverError> {
        self.match_device(transport)?;
        self.configure()
    }

    /// Uninitialized → Matched
    pub fn match_device(&mut self, transport: Arc<dyn UsbTransport>) -> Result<(), DriverError> {
        check(self.state, Operation::Match)?;

        let device = DeviceHandle::matched(transport, &self.settings.devices)
            .inspect_err(report_attach_error)?;

        let identity = device.identity();
        info!(
            "Matched {} device {:04x}:{:04x}",
            device.chip_type(),
            identity.vendor_id,
            identity.product_id
        );
        self.device = Some(device);
        self.state = DeviceState::Matched;
        Ok(())
    }

    /// Matched → Configured
    pub fn configure(&mut self) -> Result<(), DriverError> {
        check(self.state, Operation::Configure)?;
        let Some(device) = self.device.as_mut() else {
            return Err(self.invalid(Operation::Configure));
        };

        device
            .configure(self.settings.configuration, self.settings.interface)
            .inspect_err(report_attach_error)?;

        self.state = DeviceState::Configured;
        Ok(())
    }

    /// Configured → PipesOpen, all-or-nothing
    pub fn open_pipes(&mut self) -> Result<(), DriverError> {
        check(self.state, Operation::OpenPipes)?;
        let Some(device) = self.device.as_ref() else {
            return Err(self.invalid(Operation::OpenPipes));
        };

        let pipes = PipeSet::open_all(device).inspect_err(report_attach_error)?;

        self.data.pipes = Some(pipes);
        self.state = DeviceState::PipesOpen;
        info!("Driver started");
        Ok(())
    }

    /// PipesOpen/Disabled → Enabled, priming the receive path
    pub fn bring_up(&mut self) -> Result<(), DriverError> {
        check(self.state, Operation::BringUp)?;
        let previous = self.state;

        // Late completions from an earlier session go first.
        self.process_completions();
        if self.state != previous {
            return Err(DriverError::DeviceGone);
        }

        self.state = DeviceState::Enabled;

        match self.data.replenish_receives(self.dispatcher.stats_mut()) {
            Ok(posted) => {
                info!("Network interface enabled ({} receives posted)", posted);
                Ok(())
            }
            Err(DriverError::DeviceGone) => {
                self.force_closing("device disappeared while priming receives");
                Err(DriverError::DeviceGone)
            }
            Err(e) => {
                error!("Failed to prime receive path: {}", e);
                self.state = previous;
                self.cancel_and_drain();
                Err(e)
            }
        }
    }

    /// Enabled → Disabled; returns once every cancelled transfer completed
    /// or the drain timeout expired
    pub fn bring_down(&mut self) -> Result<DrainReport, DriverError> {
        check(self.state, Operation::BringDown)?;

        self.state = DeviceState::Disabled;
        let report = self.cancel_and_drain();

        if matches!(self.state, DeviceState::Closing | DeviceState::Closed) {
            return Err(DriverError::DeviceGone);
        }
        info!("Network interface disabled");
        Ok(report)
    }

    /// Any state → Closing → Closed. Closing a closed device is a no-op.
    pub fn detach(&mut self) -> Result<DrainReport, DriverError> {
        if self.state == DeviceState::Closed {
            return Ok(DrainReport::default());
        }
        check(self.state, Operation::Detach)?;
        info!("Detaching device (state {})", self.state);

        if self.state == DeviceState::Enabled {
            self.data.endpoint.on_link_down();
        }
        self.state = DeviceState::Closing;
        if let Some(pipes) = self.data.pipes.as_mut() {
            pipes.begin_close();
        }

        let report = self.cancel_and_drain();
        self.finish_close();
        Ok(report)
    }

    /// Queue one outbound frame
    ///
    /// Fails with `NotReady` unless enabled and with `Busy` when every
    /// transmit buffer is in flight.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<QueuedToken, DriverError> {
        check(self.state, Operation::Transmit)?;

        match self.data.post_transmit(frame) {
            Ok(token) => Ok(QueuedToken::from(token)),
            Err(DriverError::DeviceGone) => {
                self.force_closing("device disappeared during transmit");
                Err(DriverError::DeviceGone)
            }
            Err(e) => Err(e),
        }
    }

    /// Control transfer on the default pipe, for the chip-specific layer
    pub fn control_transfer(&mut self, request: &ControlRequest) -> Result<Vec<u8>, DriverError> {
        check(self.state, Operation::Control)?;
        let Some(pipes) = self.data.pipes.as_ref() else {
            return Err(DriverError::PipeClosed);
        };

        match pipes.submit_control(request) {
            Err(DriverError::DeviceGone) => {
                self.force_closing("device disappeared during control transfer");
                Err(DriverError::DeviceGone)
            }
            other => other,
        }
    }

    /// Out-of-band notification from the host
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceGone => self.force_closing("host reported device removal"),
        }
    }

    /// Handle every completion queued so far; returns how many
    pub fn process_completions(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.dispatch_one(completion);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for at least one completion, then handle all
    /// queued ones
    pub fn wait_for_completions(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let handled = self.process_completions();
            let now = Instant::now();
            if handled > 0 || now >= deadline {
                return handled;
            }
            std::thread::sleep(COMPLETION_POLL_INTERVAL.min(deadline - now));
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn stats(&self) -> &DriverStats {
        self.dispatcher.stats()
    }

    pub fn chip_type(&self) -> Option<ChipType> {
        self.device.as_ref().map(|d| d.chip_type())
    }

    pub fn identity(&self) -> Option<TransportIdentity> {
        self.device.as_ref().map(|d| d.identity())
    }

    pub fn rx_pool(&self) -> &BufferPool {
        &self.data.rx_pool
    }

    pub fn tx_pool(&self) -> &BufferPool {
        &self.data.tx_pool
    }

    /// Tracked transfers on `kind`, including leaked ones
    pub fn outstanding(&self, kind: EndpointKind) -> usize {
        self.data.in_flight.count(kind)
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            state: self.state,
            identity: self.identity(),
            chip: self.chip_type(),
            rx_outstanding: self.outstanding(EndpointKind::BulkIn),
            tx_outstanding: self.outstanding(EndpointKind::BulkOut),
            stats: self.stats().clone(),
        }
    }

    fn dispatch_one(&mut self, completion: Completion) {
        let outcome = self
            .dispatcher
            .dispatch(completion, self.state, &mut self.data);

        if outcome == Dispatched::DeviceGone {
            self.force_closing("transfer reported device gone");
        }

        // A forced teardown finishes on its own once nothing is in flight.
        if self.state == DeviceState::Closing && self.data.in_flight.active() == 0 {
            self.finish_close();
        }
    }

    /// Unconditional move to Closing; does not wait for completions
    fn force_closing(&mut self, reason: &str) {
        if matches!(self.state, DeviceState::Closing | DeviceState::Closed) {
            return;
        }
        error!("Forced teardown from state {}: {}", self.state, reason);

        let was_enabled = self.state == DeviceState::Enabled;
        self.state = DeviceState::Closing;
        if let Some(pipes) = self.data.pipes.as_mut() {
            pipes.begin_close();
        }
        self.data.cancel_all();
        if was_enabled {
            self.data.endpoint.on_link_down();
        }

        if self.data.in_flight.active() == 0 {
            self.finish_close();
        }
    }

    fn cancel_and_drain(&mut self) -> DrainReport {
        self.data.cancel_all();
        self.drain(self.settings.drain_timeout)
    }

    /// Process completions until nothing non-leaked is in flight or the
    /// deadline passes
    fn drain(&mut self, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;
        let mut report = DrainReport::default();

        while self.data.in_flight.active() > 0 {
            match self.completions.try_recv() {
                Ok(completion) => {
                    self.dispatch_one(completion);
                    report.completed += 1;
                }
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(COMPLETION_POLL_INTERVAL);
                }
                Err(TryRecvError::Closed) => break,
            }
        }

        report.leaked = self.data.in_flight.mark_leaked();
        if report.leaked > 0 {
            self.dispatcher.stats_mut().leaked_transfers += report.leaked as u64;
            error!(
                "{} transfers did not complete within {:?}; treating as leaked",
                report.leaked, timeout
            );
        }
        debug!(
            "Drained {} completions ({} leaked)",
            report.completed, report.leaked
        );
        report
    }

    /// Close pipes and release the device
    fn finish_close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }
        if let Some(mut pipes) = self.data.pipes.take() {
            if !self.data.in_flight.is_empty() {
                warn!(
                    "Closing pipes with {} transfers unaccounted for",
                    self.data.in_flight.len()
                );
            }
            pipes.close_all();
        }
        if let Some(mut device) = self.device.take() {
            device.release();
        }
        self.state = DeviceState::Closed;
        info!("Device closed");
    }

    fn invalid(&self, operation: Operation) -> DriverError {
        DriverError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

/// Log an attach step failure at a level matching its class
fn report_attach_error(e: &DriverError) {
    if e.is_bring_up_failure() {
        error!("Bring-up failed: {}", e);
    } else {
        warn!("Attach interrupted: {}", e);
    }
}
