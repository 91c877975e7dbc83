//! Driver worker thread
//!
//! The state machine lives on a dedicated blocking thread, which makes that
//! thread the serialized work context. Async callers reach it through a
//! [`DriverBridge`]; everything the data path reports upward comes back as a
//! [`DriverEvent`] on the same bridge.

use crate::error::DriverError;
use crate::lifecycle::{DeviceState, DeviceStateMachine, DrainReport, DriverStatus};
use crate::net::{NetworkEndpoint, QueuedToken};
use crate::usb::transport::{ControlRequest, TransferStatus, TransportEvent};
use async_channel::Sender;
use bytes::Bytes;
use common::{CommandBridge, CommandWorker};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How long the worker waits on completions before checking for commands
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Commands from the async side to the driver thread
#[derive(Debug)]
pub enum DriverCommand {
    BringUp {
        response: oneshot::Sender<Result<(), DriverError>>,
    },
    BringDown {
        response: oneshot::Sender<Result<DrainReport, DriverError>>,
    },
    Transmit {
        frame: Bytes,
        response: oneshot::Sender<Result<QueuedToken, DriverError>>,
    },
    Control {
        request: ControlRequest,
        response: oneshot::Sender<Result<Vec<u8>, DriverError>>,
    },
    Status {
        response: oneshot::Sender<DriverStatus>,
    },
    /// Host-side notification, e.g. from a hotplug watcher
    Transport(TransportEvent),
    Detach {
        response: oneshot::Sender<Result<DrainReport, DriverError>>,
    },
    /// Detach if needed and stop the thread
    Shutdown,
}

/// Events from the driver thread to the async side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    FrameReceived(Bytes),
    TransmitCompleted(QueuedToken),
    TransmitFailed {
        token: QueuedToken,
        status: TransferStatus,
    },
    LinkDown,
    StateChanged(DeviceState),
}

pub type DriverBridge = CommandBridge<DriverCommand, DriverEvent>;
pub type DriverWorker = CommandWorker<DriverCommand, DriverEvent>;

/// [`NetworkEndpoint`] that forwards everything as [`DriverEvent`]s
///
/// Never blocks the driver thread. Received frames go on the bounded event
/// lane and are dropped when it is full. Transmit outcomes and link events go
/// on the priority lane and are never dropped while the bridge is alive.
pub struct ChannelEndpoint {
    frames: Sender<DriverEvent>,
    priority: Sender<DriverEvent>,
}

impl ChannelEndpoint {
    pub fn new(worker: &DriverWorker) -> Self {
        Self {
            frames: worker.event_sender(),
            priority: worker.priority_sender(),
        }
    }

    fn publish_frame(&self, frame: &[u8]) {
        let event = DriverEvent::FrameReceived(Bytes::copy_from_slice(frame));
        if self.frames.try_send(event).is_err() {
            warn!("Event channel full, dropping received frame ({} bytes)", frame.len());
        }
    }

    fn publish(&self, event: DriverEvent) {
        if let Err(e) = self.priority.try_send(event) {
            debug!("No event consumer, dropping {:?}", e.into_inner());
        }
    }
}

impl NetworkEndpoint for ChannelEndpoint {
    fn on_frame_received(&mut self, frame: &[u8]) {
        self.publish_frame(frame);
    }

    fn on_transmit_complete(&mut self, token: QueuedToken) {
        self.publish(DriverEvent::TransmitCompleted(token));
    }

    fn on_transmit_failed(&mut self, token: QueuedToken, status: TransferStatus) {
        self.publish(DriverEvent::TransmitFailed { token, status });
    }

    fn on_link_down(&mut self) {
        self.publish(DriverEvent::LinkDown);
    }
}

pub struct DriverWorkerThread {
    machine: DeviceStateMachine,
    worker: DriverWorker,
    last_state: DeviceState,
}

impl DriverWorkerThread {
    pub fn new(machine: DeviceStateMachine, worker: DriverWorker) -> Self {
        let last_state = machine.state();
        Self {
            machine,
            worker,
            last_state,
        }
    }

    /// Run until Shutdown arrives or every bridge handle is dropped
    pub fn run(mut self) {
        info!("Driver worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(DriverCommand::Shutdown) => {
                    info!("Driver worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_disconnected() => {
                    info!("All driver handles dropped, shutting down");
                    break;
                }
                None => {}
            }

            self.machine.wait_for_completions(COMMAND_POLL_INTERVAL);
            self.publish_state();
        }

        if self.machine.state() != DeviceState::Closed {
            if let Err(e) = self.machine.detach() {
                warn!("Detach during shutdown: {}", e);
            }
            self.publish_state();
        }

        info!("Driver worker thread stopped");
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        // A panic in the core must not take the thread down with commands pending.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in driver command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::BringUp { response } => {
                let _ = response.send(self.machine.bring_up());
            }
            DriverCommand::BringDown { response } => {
                let _ = response.send(self.machine.bring_down());
            }
            DriverCommand::Transmit { frame, response } => {
                let _ = response.send(self.machine.transmit(&frame));
            }
            DriverCommand::Control { request, response } => {
                let _ = response.send(self.machine.control_transfer(&request));
            }
            DriverCommand::Status { response } => {
                let _ = response.send(self.machine.status());
            }
            DriverCommand::Transport(event) => {
                debug!("Transport event: {:?}", event);
                self.machine.handle_transport_event(event);
            }
            DriverCommand::Detach { response } => {
                let _ = response.send(self.machine.detach());
            }
            DriverCommand::Shutdown => {}
        }
        self.publish_state();
    }

    fn publish_state(&mut self) {
        let state = self.machine.state();
        if state != self.last_state {
            self.last_state = state;
            if self
                .worker
                .send_priority_event(DriverEvent::StateChanged(state))
                .is_err()
            {
                debug!("No event consumer, state change to {} not published", state);
            }
        }
    }
}

/// Spawn the driver worker thread
pub fn spawn_driver_worker(
    machine: DeviceStateMachine,
    worker: DriverWorker,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("driver-worker".to_string())
        .spawn(move || DriverWorkerThread::new(machine, worker).run())
}
