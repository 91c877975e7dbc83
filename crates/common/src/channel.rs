//! Async channel bridge between Tokio runtime and the driver thread
//!
//! The driver core runs on a dedicated blocking thread. Async callers talk to
//! it through a [`CommandBridge`]; the thread itself holds the matching
//! [`CommandWorker`]. Commands flow down over a bounded channel.
//!
//! Events flow up on two lanes. The bounded lane carries bulk traffic a
//! stalled consumer may lose (a full lane rejects the event). The priority
//! lane is unbounded and carries events that must never be lost, such as
//! completion credits and state changes. Receivers drain the priority lane
//! first, so a priority event may overtake bulk events sent before it.

use async_channel::{Receiver, Sender, TrySendError, bounded, unbounded};

/// Handle for Tokio runtime (async)
pub struct CommandBridge<C, E> {
    cmd_tx: Sender<C>,
    event_rx: Receiver<E>,
    priority_rx: Receiver<E>,
}

impl<C, E> Clone for CommandBridge<C, E> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            event_rx: self.event_rx.clone(),
            priority_rx: self.priority_rx.clone(),
        }
    }
}

impl<C, E> CommandBridge<C, E> {
    /// Send a command to the driver thread
    pub async fn send_command(&self, cmd: C) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| crate::Error::Channel("driver thread is gone".to_string()))
    }

    /// Receive the next event, priority lane first
    ///
    /// Fails only once both lanes are closed and empty.
    pub async fn recv_event(&self) -> crate::Result<E> {
        if let Ok(event) = self.priority_rx.try_recv() {
            return Ok(event);
        }

        let closed = |e: async_channel::RecvError| crate::Error::Channel(e.to_string());
        tokio::select! {
            biased;
            event = self.priority_rx.recv() => match event {
                Ok(event) => Ok(event),
                Err(_) => self.event_rx.recv().await.map_err(closed),
            },
            event = self.event_rx.recv() => match event {
                Ok(event) => Ok(event),
                Err(_) => self.priority_rx.recv().await.map_err(closed),
            },
        }
    }

    /// Try to receive an event without waiting, priority lane first
    pub fn try_recv_event(&self) -> Option<E> {
        self.priority_rx
            .try_recv()
            .or_else(|_| self.event_rx.try_recv())
            .ok()
    }
}

/// Handle for the driver thread (blocking)
pub struct CommandWorker<C, E> {
    cmd_rx: Receiver<C>,
    event_tx: Sender<E>,
    priority_tx: Sender<E>,
}

impl<C, E> CommandWorker<C, E> {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<C> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<C> {
        self.cmd_rx.try_recv().ok()
    }

    /// True once every bridge handle has been dropped
    pub fn is_disconnected(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: E) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|_| crate::Error::Channel("event receiver is gone".to_string()))
    }

    /// Send an event without blocking
    ///
    /// Returns the event back when the channel is full or closed.
    pub fn try_send_event(&self, event: E) -> std::result::Result<(), E> {
        self.event_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(ev) | TrySendError::Closed(ev) => ev,
        })
    }

    /// Send on the priority lane; never blocks and never drops
    ///
    /// Returns the event back only when every bridge handle is gone.
    pub fn send_priority_event(&self, event: E) -> std::result::Result<(), E> {
        self.priority_tx
            .try_send(event)
            .map_err(TrySendError::into_inner)
    }

    /// Clone the event sender for components that publish events directly
    pub fn event_sender(&self) -> Sender<E> {
        self.event_tx.clone()
    }

    /// Clone the priority sender for components that publish events directly
    pub fn priority_sender(&self) -> Sender<E> {
        self.priority_tx.clone()
    }
}

/// Create the channel bridge between Tokio and the driver thread
///
/// `capacity` bounds the command channel and the bulk event lane.
/// Returns (CommandBridge for Tokio, CommandWorker for the driver thread)
pub fn create_bridge<C, E>(capacity: usize) -> (CommandBridge<C, E>, CommandWorker<C, E>) {
    let (cmd_tx, cmd_rx) = bounded(capacity);
    let (event_tx, event_rx) = bounded(capacity);
    let (priority_tx, priority_rx) = unbounded();

    (
        CommandBridge {
            cmd_tx,
            event_rx,
            priority_rx,
        },
        CommandWorker {
            cmd_rx,
            event_tx,
            priority_tx,
        },
    )
}
