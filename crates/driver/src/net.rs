//! Boundary to the network stack
//!
//! The driver core never owns the upper layer; it only calls back into it
//! through [`NetworkEndpoint`]. Callbacks run on the driver's work context and
//! must return quickly: copy the frame, queue it, and get out.

use crate::usb::transport::{CompletionToken, TransferStatus};
use std::fmt;

/// Handle returned for an accepted transmit, echoed back on its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueuedToken(pub u64);

impl From<CompletionToken> for QueuedToken {
    fn from(token: CompletionToken) -> Self {
        QueuedToken(token.0)
    }
}

impl fmt::Display for QueuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Upper network layer as seen from the completion path
pub trait NetworkEndpoint: Send {
    /// A frame arrived; `frame` is only valid for the duration of the call
    fn on_frame_received(&mut self, frame: &[u8]);

    /// A transmit finished; its buffer is already back in the pool
    fn on_transmit_complete(&mut self, token: QueuedToken);

    /// A transmit failed or was cancelled. Retrying is up to the caller.
    fn on_transmit_failed(&mut self, token: QueuedToken, status: TransferStatus);

    /// The device went away or the interface was torn down while up
    fn on_link_down(&mut self) {}
}
