//! Fixed-capacity pool of transfer buffers
//!
//! Buffers are allocated lazily up to the pool capacity and never freed
//! individually: once handed out they come back through [`BufferPool::release`].
//! A [`Buffer`] is a move-only value, so whoever holds it is its single owner;
//! the pool additionally records an ownership tag per slot so the invariant
//! can be observed from outside.

use crate::error::DriverError;
use tracing::{trace, warn};

/// Stable identity of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Who currently owns a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    Free,
    PostedForReceive,
    PostedForTransmit,
    ReadyForDelivery,
}

/// A buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid region
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Full backing storage, for transports to read into
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Copy `frame` into the buffer and mark it valid
    pub fn fill(&mut self, frame: &[u8]) -> Result<(), DriverError> {
        if frame.len() > self.data.len() {
            return Err(DriverError::FrameTooLarge {
                len: frame.len(),
                max: self.data.len(),
            });
        }
        self.data[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        Ok(())
    }
}

struct Slot {
    state: BufferState,
    /// `None` while the buffer is on loan
    storage: Option<Box<[u8]>>,
}

/// Recycles fixed-size buffers for one direction of the data path
pub struct BufferPool {
    name: &'static str,
    capacity: usize,
    buffer_size: usize,
    slots: Vec<Slot>,
    /// Indices of allocated slots currently Free
    free: Vec<usize>,
}

impl BufferPool {
    pub fn new(name: &'static str, capacity: usize, buffer_size: usize) -> Self {
        Self {
            name,
            capacity,
            buffer_size,
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
        }
    }

    /// Take a Free buffer and tag it with `owner`
    ///
    /// Returns [`DriverError::Exhausted`] when every buffer is already out;
    /// the pool never grows past its capacity.
    pub fn acquire(&mut self, owner: BufferState) -> Result<Buffer, DriverError> {
        debug_assert_ne!(owner, BufferState::Free);

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    state: BufferState::Free,
                    storage: Some(vec![0u8; self.buffer_size].into_boxed_slice()),
                });
                self.slots.len() - 1
            }
            None => return Err(DriverError::Exhausted),
        };

        let slot = &mut self.slots[index];
        let Some(data) = slot.storage.take() else {
            // Free list and slot storage disagree; treat as exhausted
            // rather than hand out a second owner.
            warn!("{} pool slot {} on free list while on loan", self.name, index);
            return Err(DriverError::Exhausted);
        };
        slot.state = owner;
        trace!("{} pool: buffer {} -> {:?}", self.name, index, owner);

        Ok(Buffer {
            id: BufferId(index),
            data,
            len: 0,
        })
    }

    /// Return a buffer to the Free state; never allocates or blocks
    pub fn release(&mut self, buffer: Buffer) {
        let index = buffer.id.0;
        match self.slots.get_mut(index) {
            Some(slot) if slot.storage.is_none() && buffer.data.len() == self.buffer_size => {
                slot.storage = Some(buffer.data);
                slot.state = BufferState::Free;
                self.free.push(index);
                trace!("{} pool: buffer {} -> Free", self.name, index);
            }
            _ => {
                warn!(
                    "{} pool: ignoring release of foreign buffer {}",
                    self.name, index
                );
            }
        }
    }

    /// Re-tag a buffer the caller holds
    pub fn mark(&mut self, buffer: &Buffer, state: BufferState) {
        if let Some(slot) = self.slots.get_mut(buffer.id.0) {
            if slot.storage.is_none() {
                slot.state = state;
                trace!("{} pool: buffer {} -> {:?}", self.name, buffer.id.0, state);
            }
        }
    }

    /// Ownership tag of a slot; unallocated slots are Free
    pub fn state_of(&self, id: BufferId) -> Option<BufferState> {
        if id.0 >= self.capacity {
            return None;
        }
        Some(
            self.slots
                .get(id.0)
                .map(|s| s.state)
                .unwrap_or(BufferState::Free),
        )
    }

    /// Number of buffers currently in `state`
    pub fn count(&self, state: BufferState) -> usize {
        let allocated = self.slots.iter().filter(|s| s.state == state).count();
        if state == BufferState::Free {
            allocated + (self.capacity - self.slots.len())
        } else {
            allocated
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers allocated so far
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Buffers on loan
    pub fn outstanding(&self) -> usize {
        self.capacity - self.count(BufferState::Free)
    }

    pub fn all_free(&self) -> bool {
        self.outstanding() == 0
    }
}
