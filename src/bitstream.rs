use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::contract::Timestamp90k;
use crate::params::BitstreamExt;

/// Growable byte buffer with a read cursor, used for compressed input and
/// encoded output alike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitstreamBuffer {
    data: Vec<u8>,
    offset: usize,
    pub pts_90k: Option<Timestamp90k>,
    pub frame_order: Option<u64>,
    pub keyframe: bool,
}

impl BitstreamBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Unconsumed bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Appends new bytes, compacting consumed ones first.
    pub fn append(&mut self, bytes: &[u8]) {
        self.compact();
        self.data.extend_from_slice(bytes);
    }

    pub fn consume(&mut self, count: usize) {
        self.offset = (self.offset + count).min(self.data.len());
        if self.offset == self.data.len() {
            self.data.clear();
            self.offset = 0;
        }
    }

    pub fn compact(&mut self) {
        if self.offset > 0 {
            self.data.drain(..self.offset);
            self.offset = 0;
        }
    }

    /// Grows the allocation so at least `required` bytes fit.
    pub fn ensure_capacity(&mut self, required: usize) {
        self.compact();
        if required > self.data.capacity() {
            trace!(from = self.data.capacity(), to = required, "growing bitstream buffer");
            self.data.reserve(required - self.data.len());
        }
    }

    /// Replaces the contents with one finished output packet.
    pub fn set_payload(&mut self, payload: &[u8]) {
        self.data.clear();
        self.offset = 0;
        self.data.extend_from_slice(payload);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
        self.pts_90k = None;
        self.frame_order = None;
        self.keyframe = false;
    }
}

/// Output buffer lent to an encoder for one in-flight submission. The
/// encoder fills the payload and packet metadata and may attach extension
/// blocks describing the packet.
#[derive(Debug, Clone)]
pub struct BitstreamSlot {
    index: usize,
    buffer: Arc<Mutex<BitstreamExt>>,
}

impl BitstreamSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lock(&self) -> MutexGuard<'_, BitstreamExt> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    fn reset(&self) {
        let mut buffer = self.lock();
        buffer.clear();
        buffer.clear_blocks();
    }
}

/// Fixed set of output buffers for one encoder, sized to its async depth.
#[derive(Debug)]
pub struct BitstreamStore {
    slots: Vec<BitstreamSlot>,
    in_use: Vec<bool>,
}

impl BitstreamStore {
    #[must_use]
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let count = count.max(1);
        let slots = (0..count)
            .map(|index| BitstreamSlot {
                index,
                buffer: Arc::new(Mutex::new(BitstreamExt::from_base(
                    BitstreamBuffer::with_capacity(buffer_size),
                ))),
            })
            .collect();
        Self {
            slots,
            in_use: vec![false; count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }

    /// Lends out a free slot, cleared for reuse.
    pub fn acquire(&mut self) -> Option<BitstreamSlot> {
        let index = self.in_use.iter().position(|used| !*used)?;
        self.in_use[index] = true;
        let slot = self.slots[index].clone();
        slot.reset();
        Some(slot)
    }

    pub fn release(&mut self, slot: &BitstreamSlot) {
        if let Some(used) = self.in_use.get_mut(slot.index) {
            *used = false;
        }
    }

    /// Returns every slot to the store, discarding pending contents.
    pub fn release_all(&mut self) {
        for (slot, used) in self.slots.iter().zip(self.in_use.iter_mut()) {
            if *used {
                slot.reset();
            }
            *used = false;
        }
    }
}
