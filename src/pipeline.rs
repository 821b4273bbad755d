use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::contract::{CompletionToken, PipelineError};
use crate::params::EncodeCtrlExt;
use crate::pool::{FrameResource, deadline_after, time_left};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSendError {
    Full,
    Closed,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRecvError {
    Empty,
    Timeout,
    Cancelled,
    Closed,
}

impl From<QueueSendError> for PipelineError {
    fn from(err: QueueSendError) -> Self {
        PipelineError::InvalidEntry(format!("hand-off push failed: {err:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    /// End of stream was pushed or the queue was cancelled.
    Draining,
    /// End of stream was popped.
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub depth: usize,
    pub peak_depth: usize,
}

#[derive(Debug)]
struct QueueCounters {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
}

impl QueueCounters {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
        }
    }

    fn on_push(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak_depth.load(Ordering::Relaxed);
        while depth > peak {
            match self.peak_depth.compare_exchange_weak(
                peak,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    fn on_pop(&self) {
        let current = self.depth.load(Ordering::Relaxed);
        if current > 0 {
            let _ = self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn on_clear(&self) {
        self.depth.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct EntryMeta {
    pub target_id: u32,
    pub frame_index: u64,
    /// Per-frame encoder control travelling with the frame.
    pub encode_ctrl: Option<EncodeCtrlExt>,
}

/// One item in a hand-off queue. An entry without a resource is the
/// end-of-stream marker.
#[derive(Debug)]
pub struct HandoffEntry {
    pub resource: Option<FrameResource>,
    pub token: Option<CompletionToken>,
    pub meta: EntryMeta,
}

impl HandoffEntry {
    #[must_use]
    pub fn frame(resource: FrameResource, token: Option<CompletionToken>, meta: EntryMeta) -> Self {
        Self {
            resource: Some(resource),
            token,
            meta,
        }
    }

    #[must_use]
    pub fn end_of_stream() -> Self {
        Self {
            resource: None,
            token: None,
            meta: EntryMeta::default(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.resource.is_none()
    }
}

#[derive(Debug)]
struct QueueInner {
    entries: VecDeque<HandoffEntry>,
    state: QueueState,
    cancelled: bool,
    inserted: u64,
    released: u64,
}

/// Thread-safe FIFO handing frames from one stage to the next.
///
/// A pushed frame gains one reference which the consumer drops through
/// [`HandoffQueue::release`] once it is done with it.
pub struct HandoffQueue {
    name: String,
    capacity: Option<usize>,
    inner: Mutex<QueueInner>,
    insert_cv: Condvar,
    release_cv: Condvar,
    counters: QueueCounters,
}

impl HandoffQueue {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.map(|capacity| capacity.max(1)),
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                state: QueueState::Open,
                cancelled: false,
                inserted: 0,
                released: 0,
            }),
            insert_cv: Condvar::new(),
            release_cv: Condvar::new(),
            counters: QueueCounters::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends without waiting; a full bounded queue reports `Full`.
    pub fn push(&self, entry: HandoffEntry) -> Result<(), QueueSendError> {
        self.push_timeout(entry, Duration::ZERO)
    }

    /// Appends, waiting up to `timeout` for room in a bounded queue. The
    /// end-of-stream marker is never refused for lack of room.
    pub fn push_timeout(&self, entry: HandoffEntry, timeout: Duration) -> Result<(), QueueSendError> {
        if entry.resource.is_none() && entry.token.is_some() {
            return Err(QueueSendError::Invalid);
        }
        let deadline = deadline_after(timeout);
        let mut inner = self.lock();
        loop {
            if inner.cancelled || inner.state != QueueState::Open {
                return Err(QueueSendError::Closed);
            }
            let full = self
                .capacity
                .is_some_and(|capacity| inner.entries.len() >= capacity);
            if !full || entry.is_end_of_stream() {
                break;
            }
            let Some(left) = time_left(deadline) else {
                return Err(QueueSendError::Full);
            };
            inner = self
                .release_cv
                .wait_timeout(inner, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }

        match &entry.resource {
            Some(resource) => {
                resource.retain().map_err(|_| QueueSendError::Invalid)?;
                trace!(queue = %self.name, frame = entry.meta.frame_index, "push");
            }
            None => {
                inner.state = QueueState::Draining;
                debug!(queue = %self.name, "end of stream queued");
            }
        }
        inner.entries.push_back(entry);
        inner.inserted = inner.inserted.wrapping_add(1);
        self.counters.on_push();
        drop(inner);
        self.insert_cv.notify_all();
        Ok(())
    }

    /// Removes the oldest entry, waiting up to `timeout` for one.
    pub fn pop(&self, timeout: Duration) -> Result<HandoffEntry, QueueRecvError> {
        let deadline = deadline_after(timeout);
        let mut inner = self.lock();
        loop {
            if let Some(entry) = self.take_front(&mut inner) {
                drop(inner);
                self.release_cv.notify_all();
                return Ok(entry);
            }
            if inner.state == QueueState::Closed {
                return Err(QueueRecvError::Closed);
            }
            if inner.cancelled {
                return Err(QueueRecvError::Cancelled);
            }
            let Some(left) = time_left(deadline) else {
                return Err(QueueRecvError::Timeout);
            };
            inner = self
                .insert_cv
                .wait_timeout(inner, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn try_pop(&self) -> Result<HandoffEntry, QueueRecvError> {
        let mut inner = self.lock();
        match self.take_front(&mut inner) {
            Some(entry) => {
                drop(inner);
                self.release_cv.notify_all();
                Ok(entry)
            }
            None if inner.state == QueueState::Closed => Err(QueueRecvError::Closed),
            None if inner.cancelled => Err(QueueRecvError::Cancelled),
            None => Err(QueueRecvError::Empty),
        }
    }

    fn take_front(&self, inner: &mut QueueInner) -> Option<HandoffEntry> {
        let entry = inner.entries.pop_front()?;
        self.counters.on_pop();
        if entry.is_end_of_stream() {
            inner.state = QueueState::Closed;
            debug!(queue = %self.name, "end of stream consumed");
        }
        Some(entry)
    }

    /// Drops the reference a consumer received from `pop`.
    pub fn release(&self, resource: &FrameResource) -> Result<(), PipelineError> {
        resource.release()?;
        let mut inner = self.lock();
        inner.released = inner.released.wrapping_add(1);
        drop(inner);
        self.release_cv.notify_all();
        Ok(())
    }

    /// Refuses further pushes and wakes every waiter.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        inner.cancelled = true;
        if inner.state == QueueState::Open {
            inner.state = QueueState::Draining;
        }
        drop(inner);
        debug!(queue = %self.name, "cancelled");
        self.insert_cv.notify_all();
        self.release_cv.notify_all();
    }

    /// Waits for a `release` or `pop`. Returns `false` on timeout.
    pub fn wait_for_release(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let seen = inner.released;
        let entries = inner.entries.len();
        let (_guard, result) = self
            .release_cv
            .wait_timeout_while(inner, timeout, |inner| {
                inner.released == seen && inner.entries.len() >= entries && !inner.cancelled
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !result.timed_out()
    }

    /// Waits for the next insertion. Returns `false` on timeout.
    pub fn wait_for_insertion(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let seen = inner.inserted;
        let (_guard, result) = self
            .insert_cv
            .wait_timeout_while(inner, timeout, |inner| {
                inner.inserted == seen && !inner.cancelled
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !result.timed_out()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    /// Drops every queued entry, releasing the queue's references, and
    /// reopens the queue. Returns how many frames were discarded.
    ///
    /// Every entry is released even if one fails; the first failure is
    /// returned and failed entries are not counted.
    pub fn reset(&self) -> Result<usize, PipelineError> {
        let mut inner = self.lock();
        let drained: Vec<HandoffEntry> = inner.entries.drain(..).collect();
        inner.state = QueueState::Open;
        inner.cancelled = false;
        self.counters.on_clear();
        drop(inner);

        let mut discarded = 0;
        let mut failure = None;
        for entry in drained {
            let Some(resource) = entry.resource else {
                continue;
            };
            // The queue held exactly one reference per frame entry.
            match resource.release() {
                Ok(()) => discarded += 1,
                Err(err) => {
                    error!(queue = %self.name, %err, "queued frame lost its reference");
                    failure.get_or_insert(err);
                }
            }
        }
        if discarded > 0 {
            debug!(queue = %self.name, discarded, "reset dropped queued frames");
        }
        self.release_cv.notify_all();
        match failure {
            Some(err) => Err(err),
            None => Ok(discarded),
        }
    }
}

impl fmt::Debug for HandoffQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("len", &self.len())
            .finish()
    }
}
