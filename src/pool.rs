use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::contract::{FrameGeometry, FrameHandle, PipelineError, SessionBackend, Timestamp90k};

/// Longest single sleep while waiting for a release, so stop requests are
/// noticed even if no release ever happens.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(10);

/// `None` when `timeout` reaches past what `Instant` can represent, which
/// means the wait never expires.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left until `deadline`, or `None` once it has passed. Waits without
/// a deadline proceed one [`WAIT_SLICE`] at a time.
pub(crate) fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero()),
        None => Some(WAIT_SLICE),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    pub pts_90k: Option<Timestamp90k>,
    pub frame_order: Option<u64>,
}

#[derive(Debug, Default)]
struct ReleaseSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl ReleaseSignal {
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> u64 {
        *self.lock()
    }

    fn notify(&self) {
        let mut generation = self.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Returns early once the generation moves past `seen`.
    fn wait_past(&self, seen: u64, timeout: Duration) {
        let guard = self.lock();
        if *guard != seen {
            return;
        }
        let _ = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen);
    }
}

struct Slot {
    index: usize,
    handle: FrameHandle,
    geometry: FrameGeometry,
    lock_count: AtomicU16,
    meta: Mutex<FrameMeta>,
}

/// Shared handle to one pooled frame.
///
/// Cloning the handle does not touch the lock count; only [`retain`] and
/// [`release`] do. A frame is free exactly when its lock count is zero.
///
/// [`retain`]: FrameResource::retain
/// [`release`]: FrameResource::release
#[derive(Clone)]
pub struct FrameResource {
    slot: Arc<Slot>,
    signal: Arc<ReleaseSignal>,
}

impl FrameResource {
    pub fn index(&self) -> usize {
        self.slot.index
    }

    pub fn handle(&self) -> FrameHandle {
        self.slot.handle
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.slot.geometry
    }

    pub fn lock_count(&self) -> u16 {
        self.slot.lock_count.load(Ordering::Acquire)
    }

    pub fn is_free(&self) -> bool {
        self.lock_count() == 0
    }

    pub fn meta(&self) -> FrameMeta {
        *self
            .slot
            .meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_meta(&self, meta: FrameMeta) {
        *self
            .slot
            .meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = meta;
    }

    /// Adds a reference. The caller must already hold one.
    pub fn retain(&self) -> Result<(), PipelineError> {
        self.slot
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    count.checked_add(1)
                }
            })
            .map(|_| ())
            .map_err(|count| {
                PipelineError::InvalidEntry(format!(
                    "cannot retain frame {:?} with lock count {count}",
                    self.slot.handle
                ))
            })
    }

    /// Drops a reference, waking pool waiters when the frame becomes free.
    pub fn release(&self) -> Result<(), PipelineError> {
        let previous = self
            .slot
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| PipelineError::DoubleRelease {
                handle: self.slot.handle,
            })?;
        if previous == 1 {
            self.signal.notify();
        }
        Ok(())
    }

    pub fn same_frame(&self, other: &FrameResource) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    fn try_claim(&self) -> bool {
        self.slot
            .lock_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for FrameResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameResource")
            .field("index", &self.slot.index)
            .field("handle", &self.slot.handle)
            .field("lock_count", &self.lock_count())
            .finish()
    }
}

/// Fixed set of backend frames shared by all stages of a pipeline.
pub struct ResourcePool {
    frames: Vec<FrameResource>,
    signal: Arc<ReleaseSignal>,
    geometry: FrameGeometry,
    stop: CancellationToken,
}

impl ResourcePool {
    /// Asks the backend for exactly `count` frames.
    pub fn allocate(
        backend: &dyn SessionBackend,
        count: usize,
        geometry: FrameGeometry,
    ) -> Result<Self, PipelineError> {
        if count == 0 {
            return Err(PipelineError::InvalidConfig(
                "frame pool size must be at least 1".to_string(),
            ));
        }
        let handles = backend.allocate_frames(count, geometry)?;
        if handles.len() < count {
            return Err(PipelineError::ResourceExhausted {
                requested: count,
                available: handles.len(),
            });
        }
        debug!(count, %geometry, "allocated frame pool");
        Ok(Self::from_handles(handles, geometry))
    }

    pub fn from_handles(handles: Vec<FrameHandle>, geometry: FrameGeometry) -> Self {
        let signal = Arc::new(ReleaseSignal::default());
        let frames = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| FrameResource {
                slot: Arc::new(Slot {
                    index,
                    handle,
                    geometry,
                    lock_count: AtomicU16::new(0),
                    meta: Mutex::new(FrameMeta::default()),
                }),
                signal: Arc::clone(&signal),
            })
            .collect();
        Self {
            frames,
            signal,
            geometry,
            stop: CancellationToken::new(),
        }
    }

    /// Makes waiting acquirers give up once `stop` is cancelled.
    #[must_use]
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn free_count(&self) -> usize {
        self.frames.iter().filter(|frame| frame.is_free()).count()
    }

    pub fn frames(&self) -> &[FrameResource] {
        &self.frames
    }

    /// Claims a free frame, waiting up to `timeout` for one to be released.
    ///
    /// The returned frame has lock count 1. Returns `None` on timeout or
    /// once the pool's stop token is cancelled.
    pub fn acquire_free(&self, timeout: Duration) -> Option<FrameResource> {
        let deadline = deadline_after(timeout);
        loop {
            let seen = self.signal.current();
            if let Some(frame) = self.frames.iter().find(|frame| frame.try_claim()) {
                return Some(frame.clone());
            }
            if self.stop.is_cancelled() {
                return None;
            }
            let left = time_left(deadline)?;
            self.signal.wait_past(seen, left.min(WAIT_SLICE));
        }
    }

    /// Like [`ResourcePool::acquire_free`], but a timeout is an error.
    pub fn acquire_or_exhausted(&self, timeout: Duration) -> Result<FrameResource, PipelineError> {
        match self.acquire_free(timeout) {
            Some(frame) => Ok(frame),
            None if self.stop.is_cancelled() => Err(PipelineError::Stopped),
            None => {
                warn!(
                    pool_size = self.frames.len(),
                    ?timeout,
                    "no free frame in pool"
                );
                Err(PipelineError::PoolExhausted { waited: timeout })
            }
        }
    }

    pub fn retain(&self, frame: &FrameResource) -> Result<(), PipelineError> {
        self.check_owned(frame)?;
        frame.retain()
    }

    pub fn release(&self, frame: &FrameResource) -> Result<(), PipelineError> {
        self.check_owned(frame)?;
        frame.release()
    }

    /// Wakes every waiting acquirer so it can re-check the stop token.
    pub fn interrupt(&self) {
        self.signal.notify();
    }

    fn check_owned(&self, frame: &FrameResource) -> Result<(), PipelineError> {
        if Arc::ptr_eq(&frame.signal, &self.signal) {
            Ok(())
        } else {
            Err(PipelineError::InvalidEntry(format!(
                "frame {:?} does not belong to this pool",
                frame.handle()
            )))
        }
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("len", &self.frames.len())
            .field("free", &self.free_count())
            .field("geometry", &self.geometry)
            .finish()
    }
}
