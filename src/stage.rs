//! Per-stage submit/synchronize wrappers over a [`SessionBackend`].
//!
//! Drivers hide device-busy retries and translate raw backend statuses into
//! [`StageOutcome`]s and [`PipelineError`]s.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::bitstream::{BitstreamBuffer, BitstreamSlot};
use crate::contract::{
    CompletionToken, PipelineError, SessionBackend, StageKind, SubmitStatus, SyncStatus,
};
use crate::params::EncodeCtrlExt;
use crate::pool::FrameResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyPolicy {
    /// Sleep between retries of a busy submit.
    pub backoff: Duration,
    /// Continuous busy time after which the device is considered failed.
    pub busy_timeout: Duration,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(1),
            busy_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyStats {
    pub retries: u64,
    pub busy_time: Duration,
}

#[derive(Debug)]
pub enum StageOutcome<O> {
    Complete { token: CompletionToken, output: O },
    MoreDataNeeded,
    /// Output is ready and another one is buffered for the same input.
    MoreOutputPending { token: CompletionToken, output: O },
    DeviceHang,
}

pub struct StageDriver {
    kind: StageKind,
    backend: Arc<dyn SessionBackend>,
    policy: BusyPolicy,
    stats: BusyStats,
}

impl StageDriver {
    #[must_use]
    pub fn new(kind: StageKind, backend: Arc<dyn SessionBackend>, policy: BusyPolicy) -> Self {
        Self {
            kind,
            backend,
            policy,
            stats: BusyStats::default(),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn stats(&self) -> BusyStats {
        self.stats
    }

    pub fn submit_decode(
        &mut self,
        mut bitstream: Option<&mut BitstreamBuffer>,
        work: &FrameResource,
    ) -> Result<StageOutcome<FrameResource>, PipelineError> {
        let backend = Arc::clone(&self.backend);
        self.with_retry(|| backend.submit_decode(bitstream.as_deref_mut(), work))
    }

    /// `input == None` drains buffered output.
    pub fn submit_filter(
        &mut self,
        input: Option<&FrameResource>,
        work: &FrameResource,
    ) -> Result<StageOutcome<FrameResource>, PipelineError> {
        let backend = Arc::clone(&self.backend);
        self.with_retry(|| backend.submit_filter(input, work))
    }

    /// Submits one frame (or a drain request) to the encoder, growing the
    /// output buffer whenever the encoder asks for more room.
    pub fn submit_encode(
        &mut self,
        target_id: u32,
        ctrl: Option<&EncodeCtrlExt>,
        input: Option<&FrameResource>,
        output: &BitstreamSlot,
    ) -> Result<StageOutcome<()>, PipelineError> {
        let backend = Arc::clone(&self.backend);
        self.with_retry(|| {
            loop {
                match backend.submit_encode(target_id, ctrl, input, output)? {
                    SubmitStatus::NotEnoughBuffer { required } => {
                        let mut buffer = output.lock();
                        if required <= buffer.capacity() {
                            return Err(PipelineError::Backend(format!(
                                "encoder asked for {required} bytes but the buffer already holds {}",
                                buffer.capacity()
                            )));
                        }
                        debug!(target_id, required, "growing encoder output buffer");
                        buffer.ensure_capacity(required);
                    }
                    other => return Ok(other),
                }
            }
        })
    }

    fn with_retry<O>(
        &mut self,
        mut submit: impl FnMut() -> Result<SubmitStatus<O>, PipelineError>,
    ) -> Result<StageOutcome<O>, PipelineError> {
        let mut busy_since: Option<Instant> = None;
        loop {
            let status = submit()?;
            if !matches!(status, SubmitStatus::DeviceBusy) {
                if let Some(started) = busy_since {
                    self.stats.busy_time += started.elapsed();
                }
            }
            match status {
                SubmitStatus::Complete { token, output } => {
                    return Ok(StageOutcome::Complete { token, output });
                }
                SubmitStatus::MoreOutputPending { token, output } => {
                    return Ok(StageOutcome::MoreOutputPending { token, output });
                }
                SubmitStatus::MoreDataNeeded => return Ok(StageOutcome::MoreDataNeeded),
                SubmitStatus::DeviceHang => {
                    warn!(stage = %self.kind, "device hang reported on submit");
                    return Ok(StageOutcome::DeviceHang);
                }
                SubmitStatus::NotEnoughBuffer { required } => {
                    return Err(PipelineError::Backend(format!(
                        "{} stage cannot grow its output buffer (needs {required} bytes)",
                        self.kind
                    )));
                }
                SubmitStatus::DeviceBusy => {}
            }

            // Busy: the identical submission is retried after a short sleep.
            let busy_for = busy_since.get_or_insert_with(Instant::now).elapsed();
            if busy_for > self.policy.busy_timeout {
                self.stats.busy_time += busy_for;
                warn!(stage = %self.kind, ?busy_for, "device stayed busy, giving up");
                return Err(PipelineError::DeviceFailed {
                    stage: self.kind,
                    busy_for,
                });
            }
            self.stats.retries += 1;
            trace!(stage = %self.kind, retries = self.stats.retries, "device busy");
            thread::sleep(self.policy.backoff);
        }
    }

    /// Waits for `token`'s operation to finish. The token is consumed.
    pub fn synchronize(
        &mut self,
        token: CompletionToken,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let stage = token.stage();
        match self.backend.synchronize(&token, timeout) {
            SyncStatus::Ready => Ok(()),
            SyncStatus::TimedOut => Err(PipelineError::SyncTimedOut { stage, timeout }),
            SyncStatus::Aborted => Err(PipelineError::Aborted { stage }),
            SyncStatus::DeviceHang => {
                warn!(stage = %stage, token = %token, "device hang reported on synchronize");
                Err(PipelineError::DeviceHang { stage })
            }
            SyncStatus::UnknownToken => Err(PipelineError::UnknownToken(token.to_string())),
        }
    }
}

/// Decides which frames must be encoded as resynchronization points.
#[derive(Debug, Clone, Default)]
pub struct ResyncTracker {
    pending: bool,
    reset_interval: Option<NonZeroU32>,
    frames_seen: u64,
    forced: u64,
}

impl ResyncTracker {
    #[must_use]
    pub fn new(reset_interval: Option<NonZeroU32>) -> Self {
        Self {
            reset_interval,
            ..Self::default()
        }
    }

    /// Records a recovered hang; the next frame becomes a resync point.
    pub fn on_hang(&mut self) {
        self.pending = true;
    }

    pub fn request_resync(&mut self) {
        self.pending = true;
    }

    pub fn set_reset_interval(&mut self, interval: Option<NonZeroU32>) {
        self.reset_interval = interval;
    }

    /// Frames left before the next periodic resync, if one is configured.
    pub fn frames_until_forced(&self) -> Option<u64> {
        let interval = u64::from(self.reset_interval?.get());
        let into_period = self.frames_seen % interval;
        Some(if into_period == 0 { 0 } else { interval - into_period })
    }

    /// Advances to the next frame and reports whether it must be a resync
    /// point. `upstream` carries a request that arrived with the frame.
    pub fn next_frame(&mut self, upstream: bool) -> bool {
        let periodic = self.frames_until_forced() == Some(0) && self.frames_seen > 0;
        let force = self.pending || upstream || periodic;
        self.pending = false;
        self.frames_seen += 1;
        if force {
            self.forced += 1;
        }
        force
    }

    pub fn forced_count(&self) -> u64 {
        self.forced
    }
}
